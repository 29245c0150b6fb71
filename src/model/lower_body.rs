//! 下半身モデル（骨盤・体幹・左右の大腿/下腿/足部）
//!
//! 軸の向き: X = 被験者の右、Y = 前、Z = 上。
//! 股関節・足関節中心は SCoRE、膝の屈伸軸は SARA で求める。
//! `use_functional` が false のときは解剖学的ランドマークで代用する。

use std::collections::HashMap;
use std::fmt;

use crate::calibration::{sara, score};
use crate::config::CalibrationConfig;
use crate::error::{Error, QualityReport, Result};
use crate::geometry::AxisName;
use crate::markers::{MarkerId, MarkerNames, MarkerTrajectory};
use crate::model::segment::{AxisSequence, MarkerSpec, SegmentSpec};
use crate::model::spec::{AxisSpec, CoordinateSystemSpec, PointSpec};
use crate::model::{FrozenModel, KinematicModel, GROUND};

/// 機能的試行の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FunctionalJoint {
    LeftHip,
    LeftKnee,
    LeftAnkle,
    RightHip,
    RightKnee,
    RightAnkle,
}

impl FunctionalJoint {
    pub const ALL: [FunctionalJoint; 6] = [
        FunctionalJoint::LeftHip,
        FunctionalJoint::LeftKnee,
        FunctionalJoint::LeftAnkle,
        FunctionalJoint::RightHip,
        FunctionalJoint::RightKnee,
        FunctionalJoint::RightAnkle,
    ];

    /// 試行ファイル名の接尾辞
    pub fn suffix(self) -> &'static str {
        match self {
            FunctionalJoint::LeftHip => "func_lhip",
            FunctionalJoint::LeftKnee => "func_lknee",
            FunctionalJoint::LeftAnkle => "func_lankle",
            FunctionalJoint::RightHip => "func_rhip",
            FunctionalJoint::RightKnee => "func_rknee",
            FunctionalJoint::RightAnkle => "func_rankle",
        }
    }
}

impl fmt::Display for FunctionalJoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FunctionalJoint::LeftHip => "left hip",
            FunctionalJoint::LeftKnee => "left knee",
            FunctionalJoint::LeftAnkle => "left ankle",
            FunctionalJoint::RightHip => "right hip",
            FunctionalJoint::RightKnee => "right knee",
            FunctionalJoint::RightAnkle => "right ankle",
        };
        f.write_str(name)
    }
}

/// 静的試行のファイル名接尾辞
pub const STATIC_SUFFIX: &str = "static";

/// 被験者1人分のキャリブレーション試行
#[derive(Debug, Clone)]
pub struct CalibrationTrials {
    pub static_trial: MarkerTrajectory,
    pub functional: HashMap<FunctionalJoint, MarkerTrajectory>,
}

impl CalibrationTrials {
    pub fn new(static_trial: MarkerTrajectory) -> Self {
        Self { static_trial, functional: HashMap::new() }
    }

    pub fn with_functional(mut self, joint: FunctionalJoint, trial: MarkerTrajectory) -> Self {
        self.functional.insert(joint, trial);
        self
    }

    /// 各試行のラベルを一度だけ照合し、正規ラベルの試行に置き換える
    ///
    /// 静的試行には全マーカーが必要。機能的試行は見つかったものだけ残す。
    pub fn relabeled(&self) -> Result<Self> {
        let names = MarkerNames::resolve(self.static_trial.names())?;
        let static_trial = names.relabel(&self.static_trial)?;
        let mut functional = HashMap::with_capacity(self.functional.len());
        for (&joint, trial) in &self.functional {
            let names = MarkerNames::resolve_available(trial.names())?;
            log::debug!("{}: {} of {} labels resolved", joint, names.len(), trial.marker_count());
            functional.insert(joint, names.relabel(trial)?);
        }
        Ok(Self { static_trial, functional })
    }

    pub fn functional(&self, joint: FunctionalJoint) -> Result<&MarkerTrajectory> {
        self.functional
            .get(&joint)
            .ok_or_else(|| Error::MissingFunctionalTrial(joint.suffix().to_string()))
    }
}

/// 片脚分のマーカー
struct Leg {
    prefix: &'static str,
    thigh: [MarkerId; 3],
    knee: MarkerId,
    knee_medial: MarkerId,
    shank: [MarkerId; 3],
    ankle: MarkerId,
    ankle_medial: MarkerId,
    foot: [MarkerId; 4],
    heel: MarkerId,
    toe: MarkerId,
    hip_joint: FunctionalJoint,
    knee_joint: FunctionalJoint,
    ankle_joint: FunctionalJoint,
}

const LEFT: Leg = Leg {
    prefix: "L",
    thigh: [MarkerId::Lthi, MarkerId::Lthib, MarkerId::Lthid],
    knee: MarkerId::Lknee,
    knee_medial: MarkerId::Lkneem,
    shank: [MarkerId::Ltib, MarkerId::Ltibf, MarkerId::Ltibd],
    ankle: MarkerId::Lank,
    ankle_medial: MarkerId::Lankm,
    foot: [MarkerId::Lhee, MarkerId::Lnav, MarkerId::Ltoe, MarkerId::Ltoe5],
    heel: MarkerId::Lhee,
    toe: MarkerId::Ltoe,
    hip_joint: FunctionalJoint::LeftHip,
    knee_joint: FunctionalJoint::LeftKnee,
    ankle_joint: FunctionalJoint::LeftAnkle,
};

const RIGHT: Leg = Leg {
    prefix: "R",
    thigh: [MarkerId::Rthi, MarkerId::Rthib, MarkerId::Rthid],
    knee: MarkerId::Rknee,
    knee_medial: MarkerId::Rkneem,
    shank: [MarkerId::Rtib, MarkerId::Rtibf, MarkerId::Rtibd],
    ankle: MarkerId::Rank,
    ankle_medial: MarkerId::Rankm,
    foot: [MarkerId::Rhee, MarkerId::Rnav, MarkerId::Rtoe, MarkerId::Rtoe5],
    heel: MarkerId::Rhee,
    toe: MarkerId::Rtoe,
    hip_joint: FunctionalJoint::RightHip,
    knee_joint: FunctionalJoint::RightKnee,
    ankle_joint: FunctionalJoint::RightAnkle,
};

const PELVIS: [MarkerId; 4] = [MarkerId::Lpsi, MarkerId::Rpsi, MarkerId::Lasi, MarkerId::Rasi];

const TRUNK: [MarkerId; 8] = [
    MarkerId::C7,
    MarkerId::C2,
    MarkerId::T6,
    MarkerId::T10,
    MarkerId::S1,
    MarkerId::S3,
    MarkerId::Clav,
    MarkerId::Strn,
];

struct Builder<'a> {
    trials: &'a CalibrationTrials,
    config: &'a CalibrationConfig,
    report: QualityReport,
}

impl<'a> Builder<'a> {
    fn names(&self, ids: &[MarkerId]) -> Vec<String> {
        ids.iter().map(|id| id.label().to_string()).collect()
    }

    fn marker(&self, id: MarkerId) -> PointSpec {
        PointSpec::marker(id.label())
    }

    fn mean(&self, ids: &[MarkerId]) -> PointSpec {
        PointSpec::mean(&self.names(ids))
    }

    fn pelvis(&self) -> SegmentSpec {
        use MarkerId::*;
        SegmentSpec::new(
            "Pelvis",
            GROUND,
            CoordinateSystemSpec::new(
                self.mean(&PELVIS),
                AxisSpec::points(AxisName::X, self.mean(&[Lpsi, Lasi]), self.mean(&[Rpsi, Rasi])),
                AxisSpec::points(AxisName::Y, self.mean(&[Lpsi, Rpsi]), self.mean(&[Lasi, Rasi])),
                AxisName::Y,
            ),
        )
        .with_translations(AxisSequence::xyz())
        .with_rotations(AxisSequence::xyz())
        .with_markers(self.names(&PELVIS).into_iter().map(MarkerSpec::both))
    }

    fn trunk(&self) -> SegmentSpec {
        use MarkerId::*;
        SegmentSpec::new(
            "Trunk",
            "Pelvis",
            CoordinateSystemSpec::new(
                self.marker(Clav),
                AxisSpec::points(AxisName::Y, self.mean(&[T10, C7]), self.mean(&[Strn, Clav])),
                AxisSpec::points(AxisName::Z, self.mean(&[T10, Strn]), self.mean(&[C7, Clav])),
                AxisName::Z,
            ),
        )
        .with_translations(AxisSequence::xyz())
        .with_rotations(AxisSequence::xyz())
        .with_markers(self.names(&TRUNK).into_iter().map(MarkerSpec::both))
    }

    /// 股関節中心（SCoRE、なければ同側 ASIS）
    fn hip_center(&mut self, leg: &Leg) -> Result<PointSpec> {
        if !self.config.use_functional {
            return Ok(self.marker(if leg.prefix == "L" { MarkerId::Lasi } else { MarkerId::Rasi }));
        }
        let trial = self.trials.functional(leg.hip_joint)?;
        let center = score(trial, &self.names(&PELVIS), &self.names(&leg.thigh), self.config)?;
        self.check(leg.hip_joint, &center.fit);
        Ok(PointSpec::FunctionalCenter(Box::new(center)))
    }

    /// 膝の屈伸軸と原点（SARA、なければ外側→内側の膝マーカー）
    fn knee_axis(&mut self, leg: &Leg) -> Result<(PointSpec, AxisSpec)> {
        let knee_mid = self.mean(&[leg.knee, leg.knee_medial]);
        // 左右とも被験者の右向き
        let (start, end) = if leg.prefix == "L" {
            (knee_mid.clone(), self.marker(leg.knee_medial))
        } else {
            (self.marker(leg.knee_medial), knee_mid.clone())
        };
        if !self.config.use_functional {
            return Ok((knee_mid, AxisSpec::points(AxisName::X, start, end)));
        }

        let trial = self.trials.functional(leg.knee_joint)?;
        let axis = sara(trial, &self.names(&leg.thigh), &self.names(&leg.shank), self.config)?;
        self.check(leg.knee_joint, &axis.fit);
        let origin = PointSpec::FunctionalAxisPoint { axis: Box::new(axis.clone()), anchor: Box::new(knee_mid) };
        let axis = AxisSpec::Functional { name: AxisName::X, axis: Box::new(axis), hint: Some((start, end)) };
        Ok((origin, axis))
    }

    /// 足関節中心（SCoRE、なければ内外果の中点）
    fn ankle_center(&mut self, leg: &Leg) -> Result<PointSpec> {
        if !self.config.use_functional {
            return Ok(self.mean(&[leg.ankle, leg.ankle_medial]));
        }
        let trial = self.trials.functional(leg.ankle_joint)?;
        let center = score(trial, &self.names(&leg.shank), &self.names(&leg.foot), self.config)?;
        self.check(leg.ankle_joint, &center.fit);
        Ok(PointSpec::FunctionalCenter(Box::new(center)))
    }

    fn check(&mut self, joint: FunctionalJoint, fit: &crate::calibration::FunctionalFit) {
        if let Some(warning) = fit.check(&joint.to_string(), self.config) {
            self.report.push(warning);
        }
    }

    fn leg(&mut self, leg: &Leg) -> Result<[SegmentSpec; 3]> {
        use MarkerId::*;
        let knee_mid = self.mean(&[leg.knee, leg.knee_medial]);
        let ankle_mid = self.mean(&[leg.ankle, leg.ankle_medial]);

        let hip = self.hip_center(leg)?;
        let thigh = SegmentSpec::new(
            format!("{}Thigh", leg.prefix),
            "Pelvis",
            CoordinateSystemSpec::new(
                hip.clone(),
                AxisSpec::points(AxisName::Z, knee_mid, hip),
                AxisSpec::points(AxisName::X, self.marker(Lasi), self.marker(Rasi)),
                AxisName::Z,
            ),
        )
        .with_rotations(AxisSequence::xyz())
        .with_markers(self.names(&leg.thigh).into_iter().map(MarkerSpec::technical))
        .with_markers(self.names(&[leg.knee, leg.knee_medial]).into_iter().map(MarkerSpec::anatomical));

        let (knee_origin, knee_axis) = self.knee_axis(leg)?;
        let shank = SegmentSpec::new(
            format!("{}Shank", leg.prefix),
            format!("{}Thigh", leg.prefix),
            CoordinateSystemSpec::new(
                knee_origin.clone(),
                AxisSpec::points(AxisName::Z, ankle_mid, knee_origin),
                knee_axis,
                AxisName::X,
            ),
        )
        .with_rotations(AxisSequence::new(vec![AxisName::X])?)
        .with_markers(self.names(&leg.shank).into_iter().map(MarkerSpec::technical))
        .with_markers(self.names(&[leg.ankle, leg.ankle_medial]).into_iter().map(MarkerSpec::anatomical));

        let ankle = self.ankle_center(leg)?;
        let (lateral_to_medial, medial_to_lateral) = (
            (self.marker(leg.ankle), self.marker(leg.ankle_medial)),
            (self.marker(leg.ankle_medial), self.marker(leg.ankle)),
        );
        let (start, end) = if leg.prefix == "L" { lateral_to_medial } else { medial_to_lateral };
        let foot = SegmentSpec::new(
            format!("{}Foot", leg.prefix),
            format!("{}Shank", leg.prefix),
            CoordinateSystemSpec::new(
                ankle,
                AxisSpec::points(AxisName::Z, self.marker(leg.toe), self.marker(leg.heel)),
                AxisSpec::points(AxisName::X, start, end),
                AxisName::X,
            ),
        )
        .with_rotations(AxisSequence::new(vec![AxisName::X, AxisName::Z])?)
        .with_markers(self.names(&leg.foot).into_iter().map(MarkerSpec::technical));

        Ok([thigh, shank, foot])
    }
}

/// 下半身モデルを構築し、静的試行で解決する
///
/// 機能的キャリブレーションの悪条件は警告として返し、処理は止めない。
pub fn generate_lower_body_model(
    trials: &CalibrationTrials,
    config: &CalibrationConfig,
) -> Result<(FrozenModel, QualityReport)> {
    let trials = trials.relabeled()?;
    let mut builder = Builder { trials: &trials, config, report: QualityReport::new() };

    let mut model = KinematicModel::new();
    model.add_segment(builder.pelvis())?;
    model.add_segment(builder.trunk())?;
    for leg in [&LEFT, &RIGHT] {
        for segment in builder.leg(leg)? {
            model.add_segment(segment)?;
        }
    }

    log::info!(
        "Resolving lower-body model ({} segments, {} DoF, functional={})",
        model.segments().len(),
        model.nb_q(),
        config.use_functional
    );
    let frozen = model.resolve(&trials.static_trial)?;
    Ok((frozen, builder.report))
}
