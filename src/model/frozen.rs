use nalgebra::{DMatrix, DVector, IsometryMatrix3, Rotation3, Translation3, Unit, Vector3};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::geometry::CoordinateSystem;
use crate::model::segment::AxisSequence;
use crate::model::GROUND;

/// 解決済みマーカー（セグメント座標系での位置）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrozenMarker {
    pub name: String,
    pub position: Vector3<f64>,
    pub is_technical: bool,
    pub is_anatomical: bool,
}

/// 解決済みセグメント
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrozenSegment {
    pub name: String,
    pub parent: String,
    pub translations: AxisSequence,
    pub rotations: AxisSequence,
    /// 静的試行時のグローバル座標系
    pub coordinate_system: CoordinateSystem,
    pub markers: Vec<FrozenMarker>,
}

impl FrozenSegment {
    pub fn nb_dof(&self) -> usize {
        self.translations.len() + self.rotations.len()
    }
}

#[derive(Serialize, Deserialize)]
struct ModelDescription {
    segments: Vec<FrozenSegment>,
}

/// 木構造から導出される順運動学用の情報
#[derive(Debug, Clone, PartialEq)]
struct Link {
    parent: Option<usize>,
    /// 親座標系から見た q = 0 でのセグメント座標系
    local: IsometryMatrix3<f64>,
    q_offset: usize,
}

/// 一般化座標1つ分の運動（グローバル座標）
#[derive(Debug, Clone, Copy)]
struct DofMotion {
    segment: usize,
    axis: Vector3<f64>,
    pivot: Vector3<f64>,
    revolute: bool,
}

/// 静的試行に束縛された不変のモデル
///
/// 被験者ごとに一度作成し、全運動試行で共有する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ModelDescription", into = "ModelDescription")]
pub struct FrozenModel {
    segments: Vec<FrozenSegment>,
    links: Vec<Link>,
    nb_q: usize,
}

impl FrozenModel {
    /// 親が先に並んだセグメント列から作成し、木構造を検証する
    pub fn new(segments: Vec<FrozenSegment>) -> Result<Self> {
        let mut links: Vec<Link> = Vec::with_capacity(segments.len());
        let mut nb_q = 0;
        let mut roots = 0;

        for (i, segment) in segments.iter().enumerate() {
            if segments[..i].iter().any(|s| s.name == segment.name) {
                return Err(Error::DuplicateSegment(segment.name.clone()));
            }
            let parent = if segment.parent == GROUND {
                roots += 1;
                None
            } else {
                // 自分より前にない親は未知（循環もここで弾かれる）
                let index = segments[..i]
                    .iter()
                    .position(|s| s.name == segment.parent)
                    .ok_or_else(|| Error::UnknownParent { segment: segment.name.clone(), parent: segment.parent.clone() })?;
                Some(index)
            };

            let global = segment.coordinate_system.to_isometry();
            let local = match parent {
                Some(p) => segments[p].coordinate_system.to_isometry().inverse() * global,
                None => global,
            };
            links.push(Link { parent, local, q_offset: nb_q });
            nb_q += segment.nb_dof();
        }

        if roots != 1 {
            return Err(Error::InvalidTree(format!("expected exactly one segment attached to {}, found {}", GROUND, roots)));
        }

        Ok(Self { segments, links, nb_q })
    }

    pub fn segments(&self) -> &[FrozenSegment] {
        &self.segments
    }

    pub fn segment(&self, name: &str) -> Option<&FrozenSegment> {
        self.segments.iter().find(|s| s.name == name)
    }

    pub fn nb_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn nb_q(&self) -> usize {
        self.nb_q
    }

    /// 親セグメントの添字（Ground なら None）
    pub fn parent_index(&self, segment: usize) -> Option<usize> {
        self.links[segment].parent
    }

    /// q の並びと同じ順の自由度名 ("LThigh_RotX" など)
    pub fn dof_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(self.nb_q);
        for s in &self.segments {
            for a in s.translations.axes() {
                names.push(format!("{}_Trans{}", s.name, a.to_string().to_uppercase()));
            }
            for a in s.rotations.axes() {
                names.push(format!("{}_Rot{}", s.name, a.to_string().to_uppercase()));
            }
        }
        names
    }

    /// IK の観測に使うマーカー名（セグメント順）
    pub fn technical_marker_names(&self) -> Vec<String> {
        self.technical_markers_iter().map(|(_, m)| m.name.clone()).collect()
    }

    pub fn nb_technical_markers(&self) -> usize {
        self.technical_markers_iter().count()
    }

    fn technical_markers_iter(&self) -> impl Iterator<Item = (usize, &FrozenMarker)> {
        self.segments
            .iter()
            .enumerate()
            .flat_map(|(i, s)| s.markers.iter().filter(|m| m.is_technical).map(move |m| (i, m)))
    }

    fn check_q(&self, q: &DVector<f64>) -> Result<()> {
        if q.len() != self.nb_q {
            return Err(Error::DofMismatch { expected: self.nb_q, actual: q.len() });
        }
        Ok(())
    }

    /// 各セグメントのグローバル姿勢と自由度ごとの運動軸
    fn kinematics(&self, q: &DVector<f64>) -> (Vec<IsometryMatrix3<f64>>, Vec<DofMotion>) {
        let mut globals: Vec<IsometryMatrix3<f64>> = Vec::with_capacity(self.segments.len());
        let mut motions = Vec::with_capacity(self.nb_q);

        for (i, (segment, link)) in self.segments.iter().zip(&self.links).enumerate() {
            let base = match link.parent {
                Some(p) => globals[p] * link.local,
                None => link.local,
            };
            let mut dof = link.q_offset;

            // 並進（親側で固定された軸方向）
            let mut translation = Vector3::zeros();
            for a in segment.translations.axes() {
                let axis = base.rotation * a.unit();
                motions.push(DofMotion { segment: i, axis, pivot: Vector3::zeros(), revolute: false });
                translation += a.unit() * q[dof];
                dof += 1;
            }
            let mut frame = base * Translation3::from(translation);

            // 回転（宣言順の内因性回転）
            for a in segment.rotations.axes() {
                let axis = frame.rotation * a.unit();
                motions.push(DofMotion { segment: i, axis, pivot: frame.translation.vector, revolute: true });
                frame *= Rotation3::from_axis_angle(&Unit::new_unchecked(a.unit()), q[dof]);
                dof += 1;
            }
            globals.push(frame);
        }
        (globals, motions)
    }

    /// q でのセグメント座標系（グローバル）
    pub fn segment_coordinate_systems(&self, q: &DVector<f64>) -> Result<Vec<CoordinateSystem>> {
        self.check_q(q)?;
        let (globals, _) = self.kinematics(q);
        Ok(globals.iter().map(CoordinateSystem::from_isometry).collect())
    }

    /// q でのテクニカルマーカー位置（グローバル）
    pub fn technical_markers(&self, q: &DVector<f64>) -> Result<Vec<Vector3<f64>>> {
        self.check_q(q)?;
        let (globals, _) = self.kinematics(q);
        Ok(self
            .technical_markers_iter()
            .map(|(s, m)| globals[s] * nalgebra::Point3::from(m.position))
            .map(|p| p.coords)
            .collect())
    }

    /// テクニカルマーカー位置と解析的ヤコビアン (3M × nb_q)
    ///
    /// 回転自由度の列は ω × (p − pivot)、並進自由度の列は軸方向。
    pub fn technical_markers_jacobian(&self, q: &DVector<f64>) -> Result<(Vec<Vector3<f64>>, DMatrix<f64>)> {
        self.check_q(q)?;
        let (globals, motions) = self.kinematics(q);

        let markers: Vec<(usize, Vector3<f64>)> = self
            .technical_markers_iter()
            .map(|(s, m)| (s, (globals[s] * nalgebra::Point3::from(m.position)).coords))
            .collect();

        let mut jacobian = DMatrix::zeros(3 * markers.len(), self.nb_q);
        for (row, (segment, p)) in markers.iter().enumerate() {
            for (col, motion) in motions.iter().enumerate() {
                if !self.is_ancestor_or_self(motion.segment, *segment) {
                    continue;
                }
                let d = if motion.revolute { motion.axis.cross(&(p - motion.pivot)) } else { motion.axis };
                for k in 0..3 {
                    jacobian[(3 * row + k, col)] = d[k];
                }
            }
        }
        Ok((markers.into_iter().map(|(_, p)| p).collect(), jacobian))
    }

    fn is_ancestor_or_self(&self, ancestor: usize, mut segment: usize) -> bool {
        loop {
            if segment == ancestor {
                return true;
            }
            match self.links[segment].parent {
                Some(p) => segment = p,
                None => return false,
            }
        }
    }
}

impl TryFrom<ModelDescription> for FrozenModel {
    type Error = Error;

    fn try_from(description: ModelDescription) -> Result<Self> {
        Self::new(description.segments)
    }
}

impl From<FrozenModel> for ModelDescription {
    fn from(model: FrozenModel) -> Self {
        Self { segments: model.segments }
    }
}
