use nalgebra::Point3;

use crate::error::{Error, Result};
use crate::markers::{MarkerTrajectory, StaticPositions};
use crate::model::frozen::{FrozenMarker, FrozenModel, FrozenSegment};
use crate::model::segment::SegmentSpec;
use crate::model::GROUND;

/// 静的試行に束縛される前のモデル（テンプレート）
#[derive(Debug, Clone, Default)]
pub struct KinematicModel {
    segments: Vec<SegmentSpec>,
}

impl KinematicModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// 親→子の順に追加する。親は Ground か追加済みのセグメント
    pub fn add_segment(&mut self, segment: SegmentSpec) -> Result<()> {
        if segment.name == GROUND || self.segments.iter().any(|s| s.name == segment.name) {
            return Err(Error::DuplicateSegment(segment.name));
        }
        if segment.parent != GROUND && !self.segments.iter().any(|s| s.name == segment.parent) {
            return Err(Error::UnknownParent { segment: segment.name, parent: segment.parent });
        }
        self.segments.push(segment);
        Ok(())
    }

    pub fn segments(&self) -> &[SegmentSpec] {
        &self.segments
    }

    pub fn nb_q(&self) -> usize {
        self.segments.iter().map(|s| s.nb_dof()).sum()
    }

    /// 静的試行に束縛して不変モデルを作る
    ///
    /// 静的試行は各マーカーの欠損を除いたフレーム平均で代表させる。
    pub fn resolve(&self, static_trial: &MarkerTrajectory) -> Result<FrozenModel> {
        self.resolve_positions(&static_trial.static_positions())
    }

    pub fn resolve_positions(&self, positions: &StaticPositions) -> Result<FrozenModel> {
        let mut frozen = Vec::with_capacity(self.segments.len());

        for spec in &self.segments {
            let coordinate_system = spec.coordinate_system.resolve(&spec.name, positions)?;
            let to_local = coordinate_system.to_isometry().inverse();

            let markers = spec
                .markers
                .iter()
                .map(|m| {
                    let global = positions.get(&m.name)?;
                    Ok(FrozenMarker {
                        name: m.name.clone(),
                        position: (to_local * Point3::from(global)).coords,
                        is_technical: m.is_technical,
                        is_anatomical: m.is_anatomical,
                    })
                })
                .collect::<Result<Vec<_>>>()?;

            log::debug!(
                "{}: origin={:?} dof={} markers={}",
                spec.name,
                coordinate_system.origin.as_slice(),
                spec.nb_dof(),
                markers.len()
            );
            frozen.push(FrozenSegment {
                name: spec.name.clone(),
                parent: spec.parent.clone(),
                translations: spec.translations.clone(),
                rotations: spec.rotations.clone(),
                coordinate_system,
                markers,
            });
        }

        let model = FrozenModel::new(frozen)?;
        if model.nb_q() != self.nb_q() {
            return Err(Error::DofMismatch { expected: self.nb_q(), actual: model.nb_q() });
        }
        Ok(model)
    }
}
