use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::calibration::{fit_cluster, FunctionalFit, RelativeMotion};
use crate::config::CalibrationConfig;
use crate::error::{Error, Result};
use crate::geometry::ClusterShape;
use crate::markers::{MarkerTrajectory, StaticPositions};

/// SCoRE で推定した関節中心
///
/// 親・子それぞれのクラスタ座標系での固定点として保持する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointCenter {
    pub parent: ClusterShape,
    pub child: ClusterShape,
    pub parent_local: Vector3<f64>,
    pub child_local: Vector3<f64>,
    pub fit: FunctionalFit,
}

impl JointCenter {
    /// 静的試行での関節中心（親・子から見た位置の平均）
    pub fn locate(&self, positions: &StaticPositions) -> Result<Vector3<f64>> {
        let p = fit_cluster(&self.parent, positions)?;
        let c = fit_cluster(&self.child, positions)?;
        let from_parent = p.rotation * self.parent_local + p.translation.vector;
        let from_child = c.rotation * self.child_local + c.translation.vector;
        Ok((from_parent + from_child) * 0.5)
    }
}

/// Symmetrical Center of Rotation Estimation
///
/// 全フレームで親・子クラスタに固定された2点の距離二乗和を最小化する点を
/// 線形最小二乗（SVD 擬似逆行列）で求める。
pub fn score<S: AsRef<str>>(
    trial: &MarkerTrajectory,
    parent_markers: &[S],
    child_markers: &[S],
    config: &CalibrationConfig,
) -> Result<JointCenter> {
    let motion = RelativeMotion::collect(trial, parent_markers, child_markers, config)?;
    let (a, b) = motion.linear_system();
    let nrows = a.nrows();

    let svd = a.svd(true, true);
    let sv = &svd.singular_values;
    let largest = sv.max();
    let smallest = sv.min();
    let condition_number = if smallest > 0.0 { largest / smallest } else { f64::INFINITY };

    // 条件が悪くても最小ノルム解は返す（品質判定は呼び出し側で警告）
    let eps = largest * f64::EPSILON * nrows as f64;
    let x = svd
        .solve(&b, eps)
        .map_err(|_| Error::InsufficientFrames { required: config.min_frames, available: motion.poses.len() })?;

    let parent_local = Vector3::new(x[0], x[1], x[2]);
    let child_local = Vector3::new(x[3], x[4], x[5]);
    let residual = motion.point_residual(&parent_local, &child_local);

    let fit = FunctionalFit { condition_number, residual, frames_used: motion.poses.len(), axis_ratio: None };
    log::debug!("SCoRE: cond={:.3e} residual={:.5} m frames={}", condition_number, residual, fit.frames_used);

    Ok(JointCenter { parent: motion.parent, child: motion.child, parent_local, child_local, fit })
}
