//! 機能的キャリブレーション（SCoRE / SARA）
//!
//! 親・子セグメントのマーカークラスタを全フレームで剛体当てはめし、
//! 両クラスタ座標系に固定された共通点（または共通軸）を線形最小二乗で求める。
//!
//! 各フレーム i について
//! `R_p,i · c_p + t_p,i = R_c,i · c_c + t_c,i`
//! を積み上げた `[R_p,i  −R_c,i] [c_p; c_c] = t_c,i − t_p,i` を解く。

pub mod sara;
pub mod score;

use nalgebra::{DMatrix, DVector, IsometryMatrix3, Vector3};
use serde::{Deserialize, Serialize};

use crate::config::CalibrationConfig;
use crate::error::{Error, QualityWarning, Result};
use crate::geometry::ClusterShape;
use crate::markers::{find_unique_suffix, MarkerTrajectory, StaticPositions};

pub use sara::{sara, JointAxis};
pub use score::{score, JointCenter};

/// 回帰の品質指標
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FunctionalFit {
    /// 使用した特異値の最大/最小比
    pub condition_number: f64,
    /// フレームごとの不一致距離の RMS（メートル）
    pub residual: f64,
    /// 両クラスタが当てはめられたフレーム数
    pub frames_used: usize,
    /// SARA のみ: σ6/σ5。固定軸まわりの運動なら 0 に近い
    #[serde(default)]
    pub axis_ratio: Option<f64>,
}

impl FunctionalFit {
    pub fn is_ill_conditioned(&self, config: &CalibrationConfig) -> bool {
        !self.condition_number.is_finite()
            || !self.residual.is_finite()
            || self.condition_number > config.max_condition_number
            || self.residual > config.max_residual
            || self.axis_ratio.map_or(false, |r| !r.is_finite() || r > config.max_axis_ratio)
    }

    /// 悪条件なら警告を返す
    pub fn check(&self, joint: &str, config: &CalibrationConfig) -> Option<QualityWarning> {
        if self.is_ill_conditioned(config) {
            log::warn!(
                "{}: functional calibration is ill-conditioned (cond={:.3e}, residual={:.4} m, axis ratio={:?}, frames={})",
                joint,
                self.condition_number,
                self.residual,
                self.axis_ratio,
                self.frames_used
            );
            Some(QualityWarning::IllConditionedCalibration {
                joint: joint.to_string(),
                condition_number: self.condition_number,
                residual: self.residual,
            })
        } else {
            None
        }
    }
}

/// 親子クラスタの相対運動（フレームごとの局所→グローバル変換）
pub(crate) struct RelativeMotion {
    pub parent: ClusterShape,
    pub child: ClusterShape,
    pub poses: Vec<(IsometryMatrix3<f64>, IsometryMatrix3<f64>)>,
}

impl RelativeMotion {
    pub fn collect<S: AsRef<str>>(
        trial: &MarkerTrajectory,
        parent_markers: &[S],
        child_markers: &[S],
        config: &CalibrationConfig,
    ) -> Result<Self> {
        let parent_idx = resolve_indices(trial, parent_markers)?;
        let child_idx = resolve_indices(trial, child_markers)?;
        let required = config.min_frames.max(2);

        let positions = |indices: &[usize], frame: usize| -> Vec<Vector3<f64>> {
            indices.iter().map(|&m| trial.position(m, frame)).collect()
        };
        let visible = |indices: &[usize], frame: usize| indices.iter().all(|&m| !trial.is_occluded(m, frame));

        // 基準フレーム: 両クラスタの全マーカーが見えている最初のフレーム
        let reference = (0..trial.len())
            .find(|&f| visible(&parent_idx, f) && visible(&child_idx, f))
            .ok_or(Error::InsufficientFrames { required, available: 0 })?;

        let parent = ClusterShape::from_points(names_of(parent_markers), &positions(&parent_idx, reference));
        let child = ClusterShape::from_points(names_of(child_markers), &positions(&child_idx, reference));

        let mut poses = Vec::with_capacity(trial.len());
        for frame in 0..trial.len() {
            let p = parent.fit(&positions(&parent_idx, frame));
            let c = child.fit(&positions(&child_idx, frame));
            if let (Some(p), Some(c)) = (p, c) {
                poses.push((p, c));
            }
        }

        if poses.len() < required {
            return Err(Error::InsufficientFrames { required, available: poses.len() });
        }
        log::debug!(
            "functional trial: {} of {} frames usable (reference frame {})",
            poses.len(),
            trial.len(),
            reference
        );

        Ok(Self { parent, child, poses })
    }

    /// 連立方程式 A x = b を構築 (3N × 6)
    pub fn linear_system(&self) -> (DMatrix<f64>, DVector<f64>) {
        let n = self.poses.len();
        let mut a = DMatrix::zeros(3 * n, 6);
        let mut b = DVector::zeros(3 * n);

        for (i, (p, c)) in self.poses.iter().enumerate() {
            let rp = p.rotation.matrix();
            let rc = c.rotation.matrix();
            let rhs = c.translation.vector - p.translation.vector;
            for row in 0..3 {
                for col in 0..3 {
                    a[(3 * i + row, col)] = rp[(row, col)];
                    a[(3 * i + row, 3 + col)] = -rc[(row, col)];
                }
                b[3 * i + row] = rhs[row];
            }
        }
        (a, b)
    }

    /// 各フレームで親・子から見た点の不一致距離の RMS
    pub fn point_residual(&self, parent_local: &Vector3<f64>, child_local: &Vector3<f64>) -> f64 {
        let sum: f64 = self
            .poses
            .iter()
            .map(|(p, c)| {
                let from_parent = p.rotation * parent_local + p.translation.vector;
                let from_child = c.rotation * child_local + c.translation.vector;
                (from_parent - from_child).norm_squared()
            })
            .sum();
        (sum / self.poses.len() as f64).sqrt()
    }
}

fn resolve_indices<S: AsRef<str>>(trial: &MarkerTrajectory, names: &[S]) -> Result<Vec<usize>> {
    names.iter().map(|n| find_unique_suffix(trial.names(), n.as_ref())).collect()
}

fn names_of<S: AsRef<str>>(names: &[S]) -> Vec<String> {
    names.iter().map(|n| n.as_ref().to_string()).collect()
}

/// クラスタ形状を静的試行のマーカー位置に当てはめる
pub(crate) fn fit_cluster(shape: &ClusterShape, positions: &StaticPositions) -> Result<IsometryMatrix3<f64>> {
    let points = shape
        .marker_names
        .iter()
        .map(|n| positions.get(n))
        .collect::<Result<Vec<_>>>()?;
    shape
        .fit(&points)
        .ok_or_else(|| Error::ClusterFitFailed(shape.marker_names.clone()))
}

#[cfg(test)]
pub(crate) mod synthetic {
    //! テスト用の合成機能的試行
    use super::*;
    use nalgebra::{Rotation3, Unit};
    use ndarray::Array3;

    pub const PARENT: [&str; 4] = ["P1", "P2", "P3", "P4"];
    pub const CHILD: [&str; 3] = ["C1", "C2", "C3"];

    pub fn parent_markers() -> Vec<Vector3<f64>> {
        vec![
            Vector3::new(-0.12, 0.0, 0.95),
            Vector3::new(0.12, 0.0, 0.95),
            Vector3::new(-0.13, 0.18, 0.92),
            Vector3::new(0.13, 0.19, 0.93),
        ]
    }

    pub fn child_markers() -> Vec<Vector3<f64>> {
        vec![
            Vector3::new(-0.18, 0.08, 0.6),
            Vector3::new(-0.12, 0.02, 0.5),
            Vector3::new(-0.15, 0.12, 0.4),
        ]
    }

    /// 親の剛体運動（小さな揺れ）
    pub fn parent_pose(i: usize) -> (Rotation3<f64>, Vector3<f64>) {
        let t = i as f64 * 0.05;
        let rotation = Rotation3::from_euler_angles(0.05 * t.sin(), 0.04 * (0.7 * t).cos() - 0.04, 0.1 * (0.3 * t).sin());
        let translation = Vector3::new(0.02 * t.sin(), 0.3 * t / 5.0, 0.01 * (2.0 * t).sin());
        (rotation, translation)
    }

    /// 親座標系での相対運動で子マーカーを生成した試行を作る
    pub fn trial(frames: usize, relative: impl Fn(usize, &Vector3<f64>) -> Vector3<f64>) -> MarkerTrajectory {
        let parent = parent_markers();
        let child = child_markers();
        let names: Vec<&str> = PARENT.iter().chain(CHILD.iter()).copied().collect();
        let mut data = Array3::zeros((3, names.len(), frames));

        for f in 0..frames {
            let (r, t) = parent_pose(f);
            let points: Vec<Vector3<f64>> = parent
                .iter()
                .map(|p| r * p + t)
                .chain(child.iter().map(|c| r * relative(f, c) + t))
                .collect();
            for (m, p) in points.iter().enumerate() {
                for k in 0..3 {
                    data[[k, m, f]] = p[k];
                }
            }
        }
        MarkerTrajectory::new(names, data, 100.0).unwrap()
    }

    /// 球関節: 中心 center まわりの3軸回転
    pub fn ball_joint(center: Vector3<f64>) -> impl Fn(usize, &Vector3<f64>) -> Vector3<f64> {
        move |f, m| {
            let t = f as f64 * 0.05;
            let r = Rotation3::from_euler_angles(0.5 * t.sin(), 0.4 * (1.3 * t).sin(), 0.3 * (0.7 * t).cos() - 0.3);
            center + r * (m - center)
        }
    }

    /// 蝶番関節: center を通る axis まわりの回転
    pub fn hinge(center: Vector3<f64>, axis: Vector3<f64>) -> impl Fn(usize, &Vector3<f64>) -> Vector3<f64> {
        move |f, m| {
            let t = f as f64 * 0.05;
            let r = Rotation3::from_axis_angle(&Unit::new_normalize(axis), 0.6 * (1.0 - t.cos()));
            center + r * (m - center)
        }
    }
}
