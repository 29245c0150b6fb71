use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::calibration::{fit_cluster, FunctionalFit, RelativeMotion};
use crate::config::CalibrationConfig;
use crate::error::{Error, Result};
use crate::geometry::ClusterShape;
use crate::markers::{MarkerTrajectory, StaticPositions};

/// 方向ベクトルとして扱える最小ノルム
const MIN_DIRECTION_NORM: f64 = 1e-8;

/// SARA で推定した関節軸
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JointAxis {
    pub parent: ClusterShape,
    pub child: ClusterShape,
    pub parent_point: Vector3<f64>,
    pub parent_direction: Vector3<f64>,
    pub child_point: Vector3<f64>,
    pub child_direction: Vector3<f64>,
    pub fit: FunctionalFit,
}

impl JointAxis {
    /// 静的試行での軸上の点と単位方向
    ///
    /// 親・子それぞれから見た結果を平均する。方向の符号は親側に揃える。
    pub fn locate(&self, positions: &StaticPositions) -> Result<(Vector3<f64>, Vector3<f64>)> {
        let p = fit_cluster(&self.parent, positions)?;
        let c = fit_cluster(&self.child, positions)?;

        let point = (p.rotation * self.parent_point
            + p.translation.vector
            + c.rotation * self.child_point
            + c.translation.vector)
            * 0.5;

        let from_parent = p.rotation * self.parent_direction;
        let mut from_child = c.rotation * self.child_direction;
        if from_parent.dot(&from_child) < 0.0 {
            from_child = -from_child;
        }
        let direction = (from_parent + from_child)
            .try_normalize(MIN_DIRECTION_NORM)
            .ok_or_else(|| Error::ClusterFitFailed(self.child.marker_names.clone()))?;

        Ok((point, direction))
    }
}

/// Symmetrical Axis of Rotation Approach
///
/// SCoRE と同じ連立方程式の最小特異値に対応する右特異ベクトルを軸方向とし、
/// その成分を除いた擬似逆行列で軸上の1点を求める。
pub fn sara<S: AsRef<str>>(
    trial: &MarkerTrajectory,
    parent_markers: &[S],
    child_markers: &[S],
    config: &CalibrationConfig,
) -> Result<JointAxis> {
    let motion = RelativeMotion::collect(trial, parent_markers, child_markers, config)?;
    let (a, b) = motion.linear_system();

    let svd = a.svd(true, true);
    let (Some(u), Some(v_t)) = (svd.u.as_ref(), svd.v_t.as_ref()) else {
        return Err(Error::InsufficientFrames { required: config.min_frames, available: motion.poses.len() });
    };

    // 特異値を降順に並べた添字
    let sv = &svd.singular_values;
    let mut order: Vec<usize> = (0..sv.len()).collect();
    order.sort_by(|&i, &j| sv[j].total_cmp(&sv[i]));
    let (rank, null) = order.split_at(5);
    let largest = sv[rank[0]];
    let fifth = sv[rank[4]];
    let condition_number = if fifth > 0.0 { largest / fifth } else { f64::INFINITY };
    // 蝶番なら最小特異値だけが 0 に落ちる
    let axis_ratio = if fifth > 0.0 { sv[null[0]] / fifth } else { f64::INFINITY };

    let axis = v_t.row(null[0]).transpose();
    let parent_direction = Vector3::new(axis[0], axis[1], axis[2]);
    let child_direction = Vector3::new(axis[3], axis[4], axis[5]);
    let (Some(parent_direction), Some(child_direction)) = (
        parent_direction.try_normalize(MIN_DIRECTION_NORM),
        child_direction.try_normalize(MIN_DIRECTION_NORM),
    ) else {
        return Err(Error::DegenerateAxis {
            segment: motion.child.marker_names.join(","),
            reason: "functional axis has no component in one of the clusters".to_string(),
        });
    };

    // 軸方向を除いた最小ノルム解
    let mut x = nalgebra::DVector::<f64>::zeros(6);
    for &i in rank {
        if sv[i] > 0.0 {
            let coeff = u.column(i).dot(&b) / sv[i];
            x += v_t.row(i).transpose() * coeff;
        }
    }
    let parent_point = Vector3::new(x[0], x[1], x[2]);
    let child_point = Vector3::new(x[3], x[4], x[5]);
    let residual = motion.point_residual(&parent_point, &child_point);

    let fit = FunctionalFit { condition_number, residual, frames_used: motion.poses.len(), axis_ratio: Some(axis_ratio) };
    log::debug!(
        "SARA: cond={:.3e} residual={:.5} m axis ratio={:.3e} frames={}",
        condition_number,
        residual,
        axis_ratio,
        fit.frames_used
    );

    Ok(JointAxis {
        parent: motion.parent,
        child: motion.child,
        parent_point,
        parent_direction,
        child_point,
        child_direction,
        fit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::score;
    use crate::calibration::synthetic::{self, CHILD, PARENT};

    fn config() -> CalibrationConfig {
        CalibrationConfig::default()
    }

    fn knee() -> (Vector3<f64>, Vector3<f64>) {
        (Vector3::new(-0.15, 0.05, 0.5), Vector3::new(1.0, 0.1, 0.05).normalize())
    }

    #[test]
    fn test_sara_recovers_hinge_axis() {
        let (center, axis) = knee();
        let trial = synthetic::trial(200, synthetic::hinge(center, axis));

        let joint = sara(&trial, &PARENT, &CHILD, &config()).unwrap();
        assert!(!joint.fit.is_ill_conditioned(&config()), "{:?}", joint.fit);
        assert!(joint.fit.axis_ratio.unwrap() < 1e-6);

        let statics = trial.slice_frames(0..1).static_positions();
        let (point, direction) = joint.locate(&statics).unwrap();
        assert!((direction.dot(&axis).abs() - 1.0).abs() < 1e-6, "direction {:?}", direction);
        // 点は軸上のどこか
        assert!((point - center).cross(&axis).norm() < 1e-6, "point {:?}", point);
    }

    #[test]
    fn test_sara_direction_is_unit_in_moved_frame() {
        let (center, axis) = knee();
        let trial = synthetic::trial(200, synthetic::hinge(center, axis));
        let joint = sara(&trial, &PARENT, &CHILD, &config()).unwrap();

        let frame = 80;
        let statics = trial.slice_frames(frame..frame + 1).static_positions();
        let (point, direction) = joint.locate(&statics).unwrap();
        let (r, t) = synthetic::parent_pose(frame);
        let expected_axis = r * axis;
        let expected_center = r * center + t;
        assert!((direction.norm() - 1.0).abs() < 1e-12);
        assert!((direction.dot(&expected_axis).abs() - 1.0).abs() < 1e-6);
        assert!((point - expected_center).cross(&expected_axis).norm() < 1e-6);
    }

    #[test]
    fn test_score_on_hinge_is_ill_conditioned() {
        // 蝶番運動では中心が軸方向に定まらない
        let (center, axis) = knee();
        let trial = synthetic::trial(200, synthetic::hinge(center, axis));
        let joint = score(&trial, &PARENT, &CHILD, &config()).unwrap();
        assert!(joint.fit.condition_number > config().max_condition_number);
    }

    #[test]
    fn test_sara_flags_ball_joint() {
        // 3軸回転には固定軸がない
        let trial = synthetic::trial(200, synthetic::ball_joint(Vector3::new(-0.1, 0.05, 0.85)));
        let joint = sara(&trial, &PARENT, &CHILD, &config()).unwrap();
        assert!(joint.fit.axis_ratio.unwrap() > config().max_axis_ratio, "{:?}", joint.fit);
        assert!(joint.fit.check("ball", &config()).is_some());
    }

    #[test]
    fn test_sara_flags_no_relative_motion() {
        let trial = synthetic::trial(100, |_, m| *m);
        let joint = sara(&trial, &PARENT, &CHILD, &config()).unwrap();
        assert!(joint.fit.is_ill_conditioned(&config()), "{:?}", joint.fit);
    }

    #[test]
    fn test_sara_missing_child_marker() {
        let (center, axis) = knee();
        let trial = synthetic::trial(50, synthetic::hinge(center, axis));
        let result = sara(&trial, &PARENT, &["C1", "C9", "C3"], &config());
        assert_eq!(result.unwrap_err(), Error::MarkerNotFound("C9".to_string()));
    }
}
