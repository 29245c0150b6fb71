use nalgebra::{IsometryMatrix3, Matrix3, Rotation3, Translation3, Vector3};
use serde::{Deserialize, Serialize};

/// 第2特異値がこれ未満のクラスタは向きが定まらない（一直線上など）
const MIN_SPREAD: f64 = 1e-10;

/// 剛体マーカークラスタのテクニカル座標系
///
/// 基準フレームでの重心を原点、グローバル軸と平行な軸をとり、
/// 各マーカーの局所座標を保持する。任意フレームへは Kabsch 法で当てはめる。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterShape {
    pub marker_names: Vec<String>,
    pub local: Vec<Vector3<f64>>,
}

impl ClusterShape {
    /// 基準フレームのマーカー位置からクラスタ形状を作成
    pub fn from_points(marker_names: Vec<String>, points: &[Vector3<f64>]) -> Self {
        let centroid = centroid(points);
        let local = points.iter().map(|p| p - centroid).collect();
        Self { marker_names, local }
    }

    pub fn len(&self) -> usize {
        self.local.len()
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_empty()
    }

    /// 観測位置へ最小二乗で剛体当てはめ（局所 → グローバル変換）
    ///
    /// 欠損を含む・3点未満・退化した配置では None
    pub fn fit(&self, points: &[Vector3<f64>]) -> Option<IsometryMatrix3<f64>> {
        if points.len() != self.local.len() || points.len() < 3 {
            return None;
        }
        if points.iter().any(|p| !p.iter().all(|v| v.is_finite())) {
            return None;
        }

        let c = centroid(points);
        // H = Σ l_j (p_j - c)^T
        let mut h = Matrix3::zeros();
        for (l, p) in self.local.iter().zip(points) {
            h += l * (p - c).transpose();
        }

        let svd = h.svd(true, true);
        if svd.singular_values[1] < MIN_SPREAD {
            return None;
        }
        let u = svd.u?;
        let v = svd.v_t?.transpose();

        // 反射を除く
        let d = (v * u.transpose()).determinant().signum();
        let correction = Matrix3::from_diagonal(&Vector3::new(1.0, 1.0, d));
        let r = v * correction * u.transpose();

        Some(IsometryMatrix3::from_parts(
            Translation3::from(c),
            Rotation3::from_matrix_unchecked(r),
        ))
    }

    /// 当てはめ後の RMS 残差（メートル）
    pub fn fit_residual(&self, points: &[Vector3<f64>], pose: &IsometryMatrix3<f64>) -> f64 {
        let sum: f64 = self
            .local
            .iter()
            .zip(points)
            .map(|(l, p)| (pose.rotation * l + pose.translation.vector - p).norm_squared())
            .sum();
        (sum / self.local.len().max(1) as f64).sqrt()
    }
}

fn centroid(points: &[Vector3<f64>]) -> Vector3<f64> {
    points.iter().sum::<Vector3<f64>>() / points.len().max(1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point3;

    fn cluster_points() -> Vec<Vector3<f64>> {
        vec![
            Vector3::new(0.05, 0.0, 0.5),
            Vector3::new(-0.04, 0.03, 0.45),
            Vector3::new(0.0, -0.05, 0.4),
            Vector3::new(0.02, 0.04, 0.35),
        ]
    }

    #[test]
    fn test_fit_reference_is_identity() {
        let points = cluster_points();
        let shape = ClusterShape::from_points(vec!["a".into(), "b".into(), "c".into(), "d".into()], &points);
        let pose = shape.fit(&points).unwrap();
        assert!((pose.rotation.matrix() - Matrix3::identity()).norm() < 1e-12);
        assert!(shape.fit_residual(&points, &pose) < 1e-12);
    }

    #[test]
    fn test_fit_recovers_rigid_motion() {
        let points = cluster_points();
        let shape = ClusterShape::from_points(vec!["a".into(), "b".into(), "c".into(), "d".into()], &points);

        let rotation = Rotation3::from_euler_angles(0.3, -0.2, 0.7);
        let translation = Vector3::new(0.1, -0.3, 0.2);
        let moved: Vec<Vector3<f64>> = points.iter().map(|p| rotation * p + translation).collect();

        let pose = shape.fit(&moved).unwrap();
        assert!((pose.rotation.matrix() - rotation.matrix()).norm() < 1e-10);
        for (l, p) in shape.local.iter().zip(&moved) {
            let mapped = pose * Point3::from(*l);
            assert!((mapped.coords - p).norm() < 1e-10);
        }
    }

    #[test]
    fn test_fit_rejects_occlusion() {
        let points = cluster_points();
        let shape = ClusterShape::from_points(vec!["a".into(), "b".into(), "c".into(), "d".into()], &points);
        let mut occluded = points.clone();
        occluded[2] = Vector3::repeat(f64::NAN);
        assert!(shape.fit(&occluded).is_none());
    }

    #[test]
    fn test_fit_rejects_collinear() {
        let points = vec![Vector3::zeros(), Vector3::x(), Vector3::x() * 2.0];
        let shape = ClusterShape::from_points(vec!["a".into(), "b".into(), "c".into()], &points);
        assert!(shape.fit(&points).is_none());
    }
}
