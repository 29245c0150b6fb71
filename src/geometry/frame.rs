use std::fmt;
use std::str::FromStr;

use nalgebra::{IsometryMatrix3, Matrix3, Rotation3, Translation3, Vector3};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 長さがこれ未満の軸は定義不能とみなす
const MIN_AXIS_NORM: f64 = 1e-9;

/// 座標軸ラベル
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AxisName {
    X,
    Y,
    Z,
}

impl AxisName {
    pub const ALL: [AxisName; 3] = [AxisName::X, AxisName::Y, AxisName::Z];

    pub fn index(self) -> usize {
        match self {
            AxisName::X => 0,
            AxisName::Y => 1,
            AxisName::Z => 2,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn unit(self) -> Vector3<f64> {
        let mut v = Vector3::zeros();
        v[self.index()] = 1.0;
        v
    }

    /// 右手系で self × next = (残りの軸) となる次の軸
    fn next(self) -> Self {
        Self::ALL[(self.index() + 1) % 3]
    }

    /// 2軸以外の残りの軸
    pub fn third(a: AxisName, b: AxisName) -> Option<AxisName> {
        if a == b {
            return None;
        }
        Self::ALL.iter().copied().find(|&c| c != a && c != b)
    }
}

impl fmt::Display for AxisName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let c = match self {
            AxisName::X => "x",
            AxisName::Y => "y",
            AxisName::Z => "z",
        };
        f.write_str(c)
    }
}

impl TryFrom<char> for AxisName {
    type Error = char;

    fn try_from(c: char) -> Result<Self, Self::Error> {
        match c.to_ascii_lowercase() {
            'x' => Ok(AxisName::X),
            'y' => Ok(AxisName::Y),
            'z' => Ok(AxisName::Z),
            other => Err(other),
        }
    }
}

impl FromStr for AxisName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.trim().chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) => AxisName::try_from(c).map_err(|c| format!("Unknown axis: {}", c)),
            _ => Err(format!("Unknown axis: {}", s)),
        }
    }
}

/// 座標系構築の失敗理由
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DegenerateFrame {
    #[error("both axes are named {0}")]
    SameAxisName(AxisName),
    #[error("axis {0} has zero length")]
    ZeroLength(AxisName),
    #[error("axes {0} and {1} are parallel")]
    Parallel(AxisName, AxisName),
    #[error("origin or axis contains NaN")]
    NotFinite,
    #[error("axis to keep {0} is not one of the input axes")]
    KeepAxisNotInput(AxisName),
}

/// 右手系の外積: a × b が (a, b) 以外の軸方向を向くよう順序を決める
fn right_handed_cross(a_name: AxisName, a: &Vector3<f64>, b_name: AxisName, b: &Vector3<f64>) -> Vector3<f64> {
    if b_name == a_name.next() {
        a.cross(b)
    } else {
        b.cross(a)
    }
}

/// セグメント座標系（グローバル座標での原点 + 正規直交3軸）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoordinateSystem {
    pub origin: Vector3<f64>,
    /// 列が X, Y, Z 軸
    pub axes: Matrix3<f64>,
}

impl CoordinateSystem {
    pub fn identity() -> Self {
        Self { origin: Vector3::zeros(), axes: Matrix3::identity() }
    }

    /// 2本の軸定義から正規直交基底を構築
    ///
    /// - keep 軸は正規化のみで方向をそのまま保持
    /// - 3本目 = keep 軸ともう一方の軸の外積（右手系の順序）
    /// - keep でない入力軸は keep 軸と3本目の外積で再計算
    pub fn from_axes(
        origin: Vector3<f64>,
        first: (AxisName, Vector3<f64>),
        second: (AxisName, Vector3<f64>),
        axis_to_keep: AxisName,
    ) -> Result<Self, DegenerateFrame> {
        let (first_name, first_vec) = first;
        let (second_name, second_vec) = second;
        let third_name = AxisName::third(first_name, second_name).ok_or(DegenerateFrame::SameAxisName(first_name))?;

        if !origin.iter().chain(first_vec.iter()).chain(second_vec.iter()).all(|v| v.is_finite()) {
            return Err(DegenerateFrame::NotFinite);
        }

        let ((kept_name, kept), (other_name, other)) = if axis_to_keep == first_name {
            ((first_name, first_vec), (second_name, second_vec))
        } else if axis_to_keep == second_name {
            ((second_name, second_vec), (first_name, first_vec))
        } else {
            return Err(DegenerateFrame::KeepAxisNotInput(axis_to_keep));
        };

        let kept_norm = kept.norm();
        if kept_norm < MIN_AXIS_NORM {
            return Err(DegenerateFrame::ZeroLength(kept_name));
        }
        if other.norm() < MIN_AXIS_NORM {
            return Err(DegenerateFrame::ZeroLength(other_name));
        }
        let kept = kept.normalize();

        let third = right_handed_cross(kept_name, &kept, other_name, &other);
        let third_norm = third.norm();
        if third_norm < MIN_AXIS_NORM * other.norm() {
            return Err(DegenerateFrame::Parallel(kept_name, other_name));
        }
        let third = third / third_norm;

        let other = right_handed_cross(third_name, &third, kept_name, &kept).normalize();

        let mut axes = Matrix3::zeros();
        axes.set_column(kept_name.index(), &kept);
        axes.set_column(other_name.index(), &other);
        axes.set_column(third_name.index(), &third);

        Ok(Self { origin, axes })
    }

    pub fn axis(&self, name: AxisName) -> Vector3<f64> {
        self.axes.column(name.index()).into_owned()
    }

    pub fn x(&self) -> Vector3<f64> {
        self.axis(AxisName::X)
    }

    pub fn y(&self) -> Vector3<f64> {
        self.axis(AxisName::Y)
    }

    pub fn z(&self) -> Vector3<f64> {
        self.axis(AxisName::Z)
    }

    pub fn to_isometry(&self) -> IsometryMatrix3<f64> {
        IsometryMatrix3::from_parts(
            Translation3::from(self.origin),
            Rotation3::from_matrix_unchecked(self.axes),
        )
    }

    pub fn from_isometry(iso: &IsometryMatrix3<f64>) -> Self {
        Self { origin: iso.translation.vector, axes: *iso.rotation.matrix() }
    }

    /// 各軸が単位長で互いに直交しているか
    pub fn is_orthonormal(&self, tol: f64) -> bool {
        let (x, y, z) = (self.x(), self.y(), self.z());
        (x.norm() - 1.0).abs() < tol
            && (y.norm() - 1.0).abs() < tol
            && (z.norm() - 1.0).abs() < tol
            && x.dot(&y).abs() < tol
            && y.dot(&z).abs() < tol
            && z.dot(&x).abs() < tol
            && (x.cross(&y) - z).norm() < tol
    }
}

/// 複数マーカー位置の単純平均
pub fn mean_markers(points: &[Vector3<f64>]) -> Vector3<f64> {
    if points.is_empty() {
        return Vector3::repeat(f64::NAN);
    }
    points.iter().sum::<Vector3<f64>>() / points.len() as f64
}
