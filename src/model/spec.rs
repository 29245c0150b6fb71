//! 座標系の記号的な定義（静的試行に束縛される前）
//!
//! マーカー名や機能的キャリブレーション結果を参照するだけで、数値は
//! [`CoordinateSystemSpec::resolve`] を呼ぶまで決まらない。

use nalgebra::Vector3;

use crate::calibration::{JointAxis, JointCenter};
use crate::error::{Error, Result};
use crate::geometry::{AxisName, CoordinateSystem};
use crate::markers::StaticPositions;

/// 点の定義
#[derive(Debug, Clone)]
pub enum PointSpec {
    Marker(String),
    /// 複数マーカーの平均
    Mean(Vec<String>),
    /// SCoRE の関節中心
    FunctionalCenter(Box<JointCenter>),
    /// SARA の軸上で anchor に最も近い点
    FunctionalAxisPoint { axis: Box<JointAxis>, anchor: Box<PointSpec> },
}

impl PointSpec {
    pub fn marker(name: impl Into<String>) -> Self {
        Self::Marker(name.into())
    }

    pub fn mean<S: AsRef<str>>(names: &[S]) -> Self {
        Self::Mean(names.iter().map(|n| n.as_ref().to_string()).collect())
    }

    pub fn resolve(&self, positions: &StaticPositions) -> Result<Vector3<f64>> {
        match self {
            Self::Marker(name) => positions.get(name),
            Self::Mean(names) => positions.mean_of(names),
            Self::FunctionalCenter(center) => center.locate(positions),
            Self::FunctionalAxisPoint { axis, anchor } => {
                let (point, direction) = axis.locate(positions)?;
                let anchor = anchor.resolve(positions)?;
                Ok(point + direction * (anchor - point).dot(&direction))
            }
        }
    }
}

/// 軸の定義
#[derive(Debug, Clone)]
pub enum AxisSpec {
    /// start → end
    Points { name: AxisName, start: PointSpec, end: PointSpec },
    /// SARA の軸。hint を与えると (hint.0 → hint.1) と同じ向きに符号を揃える
    Functional { name: AxisName, axis: Box<JointAxis>, hint: Option<(PointSpec, PointSpec)> },
}

impl AxisSpec {
    pub fn points(name: AxisName, start: PointSpec, end: PointSpec) -> Self {
        Self::Points { name, start, end }
    }

    pub fn name(&self) -> AxisName {
        match self {
            Self::Points { name, .. } | Self::Functional { name, .. } => *name,
        }
    }

    pub fn resolve(&self, positions: &StaticPositions) -> Result<Vector3<f64>> {
        match self {
            Self::Points { start, end, .. } => Ok(end.resolve(positions)? - start.resolve(positions)?),
            Self::Functional { axis, hint, .. } => {
                let (_, direction) = axis.locate(positions)?;
                match hint {
                    Some((start, end)) => {
                        let reference = end.resolve(positions)? - start.resolve(positions)?;
                        Ok(if direction.dot(&reference) < 0.0 { -direction } else { direction })
                    }
                    None => Ok(direction),
                }
            }
        }
    }
}

/// セグメント座標系の定義
#[derive(Debug, Clone)]
pub struct CoordinateSystemSpec {
    pub origin: PointSpec,
    pub first_axis: AxisSpec,
    pub second_axis: AxisSpec,
    pub axis_to_keep: AxisName,
}

impl CoordinateSystemSpec {
    pub fn new(origin: PointSpec, first_axis: AxisSpec, second_axis: AxisSpec, axis_to_keep: AxisName) -> Self {
        Self { origin, first_axis, second_axis, axis_to_keep }
    }

    /// 静的試行の代表位置に束縛して数値の座標系を得る
    pub fn resolve(&self, segment: &str, positions: &StaticPositions) -> Result<CoordinateSystem> {
        let origin = self.origin.resolve(positions)?;
        let first = self.first_axis.resolve(positions)?;
        let second = self.second_axis.resolve(positions)?;

        CoordinateSystem::from_axes(
            origin,
            (self.first_axis.name(), first),
            (self.second_axis.name(), second),
            self.axis_to_keep,
        )
        .map_err(|e| Error::DegenerateAxis { segment: segment.to_string(), reason: e.to_string() })
    }
}
