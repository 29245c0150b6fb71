use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::geometry::AxisName;
use crate::model::spec::CoordinateSystemSpec;

/// 並進・回転の自由度として許す軸の並び（宣言順が q の並び）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AxisSequence(Vec<AxisName>);

impl AxisSequence {
    pub fn none() -> Self {
        Self(Vec::new())
    }

    pub fn xyz() -> Self {
        Self(AxisName::ALL.to_vec())
    }

    pub fn new(axes: Vec<AxisName>) -> Result<Self> {
        for (i, a) in axes.iter().enumerate() {
            if axes[..i].contains(a) {
                let text: String = axes.iter().map(|a| a.to_string()).collect();
                return Err(Error::InvalidAxisSequence(text));
            }
        }
        Ok(Self(axes))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn axes(&self) -> &[AxisName] {
        &self.0
    }
}

impl FromStr for AxisSequence {
    type Err = Error;

    /// "xyz", "XZ", "" など
    fn from_str(s: &str) -> Result<Self> {
        let axes = s
            .chars()
            .map(|c| AxisName::try_from(c).map_err(|_| Error::InvalidAxisSequence(s.to_string())))
            .collect::<Result<Vec<_>>>()?;
        Self::new(axes).map_err(|_| Error::InvalidAxisSequence(s.to_string()))
    }
}

impl fmt::Display for AxisSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for a in &self.0 {
            write!(f, "{}", a)?;
        }
        Ok(())
    }
}

impl TryFrom<String> for AxisSequence {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<AxisSequence> for String {
    fn from(seq: AxisSequence) -> Self {
        seq.to_string()
    }
}

/// セグメントに付属するマーカー
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerSpec {
    pub name: String,
    /// IK の観測に使う
    pub is_technical: bool,
    /// 静的形状の定義のみに使う
    pub is_anatomical: bool,
}

impl MarkerSpec {
    pub fn technical(name: impl Into<String>) -> Self {
        Self { name: name.into(), is_technical: true, is_anatomical: false }
    }

    pub fn anatomical(name: impl Into<String>) -> Self {
        Self { name: name.into(), is_technical: false, is_anatomical: true }
    }

    pub fn both(name: impl Into<String>) -> Self {
        Self { name: name.into(), is_technical: true, is_anatomical: true }
    }
}

/// 未解決のセグメント定義
#[derive(Debug, Clone)]
pub struct SegmentSpec {
    pub name: String,
    pub parent: String,
    pub translations: AxisSequence,
    pub rotations: AxisSequence,
    pub coordinate_system: CoordinateSystemSpec,
    pub markers: Vec<MarkerSpec>,
}

impl SegmentSpec {
    pub fn new(name: impl Into<String>, parent: impl Into<String>, coordinate_system: CoordinateSystemSpec) -> Self {
        Self {
            name: name.into(),
            parent: parent.into(),
            translations: AxisSequence::none(),
            rotations: AxisSequence::none(),
            coordinate_system,
            markers: Vec::new(),
        }
    }

    pub fn with_translations(mut self, translations: AxisSequence) -> Self {
        self.translations = translations;
        self
    }

    pub fn with_rotations(mut self, rotations: AxisSequence) -> Self {
        self.rotations = rotations;
        self
    }

    pub fn with_marker(mut self, marker: MarkerSpec) -> Self {
        self.markers.push(marker);
        self
    }

    pub fn with_markers(mut self, markers: impl IntoIterator<Item = MarkerSpec>) -> Self {
        self.markers.extend(markers);
        self
    }

    pub fn nb_dof(&self) -> usize {
        self.translations.len() + self.rotations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_axis_sequence() {
        let seq: AxisSequence = "xz".parse().unwrap();
        assert_eq!(seq.axes(), &[AxisName::X, AxisName::Z]);
        assert_eq!(seq.to_string(), "xz");

        let seq: AxisSequence = "ZYX".parse().unwrap();
        assert_eq!(seq.axes(), &[AxisName::Z, AxisName::Y, AxisName::X]);

        assert!("".parse::<AxisSequence>().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_axis_sequence() {
        assert_eq!("xx".parse::<AxisSequence>(), Err(Error::InvalidAxisSequence("xx".to_string())));
        assert_eq!("xw".parse::<AxisSequence>(), Err(Error::InvalidAxisSequence("xw".to_string())));
    }

    #[test]
    fn test_axis_sequence_serde() {
        let seq: AxisSequence = "xyz".parse().unwrap();
        let json = serde_json::to_string(&seq).unwrap();
        assert_eq!(json, "\"xyz\"");
        let back: AxisSequence = serde_json::from_str(&json).unwrap();
        assert_eq!(back, seq);
    }
}
