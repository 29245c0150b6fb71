use std::collections::HashSet;
use std::ops::Range;
use std::str::FromStr;

use nalgebra::Vector3;
use ndarray::{s, Array2, Array3, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// キャプチャの長さ単位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LengthUnit {
    #[serde(alias = "mm")]
    Millimeters,
    #[serde(alias = "m")]
    Meters,
}

impl LengthUnit {
    /// メートルへの換算係数
    pub fn to_meters(self) -> f64 {
        match self {
            LengthUnit::Millimeters => 1e-3,
            LengthUnit::Meters => 1.0,
        }
    }
}

impl FromStr for LengthUnit {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mm" | "millimeters" => Ok(LengthUnit::Millimeters),
            "m" | "meters" => Ok(LengthUnit::Meters),
            other => Err(format!("Unknown length unit: {}", other)),
        }
    }
}

/// マーカー軌跡コンテナ
///
/// 形状 (coord_dim, marker_count, frame_count)。coord_dim は 3 (XYZ) か 4 (XYZW)。
/// 欠損（オクルージョン）は XYZ すべて NaN。単位は常にメートル。
#[derive(Debug, Clone, PartialEq)]
pub struct MarkerTrajectory {
    names: Vec<String>,
    data: Array3<f64>,
    frame_rate: f64,
}

impl MarkerTrajectory {
    pub fn new<I, S>(names: I, data: Array3<f64>, frame_rate: f64) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        let (dim, markers, _) = data.dim();

        if markers != names.len() {
            return Err(Error::MarkerCountMismatch { names: names.len(), markers });
        }
        if dim != 3 && dim != 4 {
            return Err(Error::InvalidCoordinateDim(dim));
        }
        // dt = 1 / frame_rate を使うので 0・負・NaN は受け付けない
        if !(frame_rate.is_finite() && frame_rate > 0.0) {
            return Err(Error::InvalidFrameRate(frame_rate));
        }
        let mut seen = HashSet::new();
        for name in &names {
            if !seen.insert(name.as_str()) {
                return Err(Error::DuplicateMarker(name.clone()));
            }
        }

        Ok(Self { names, data, frame_rate })
    }

    /// 1フレーム分 (coord_dim, marker_count) の配列から作成
    pub fn from_single_frame<I, S>(names: I, data: Array2<f64>, frame_rate: f64) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(names, data.insert_axis(Axis(2)), frame_rate)
    }

    /// キャプチャ取り込み時に一度だけ単位をメートルへ正規化する
    pub fn from_capture<I, S>(names: I, mut data: Array3<f64>, frame_rate: f64, unit: LengthUnit) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let factor = unit.to_meters();
        if factor != 1.0 {
            // 同次座標の4行目はそのまま
            data.slice_mut(s![..3, .., ..]).mapv_inplace(|v| v * factor);
        }
        Self::new(names, data, frame_rate)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn marker_count(&self) -> usize {
        self.names.len()
    }

    /// フレーム数
    pub fn len(&self) -> usize {
        self.data.dim().2
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn coord_dim(&self) -> usize {
        self.data.dim().0
    }

    pub fn frame_rate(&self) -> f64 {
        self.frame_rate
    }

    pub fn data(&self) -> &Array3<f64> {
        &self.data
    }

    pub fn index_of(&self, name: &str) -> Result<usize> {
        self.names
            .iter()
            .position(|n| n == name)
            .ok_or_else(|| Error::MarkerNotFound(name.to_string()))
    }

    /// マーカー名で (coord_dim × frame_count) の系列を取得
    pub fn get(&self, name: &str) -> Result<ArrayView2<'_, f64>> {
        let index = self.index_of(name)?;
        Ok(self.data.slice(s![.., index, ..]))
    }

    /// (marker, frame) の XYZ
    pub fn position(&self, marker: usize, frame: usize) -> Vector3<f64> {
        Vector3::new(
            self.data[[0, marker, frame]],
            self.data[[1, marker, frame]],
            self.data[[2, marker, frame]],
        )
    }

    pub fn is_occluded(&self, marker: usize, frame: usize) -> bool {
        (0..3).any(|c| self.data[[c, marker, frame]].is_nan())
    }

    /// 全マーカーが欠損しているフレームか
    pub fn is_fully_occluded(&self, frame: usize) -> bool {
        (0..self.marker_count()).all(|m| self.is_occluded(m, frame))
    }

    /// NaN を除いたフレーム平均位置（静的試行の代表値）
    ///
    /// 全フレーム欠損なら NaN ベクトル。
    pub fn mean_position(&self, marker: usize) -> Vector3<f64> {
        let mut sum = Vector3::zeros();
        let mut count = 0usize;
        for frame in 0..self.len() {
            if !self.is_occluded(marker, frame) {
                sum += self.position(marker, frame);
                count += 1;
            }
        }
        if count == 0 {
            Vector3::repeat(f64::NAN)
        } else {
            sum / count as f64
        }
    }

    /// 静的試行として全マーカーのフレーム平均位置を取る
    pub fn static_positions(&self) -> StaticPositions {
        StaticPositions {
            names: self.names.clone(),
            positions: (0..self.marker_count()).map(|m| self.mean_position(m)).collect(),
        }
    }

    /// 期待するマーカー名に絞り込む
    ///
    /// キャプチャ側のラベルは被験者名などの接頭辞を持つことがあるため、
    /// 期待名で終わるラベルを一意に探す。見つからない・複数ある場合はエラー。
    /// `rename` が true なら期待名（正規名）に置き換える。
    pub fn filter<S: AsRef<str>>(&self, expected: &[S], rename: bool) -> Result<Self> {
        let mut names = Vec::with_capacity(expected.len());
        let mut indices = Vec::with_capacity(expected.len());

        for m in expected {
            let m = m.as_ref();
            let index = find_unique_suffix(&self.names, m)?;
            names.push(if rename { m.to_string() } else { self.names[index].clone() });
            indices.push(index);
        }

        self.select_markers(&indices, names)
    }

    /// マーカー番号で取り出し、ラベルを付け替える
    pub fn select_markers(&self, indices: &[usize], names: Vec<String>) -> Result<Self> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.marker_count()) {
            return Err(Error::MarkerNotFound(format!("#{}", bad)));
        }
        let data = self.data.select(Axis(1), indices);
        Self::new(names, data, self.frame_rate)
    }

    /// フレーム範囲の切り出し
    pub fn slice_frames(&self, range: Range<usize>) -> Self {
        Self {
            names: self.names.clone(),
            data: self.data.slice(s![.., .., range]).to_owned(),
            frame_rate: self.frame_rate,
        }
    }
}

/// 静的試行のマーカー代表位置（名前は完全一致、なければ接尾辞一致で引く）
#[derive(Debug, Clone, PartialEq)]
pub struct StaticPositions {
    names: Vec<String>,
    positions: Vec<Vector3<f64>>,
}

impl StaticPositions {
    pub fn get(&self, name: &str) -> Result<Vector3<f64>> {
        let index = find_unique_suffix(&self.names, name)?;
        let p = self.positions[index];
        if p.iter().all(|v| v.is_finite()) {
            Ok(p)
        } else {
            // 静的試行で一度も見えていないマーカー
            Err(Error::MarkerNotFound(name.to_string()))
        }
    }

    pub fn mean_of<S: AsRef<str>>(&self, names: &[S]) -> Result<Vector3<f64>> {
        let points = names.iter().map(|n| self.get(n.as_ref())).collect::<Result<Vec<_>>>()?;
        Ok(crate::geometry::mean_markers(&points))
    }
}

/// 期待名で終わるラベルを一意に探す（完全一致があればそれを使う）
pub fn find_unique_suffix<S: AsRef<str>>(captured: &[S], expected: &str) -> Result<usize> {
    if let Some(index) = captured.iter().position(|name| name.as_ref() == expected) {
        return Ok(index);
    }
    let candidates: Vec<usize> = captured
        .iter()
        .enumerate()
        .filter(|(_, name)| name.as_ref().ends_with(expected))
        .map(|(i, _)| i)
        .collect();

    match candidates.as_slice() {
        [] => Err(Error::MarkerNotFound(expected.to_string())),
        [index] => Ok(*index),
        _ => Err(Error::AmbiguousMarker {
            expected: expected.to_string(),
            candidates: candidates.iter().map(|&i| captured[i].as_ref().to_string()).collect(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn make_trajectory(names: &[&str], frames: usize) -> MarkerTrajectory {
        let mut data = Array3::zeros((3, names.len(), frames));
        for m in 0..names.len() {
            for f in 0..frames {
                data[[0, m, f]] = m as f64;
                data[[1, m, f]] = f as f64;
                data[[2, m, f]] = 1.0;
            }
        }
        MarkerTrajectory::new(names.iter().copied(), data, 100.0).unwrap()
    }

    #[test]
    fn test_shape_mismatch() {
        let data = Array3::zeros((3, 2, 5));
        let result = MarkerTrajectory::new(["A"], data, 100.0);
        assert_eq!(result.unwrap_err(), Error::MarkerCountMismatch { names: 1, markers: 2 });
    }

    #[test]
    fn test_invalid_frame_rate() {
        for rate in [0.0, -100.0, f64::NAN, f64::INFINITY] {
            let result = MarkerTrajectory::new(["A"], Array3::zeros((3, 1, 5)), rate);
            assert!(matches!(result, Err(Error::InvalidFrameRate(_))), "rate {}", rate);
        }
    }

    #[test]
    fn test_invalid_coordinate_dim() {
        let data = Array3::zeros((2, 1, 5));
        let result = MarkerTrajectory::new(["A"], data, 100.0);
        assert_eq!(result.unwrap_err(), Error::InvalidCoordinateDim(2));
    }

    #[test]
    fn test_homogeneous_accepted() {
        let data = Array3::ones((4, 2, 3));
        let traj = MarkerTrajectory::new(["A", "B"], data, 100.0).unwrap();
        assert_eq!(traj.coord_dim(), 4);
        assert_eq!(traj.len(), 3);
        assert_eq!(traj.get("B").unwrap().dim(), (4, 3));
    }

    #[test]
    fn test_single_frame() {
        let data = Array2::zeros((3, 2));
        let traj = MarkerTrajectory::from_single_frame(["A", "B"], data, 100.0).unwrap();
        assert_eq!(traj.len(), 1);
    }

    #[test]
    fn test_filter_present_renamed() {
        let traj = make_trajectory(&["Subject:LASI", "Subject:RASI", "Subject:LPSI"], 4);
        let filtered = traj.filter(&["RASI", "LASI"], true).unwrap();
        assert_eq!(filtered.names(), &["RASI".to_string(), "LASI".to_string()]);
        // 順序は期待名の順
        assert_eq!(filtered.position(0, 2), traj.position(1, 2));
        assert_eq!(filtered.len(), 4);
    }

    #[test]
    fn test_filter_keeps_captured_name() {
        let traj = make_trajectory(&["Subject:LASI"], 1);
        let filtered = traj.filter(&["LASI"], false).unwrap();
        assert_eq!(filtered.names(), &["Subject:LASI".to_string()]);
    }

    #[test]
    fn test_filter_absent() {
        let traj = make_trajectory(&["Subject:LASI"], 1);
        let result = traj.filter(&["RASI"], true);
        assert_eq!(result.unwrap_err(), Error::MarkerNotFound("RASI".to_string()));
    }

    #[test]
    fn test_filter_ambiguous() {
        let traj = make_trajectory(&["A:LASI", "B:LASI"], 1);
        let result = traj.filter(&["LASI"], true);
        assert!(matches!(result, Err(Error::AmbiguousMarker { .. })));
    }

    #[test]
    fn test_exact_label_wins_over_suffix() {
        let traj = make_trajectory(&["A:LASI", "LASI"], 1);
        let filtered = traj.filter(&["LASI"], false).unwrap();
        assert_eq!(filtered.names(), &["LASI".to_string()]);
        assert_eq!(find_unique_suffix(traj.names(), "A:LASI").unwrap(), 0);
    }

    #[test]
    fn test_select_markers_out_of_range() {
        let traj = make_trajectory(&["A", "B"], 1);
        assert!(traj.select_markers(&[1], vec!["B".to_string()]).is_ok());
        assert!(traj.select_markers(&[2], vec!["C".to_string()]).is_err());
    }

    #[test]
    fn test_unit_conversion_once() {
        let mut data = Array3::ones((4, 1, 2));
        data[[0, 0, 0]] = 1000.0;
        let traj = MarkerTrajectory::from_capture(["A"], data, 100.0, LengthUnit::Millimeters).unwrap();
        assert!((traj.position(0, 0).x - 1.0).abs() < 1e-12);
        // 同次座標は変換しない
        assert_eq!(traj.data()[[3, 0, 0]], 1.0);
    }

    #[test]
    fn test_mean_position_ignores_occlusion() {
        let mut traj = make_trajectory(&["A"], 3);
        traj.data[[0, 0, 1]] = f64::NAN;
        traj.data[[1, 0, 1]] = f64::NAN;
        traj.data[[2, 0, 1]] = f64::NAN;
        let mean = traj.mean_position(0);
        // y = フレーム番号 (0, 2) の平均
        assert!((mean.y - 1.0).abs() < 1e-12);
        assert!(traj.is_fully_occluded(1));
        assert!(!traj.is_fully_occluded(0));
    }

    #[test]
    fn test_static_positions_lookup() {
        let traj = make_trajectory(&["S:LASI", "S:RASI"], 3);
        let statics = traj.static_positions();
        let rasi = statics.get("RASI").unwrap();
        assert!((rasi.x - 1.0).abs() < 1e-12);
        assert!((rasi.y - 1.0).abs() < 1e-12);
        let mid = statics.mean_of(&["LASI", "RASI"]).unwrap();
        assert!((mid.x - 0.5).abs() < 1e-12);
        assert!(statics.get("LPSI").is_err());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let data = Array3::zeros((3, 2, 1));
        let result = MarkerTrajectory::new(["A", "A"], data, 100.0);
        assert_eq!(result.unwrap_err(), Error::DuplicateMarker("A".to_string()));
    }
}
