//! ファイル入出力（キャプチャ JSON の取り込み、モデル・再構成結果の保存）
//!
//! ディレクトリ構成:
//!
//! ```text
//! data_dir/<subject>/*_static.json, *_func_lhip.json, ..., 運動試行 *.json
//! models_dir/<subject>/<model_name>.json
//! results_dir/<subject>/<trial>_<method>.json
//! ```

use anyhow::{bail, Context, Result};
use ndarray::Array3;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::kinematics::{FilterDiagnostics, Reconstruction};
use crate::markers::{LengthUnit, MarkerTrajectory};
use crate::model::lower_body::STATIC_SUFFIX;
use crate::model::{CalibrationTrials, FrozenModel, FunctionalJoint};

/// キャプチャファイル（C3D から書き出した JSON）
#[derive(Debug, Serialize, Deserialize)]
pub struct CaptureFile {
    pub marker_names: Vec<String>,
    pub frame_rate: f64,
    #[serde(default = "default_unit")]
    pub unit: LengthUnit,
    /// points[frame][marker] = [x, y, z]、欠損は null
    pub points: Vec<Vec<Option<[f64; 3]>>>,
}

fn default_unit() -> LengthUnit {
    LengthUnit::Millimeters
}

impl CaptureFile {
    pub fn into_trajectory(self) -> Result<MarkerTrajectory> {
        let markers = self.marker_names.len();
        let mut data = Array3::from_elem((3, markers, self.points.len()), f64::NAN);
        for (f, frame) in self.points.iter().enumerate() {
            if frame.len() != markers {
                bail!("Frame {} has {} points, expected {}", f, frame.len(), markers);
            }
            for (m, point) in frame.iter().enumerate() {
                if let Some(p) = point {
                    for k in 0..3 {
                        data[[k, m, f]] = p[k];
                    }
                }
            }
        }
        Ok(MarkerTrajectory::from_capture(self.marker_names, data, self.frame_rate, self.unit)?)
    }
}

pub fn load_capture(path: &Path) -> Result<MarkerTrajectory> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read capture file {}", path.display()))?;
    let capture: CaptureFile =
        serde_json::from_str(&content).with_context(|| format!("Failed to parse capture file {}", path.display()))?;
    capture.into_trajectory().with_context(|| format!("Invalid capture file {}", path.display()))
}

/// ディレクトリ内の JSON ファイル（名前順）
fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read directory {}", dir.display()))? {
        let path = entry?.path();
        if path.is_file() && path.extension().map_or(false, |e| e == "json") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn file_stem(path: &Path) -> String {
    path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
}

fn is_calibration_trial(path: &Path) -> bool {
    let stem = file_stem(path);
    stem.ends_with(STATIC_SUFFIX) || FunctionalJoint::ALL.iter().any(|j| stem.ends_with(j.suffix()))
}

/// 接尾辞に一致するファイルを高々1つ探す
fn find_by_suffix(files: &[PathBuf], suffix: &str) -> Result<Option<PathBuf>> {
    let matches: Vec<&PathBuf> = files.iter().filter(|p| file_stem(p).ends_with(suffix)).collect();
    match matches.as_slice() {
        [] => Ok(None),
        [path] => Ok(Some((*path).clone())),
        _ => bail!("Multiple files match *{}: {:?}", suffix, matches),
    }
}

/// 被験者ディレクトリから静的試行と機能的試行を読み込む
///
/// `use_functional` が false のときは機能的試行がなくてもよい。
pub fn load_calibration_trials(dir: &Path, use_functional: bool) -> Result<CalibrationTrials> {
    let files = json_files(dir)?;
    let static_path = find_by_suffix(&files, STATIC_SUFFIX)?
        .with_context(|| format!("No *{}.json in {}", STATIC_SUFFIX, dir.display()))?;
    let mut trials = CalibrationTrials::new(load_capture(&static_path)?);

    for joint in FunctionalJoint::ALL {
        match find_by_suffix(&files, joint.suffix())? {
            Some(path) => {
                log::debug!("{}: {}", joint, path.display());
                trials = trials.with_functional(joint, load_capture(&path)?);
            }
            None if use_functional => {
                bail!("No *{}.json in {} ({} functional trial)", joint.suffix(), dir.display(), joint)
            }
            None => {}
        }
    }
    Ok(trials)
}

/// キャリブレーション以外の試行（名前順）
pub fn motion_trials(dir: &Path) -> Result<Vec<PathBuf>> {
    Ok(json_files(dir)?.into_iter().filter(|p| !is_calibration_trial(p)).collect())
}

/// データディレクトリ内の被験者（`subjects` が空なら全員、名前順）
pub fn list_subjects(data_dir: &Path, subjects: &[String]) -> Result<Vec<String>> {
    if !subjects.is_empty() {
        return Ok(subjects.to_vec());
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(data_dir).with_context(|| format!("Failed to read data directory {}", data_dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            if let Some(name) = path.file_name() {
                found.push(name.to_string_lossy().into_owned());
            }
        }
    }
    found.sort();
    Ok(found)
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create directory {}", dir.display()))?;
    }
    Ok(())
}

pub fn save_model(path: &Path, model: &FrozenModel) -> Result<()> {
    create_parent(path)?;
    let json = serde_json::to_string_pretty(model)?;
    fs::write(path, json).with_context(|| format!("Failed to write model file {}", path.display()))?;
    Ok(())
}

pub fn load_model(path: &Path) -> Result<FrozenModel> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read model file {}", path.display()))?;
    let model: FrozenModel =
        serde_json::from_str(&content).with_context(|| format!("Failed to parse model file {}", path.display()))?;
    Ok(model)
}

/// 再構成結果の保存形式
#[derive(Debug, Serialize, Deserialize)]
pub struct ReconstructionFile {
    pub version: String,
    /// 書き出したビルド（git describe）
    #[serde(default)]
    pub build: String,
    pub method: String,
    pub frame_rate: f64,
    pub dof_names: Vec<String>,
    /// q[dof][frame]
    pub q: Vec<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filter: Vec<FilterDiagnostics>,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl ReconstructionFile {
    pub fn new(result: &Reconstruction) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            build: env!("GIT_VERSION").to_string(),
            method: result.method.to_string(),
            frame_rate: result.frame_rate,
            dof_names: result.dof_names.clone(),
            q: result.q.outer_iter().map(|row| row.to_vec()).collect(),
            filter: result.filter.clone(),
            warnings: result.report.warnings().iter().map(|w| w.to_string()).collect(),
        }
    }
}

pub fn save_reconstruction(path: &Path, result: &Reconstruction) -> Result<()> {
    create_parent(path)?;
    let json = serde_json::to_string_pretty(&ReconstructionFile::new(result))?;
    fs::write(path, json).with_context(|| format!("Failed to write result file {}", path.display()))?;
    Ok(())
}

pub fn load_reconstruction(path: &Path) -> Result<ReconstructionFile> {
    let content = fs::read_to_string(path).with_context(|| format!("Failed to read result file {}", path.display()))?;
    Ok(serde_json::from_str(&content).with_context(|| format!("Failed to parse result file {}", path.display()))?)
}
