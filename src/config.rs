use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::kinematics::ReconstructionMethod;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub reconstruction: ReconstructionConfig,
    #[serde(default)]
    pub nls: NlsConfig,
    #[serde(default)]
    pub kalman: KalmanConfig,
    #[serde(default)]
    pub calibration: CalibrationConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconstructionConfig {
    /// "nls" (別名 "qld") または "kalman" (別名 "ekf")
    #[serde(default = "default_method")]
    pub method: ReconstructionMethod,
}

fn default_method() -> ReconstructionMethod { ReconstructionMethod::Nls }

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self { method: default_method() }
    }
}

/// Levenberg–Marquardt の停止条件
#[derive(Debug, Deserialize, Clone)]
pub struct NlsConfig {
    /// コストの相対減少
    #[serde(default = "default_tolerance")]
    pub ftol: f64,
    /// パラメータの相対変化
    #[serde(default = "default_tolerance")]
    pub xtol: f64,
    /// 勾配の直交性
    #[serde(default = "default_tolerance")]
    pub gtol: f64,
    /// 残差評価回数の上限（フレームごと）
    #[serde(default = "default_max_evaluations")]
    pub max_evaluations: usize,
}

fn default_tolerance() -> f64 { 1e-6 }
fn default_max_evaluations() -> usize { 1000 }

impl Default for NlsConfig {
    fn default() -> Self {
        Self {
            ftol: default_tolerance(),
            xtol: default_tolerance(),
            gtol: default_tolerance(),
            max_evaluations: default_max_evaluations(),
        }
    }
}

/// 拡張カルマンフィルタ（等加速度モデル）
#[derive(Debug, Deserialize, Clone)]
pub struct KalmanConfig {
    /// プロセスノイズ（加加速度のスペクトル密度）
    #[serde(default = "default_process_noise")]
    pub process_noise: f64,
    /// 観測ノイズ分散（m²）
    #[serde(default = "default_measurement_noise")]
    pub measurement_noise: f64,
    #[serde(default = "default_initial_q_variance")]
    pub initial_q_variance: f64,
    #[serde(default = "default_initial_qdot_variance")]
    pub initial_qdot_variance: f64,
    #[serde(default = "default_initial_qddot_variance")]
    pub initial_qddot_variance: f64,
    /// 観測次元あたりの NIS がこれを超えたフレームを異常とみなす
    #[serde(default = "default_divergence_nis_threshold")]
    pub divergence_nis_threshold: f64,
    /// 異常フレームがこのフレーム数続いたら発散と判定
    #[serde(default = "default_divergence_window")]
    pub divergence_window: usize,
}

fn default_process_noise() -> f64 { 100.0 }
fn default_measurement_noise() -> f64 { 1e-6 }
fn default_initial_q_variance() -> f64 { 1e-4 }
fn default_initial_qdot_variance() -> f64 { 1e-2 }
fn default_initial_qddot_variance() -> f64 { 1.0 }
fn default_divergence_nis_threshold() -> f64 { 25.0 }
fn default_divergence_window() -> usize { 10 }

impl Default for KalmanConfig {
    fn default() -> Self {
        Self {
            process_noise: default_process_noise(),
            measurement_noise: default_measurement_noise(),
            initial_q_variance: default_initial_q_variance(),
            initial_qdot_variance: default_initial_qdot_variance(),
            initial_qddot_variance: default_initial_qddot_variance(),
            divergence_nis_threshold: default_divergence_nis_threshold(),
            divergence_window: default_divergence_window(),
        }
    }
}

/// 機能的キャリブレーションとモデル構築
#[derive(Debug, Deserialize, Clone)]
pub struct CalibrationConfig {
    /// SCoRE/SARA を使う（false なら解剖学的定義のみ）
    #[serde(default = "default_use_functional")]
    pub use_functional: bool,
    /// これを超える条件数は悪条件として警告
    #[serde(default = "default_max_condition_number")]
    pub max_condition_number: f64,
    /// これを超える RMS 残差（メートル）は悪条件として警告
    #[serde(default = "default_max_residual")]
    pub max_residual: f64,
    /// SARA: 最小特異値と5番目の特異値の比の上限（蝶番らしさ）
    #[serde(default = "default_max_axis_ratio")]
    pub max_axis_ratio: f64,
    /// 機能的試行に必要な最小フレーム数
    #[serde(default = "default_min_frames")]
    pub min_frames: usize,
}

fn default_use_functional() -> bool { true }
fn default_max_condition_number() -> f64 { 1e3 }
fn default_max_residual() -> f64 { 0.02 }
fn default_max_axis_ratio() -> f64 { 0.1 }
fn default_min_frames() -> usize { 10 }

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            use_functional: default_use_functional(),
            max_condition_number: default_max_condition_number(),
            max_residual: default_max_residual(),
            max_axis_ratio: default_max_axis_ratio(),
            min_frames: default_min_frames(),
        }
    }
}

/// バッチ処理の入出力
#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// 被験者ごとのキャプチャ JSON を置くディレクトリ
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    /// 処理対象（空なら data_dir 以下の全ディレクトリ）
    #[serde(default)]
    pub subjects: Vec<String>,
    #[serde(default = "default_model_name")]
    pub model_name: String,
}

fn default_data_dir() -> PathBuf { PathBuf::from("data") }
fn default_models_dir() -> PathBuf { PathBuf::from("models") }
fn default_results_dir() -> PathBuf { PathBuf::from("results") }
fn default_model_name() -> String { "lower_body".to_string() }

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            models_dir: default_models_dir(),
            results_dir: default_results_dir(),
            subjects: Vec::new(),
            model_name: default_model_name(),
        }
    }
}

impl PathsConfig {
    pub fn subject_dir(&self, subject: &str) -> PathBuf {
        self.data_dir.join(subject)
    }

    pub fn model_path(&self, subject: &str) -> PathBuf {
        self.models_dir.join(subject).join(format!("{}.json", self.model_name))
    }

    /// results_dir/<subject>/<trial>_<method>.json
    pub fn result_path(&self, subject: &str, trial: &str, method: ReconstructionMethod) -> PathBuf {
        self.results_dir.join(subject).join(format!("{}_{}.json", trial, method))
    }

    /// 単発の試行ファイルの出力先。親ディレクトリ名を被験者として扱う
    pub fn result_path_for_trial(&self, trial_path: &Path, method: ReconstructionMethod) -> PathBuf {
        let name = |p: Option<&std::ffi::OsStr>| p.map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        let subject = name(trial_path.parent().and_then(Path::file_name));
        self.result_path(&subject, &name(trial_path.file_stem()), method)
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        Ok(config)
    }

    /// ファイルがなければデフォルト、壊れていれば警告してデフォルト
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            log::info!("{} not found, using default config", path.display());
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                log::warn!("{:#}; using default config", e);
                Self::default()
            }
        }
    }
}
