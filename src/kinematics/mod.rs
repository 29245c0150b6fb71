//! マーカー駆動の逆運動学
//!
//! 手法（NLS / EKF）は [`KinematicsSolver`] の実装として切り替える。
//! 各ソルバーはフレーム順に解を返す遅延イテレータを提供し、可視化などの
//! 観測側はそれを消費するだけでよい。

pub mod kalman;
pub mod lm;
pub mod nls;

use std::fmt;
use std::str::FromStr;

use nalgebra::{DMatrix, DVector, Vector3};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{Error, QualityReport, QualityWarning, Result};
use crate::markers::MarkerTrajectory;
use crate::model::FrozenModel;

pub use kalman::KalmanSolver;
pub use nls::NlsSolver;

/// 再構成手法
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ReconstructionMethod {
    /// フレームごとの非線形最小二乗
    Nls,
    /// 拡張カルマンフィルタ
    Kalman,
}

impl FromStr for ReconstructionMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "nls" | "qld" | "lm" => Ok(Self::Nls),
            "kalman" | "ekf" => Ok(Self::Kalman),
            _ => Err(Error::UnknownMethod(s.to_string())),
        }
    }
}

impl fmt::Display for ReconstructionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nls => f.write_str("nls"),
            Self::Kalman => f.write_str("kalman"),
        }
    }
}

impl TryFrom<String> for ReconstructionMethod {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ReconstructionMethod> for String {
    fn from(method: ReconstructionMethod) -> Self {
        method.to_string()
    }
}

/// フレームの処理結果
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameStatus {
    /// 許容誤差内で収束
    Converged { evaluations: usize },
    /// 評価回数の上限（最良の反復値を採用）
    IterationCap { cost: f64 },
    /// 全マーカー欠損（NLS は前フレームの解、EKF は予測のみ）
    Occluded,
    /// EKF の観測更新
    Filtered,
}

/// EKF の健全性指標
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterDiagnostics {
    /// 正規化イノベーション二乗 yᵀS⁻¹y（観測更新がないフレームは None）
    pub nis: Option<f64>,
    /// 観測次元（可視マーカー数 × 3）
    pub observations: usize,
    /// 状態共分散のトレース
    pub covariance_trace: f64,
}

/// 1フレーム分の解
#[derive(Debug, Clone)]
pub struct FrameSolution {
    pub frame: usize,
    pub q: DVector<f64>,
    pub status: FrameStatus,
    pub visible_markers: usize,
    pub filter: Option<FilterDiagnostics>,
    pub warning: Option<QualityWarning>,
}

/// 試行全体の再構成結果
#[derive(Debug, Clone)]
pub struct Reconstruction {
    pub method: ReconstructionMethod,
    pub dof_names: Vec<String>,
    pub frame_rate: f64,
    /// (dof, frame)
    pub q: Array2<f64>,
    /// EKF のときフレームごと
    pub filter: Vec<FilterDiagnostics>,
    pub report: QualityReport,
}

/// モデル + マーカー軌道 → 一般化座標軌道
pub trait KinematicsSolver {
    fn method(&self) -> ReconstructionMethod;

    fn model(&self) -> &FrozenModel;

    /// フレーム順に解を返す（途中で止めても状態は壊れない）
    fn frames<'a>(&'a self, trial: &MarkerTrajectory) -> Result<Box<dyn Iterator<Item = FrameSolution> + 'a>>;

    /// 全フレームを解いて (dof, frame) 配列にまとめる
    fn reconstruct(&self, trial: &MarkerTrajectory) -> Result<Reconstruction> {
        let model = self.model();
        let mut q = Array2::zeros((model.nb_q(), trial.len()));
        let mut filter = Vec::new();
        let mut report = QualityReport::new();

        for solution in self.frames(trial)? {
            for (i, v) in solution.q.iter().enumerate() {
                q[[i, solution.frame]] = *v;
            }
            if let Some(diagnostics) = solution.filter {
                filter.push(diagnostics);
            }
            if let Some(warning) = solution.warning {
                report.push(warning);
            }
        }

        Ok(Reconstruction {
            method: self.method(),
            dof_names: model.dof_names(),
            frame_rate: trial.frame_rate(),
            q,
            filter,
            report,
        })
    }
}

/// 設定に従ってソルバーを作る
pub fn create_solver<'a>(
    method: ReconstructionMethod,
    model: &'a FrozenModel,
    config: &Config,
) -> Box<dyn KinematicsSolver + 'a> {
    match method {
        ReconstructionMethod::Nls => Box::new(NlsSolver::new(model, config.nls.clone())),
        ReconstructionMethod::Kalman => Box::new(KalmanSolver::new(model, config.nls.clone(), config.kalman.clone())),
    }
}

/// 運動試行をモデルのテクニカルマーカー順に並べた観測
pub(crate) struct Observations {
    trial: MarkerTrajectory,
}

impl Observations {
    pub fn new(model: &FrozenModel, trial: &MarkerTrajectory) -> Result<Self> {
        let names = model.technical_marker_names();
        let trial = trial.filter(&names, true)?;
        Ok(Self { trial })
    }

    pub fn len(&self) -> usize {
        self.trial.len()
    }

    /// 可視マーカーの (モデル内の添字, 位置)
    pub fn visible(&self, frame: usize) -> Vec<(usize, Vector3<f64>)> {
        (0..self.trial.marker_count())
            .filter(|&m| !self.trial.is_occluded(m, frame))
            .map(|m| (m, self.trial.position(m, frame)))
            .collect()
    }
}

/// 可視マーカーだけを使う残差とヤコビアン
pub(crate) struct MarkerResiduals<'a> {
    pub model: &'a FrozenModel,
    pub visible: &'a [(usize, Vector3<f64>)],
}

impl MarkerResiduals<'_> {
    /// 予測位置 − 観測位置 (3V) と対応するヤコビアン (3V × nb_q)
    pub fn evaluate(&self, q: &DVector<f64>) -> Result<(DVector<f64>, DMatrix<f64>)> {
        let (predicted, full) = self.model.technical_markers_jacobian(q)?;
        let mut r = DVector::zeros(3 * self.visible.len());
        let mut j = DMatrix::zeros(3 * self.visible.len(), q.len());
        for (row, (m, observed)) in self.visible.iter().enumerate() {
            let d = predicted[*m] - observed;
            for k in 0..3 {
                r[3 * row + k] = d[k];
            }
            j.rows_mut(3 * row, 3).copy_from(&full.rows(3 * m, 3));
        }
        Ok((r, j))
    }
}

impl lm::LeastSquaresProblem for MarkerResiduals<'_> {
    fn residuals(&self, q: &DVector<f64>) -> DVector<f64> {
        match self.model.technical_markers(q) {
            Ok(predicted) => DVector::from_iterator(
                3 * self.visible.len(),
                self.visible.iter().flat_map(|(m, observed)| {
                    let d = predicted[*m] - observed;
                    [d[0], d[1], d[2]]
                }),
            ),
            // 次元はソルバー側で保証済み
            Err(_) => DVector::from_element(3 * self.visible.len(), f64::NAN),
        }
    }

    fn jacobian(&self, q: &DVector<f64>) -> DMatrix<f64> {
        match self.evaluate(q) {
            Ok((_, j)) => j,
            Err(_) => DMatrix::from_element(3 * self.visible.len(), q.len(), f64::NAN),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures;

    #[test]
    fn test_parse_method() {
        assert_eq!("nls".parse::<ReconstructionMethod>().unwrap(), ReconstructionMethod::Nls);
        assert_eq!("QLD".parse::<ReconstructionMethod>().unwrap(), ReconstructionMethod::Nls);
        assert_eq!("kalman".parse::<ReconstructionMethod>().unwrap(), ReconstructionMethod::Kalman);
        assert_eq!("ekf".parse::<ReconstructionMethod>().unwrap(), ReconstructionMethod::Kalman);
        assert_eq!(
            "particle".parse::<ReconstructionMethod>().unwrap_err(),
            Error::UnknownMethod("particle".to_string())
        );
    }

    #[test]
    fn test_create_solver_by_method() {
        let (model, _) = fixtures::leg_model();
        let config = Config::default();
        for method in [ReconstructionMethod::Nls, ReconstructionMethod::Kalman] {
            let solver = create_solver(method, &model, &config);
            assert_eq!(solver.method(), method);
        }
    }

    #[test]
    fn test_both_methods_share_output_shape() {
        let (model, _) = fixtures::leg_model();
        let trial = fixtures::motion(&model, 30, fixtures::gait_q(model.nb_q()));
        let config = Config::default();
        for method in [ReconstructionMethod::Nls, ReconstructionMethod::Kalman] {
            let result = create_solver(method, &model, &config).reconstruct(&trial).unwrap();
            assert_eq!(result.q.dim(), (model.nb_q(), 30));
            assert_eq!(result.dof_names.len(), model.nb_q());
            assert_eq!(result.frame_rate, 100.0);
        }
    }

    #[test]
    fn test_missing_technical_marker() {
        let (model, _) = fixtures::leg_model();
        let trial = fixtures::motion(&model, 5, fixtures::gait_q(model.nb_q()));
        let trial = trial.filter(&["LPSI", "RPSI", "LASI", "RASI"], false).unwrap();
        let solver = create_solver(ReconstructionMethod::Nls, &model, &Config::default());
        assert_eq!(solver.reconstruct(&trial).unwrap_err(), Error::MarkerNotFound("LTHI".to_string()));
    }
}
