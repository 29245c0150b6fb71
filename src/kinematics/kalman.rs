//! 拡張カルマンフィルタ（等加速度モデル）
//!
//! 状態 x = [q, q̇, q̈]。観測はテクニカルマーカーの3次元位置で、
//! 欠損したマーカーはそのフレームの観測ベクトルから外す。

use nalgebra::{DMatrix, DVector};

use crate::config::{KalmanConfig, NlsConfig};
use crate::error::{QualityWarning, Result};
use crate::kinematics::lm::LevenbergMarquardt;
use crate::kinematics::nls::NlsSolver;
use crate::kinematics::{
    FilterDiagnostics, FrameSolution, FrameStatus, KinematicsSolver, MarkerResiduals, Observations,
    ReconstructionMethod,
};
use crate::markers::MarkerTrajectory;
use crate::model::FrozenModel;

pub struct KalmanSolver<'a> {
    model: &'a FrozenModel,
    nls: NlsConfig,
    config: KalmanConfig,
}

impl<'a> KalmanSolver<'a> {
    pub fn new(model: &'a FrozenModel, nls: NlsConfig, config: KalmanConfig) -> Self {
        Self { model, nls, config }
    }

    pub fn iter(&self, trial: &MarkerTrajectory) -> Result<KalmanFrames<'a>> {
        let observations = Observations::new(self.model, trial)?;
        let nb_q = self.model.nb_q();
        let dt = 1.0 / trial.frame_rate();
        Ok(KalmanFrames {
            model: self.model,
            lm: LevenbergMarquardt::new(&self.nls),
            observations,
            transition: transition_matrix(nb_q, dt),
            process_noise: process_noise(nb_q, dt, self.config.process_noise),
            config: self.config.clone(),
            state: DVector::zeros(3 * nb_q),
            covariance: initial_covariance(nb_q, &self.config),
            frame: 0,
            outliers: 0,
        })
    }
}

/// 状態遷移 F = [[I, dt·I, dt²/2·I], [0, I, dt·I], [0, 0, I]]
fn transition_matrix(nb_q: usize, dt: f64) -> DMatrix<f64> {
    let blocks = [[1.0, dt, 0.5 * dt * dt], [0.0, 1.0, dt], [0.0, 0.0, 1.0]];
    kron_identity(&blocks, nb_q)
}

/// 加加速度を白色雑音とした離散化プロセス雑音
fn process_noise(nb_q: usize, dt: f64, noise: f64) -> DMatrix<f64> {
    let (dt2, dt3, dt4, dt5) = (dt.powi(2), dt.powi(3), dt.powi(4), dt.powi(5));
    let blocks = [
        [dt5 / 20.0, dt4 / 8.0, dt3 / 6.0],
        [dt4 / 8.0, dt3 / 3.0, dt2 / 2.0],
        [dt3 / 6.0, dt2 / 2.0, dt],
    ];
    kron_identity(&blocks, nb_q) * noise
}

fn initial_covariance(nb_q: usize, config: &KalmanConfig) -> DMatrix<f64> {
    let variances = [config.initial_q_variance, config.initial_qdot_variance, config.initial_qddot_variance];
    DMatrix::from_diagonal(&DVector::from_iterator(3 * nb_q, variances.iter().flat_map(|v| std::iter::repeat(*v).take(nb_q))))
}

/// 3×3 ブロック ⊗ I(n)
fn kron_identity(blocks: &[[f64; 3]; 3], n: usize) -> DMatrix<f64> {
    let mut m = DMatrix::zeros(3 * n, 3 * n);
    for (bi, row) in blocks.iter().enumerate() {
        for (bj, v) in row.iter().enumerate() {
            if *v != 0.0 {
                for i in 0..n {
                    m[(bi * n + i, bj * n + i)] = *v;
                }
            }
        }
    }
    m
}

/// フレーム順に状態を伝播・更新するイテレータ
pub struct KalmanFrames<'a> {
    model: &'a FrozenModel,
    lm: LevenbergMarquardt,
    observations: Observations,
    transition: DMatrix<f64>,
    process_noise: DMatrix<f64>,
    config: KalmanConfig,
    state: DVector<f64>,
    covariance: DMatrix<f64>,
    frame: usize,
    /// NIS が閾値を超え続けているフレーム数
    outliers: usize,
}

impl KalmanFrames<'_> {
    fn nb_q(&self) -> usize {
        self.model.nb_q()
    }

    fn q(&self) -> DVector<f64> {
        self.state.rows(0, self.nb_q()).into_owned()
    }

    fn predict(&mut self) {
        self.state = &self.transition * &self.state;
        self.covariance = &self.transition * &self.covariance * self.transition.transpose() + &self.process_noise;
    }

    /// 観測更新（Joseph 形式）。戻り値は NIS
    fn update(&mut self, visible: &[(usize, nalgebra::Vector3<f64>)]) -> Option<f64> {
        let nb_q = self.nb_q();
        let problem = MarkerResiduals { model: self.model, visible };
        let (residual, jacobian) = problem.evaluate(&self.q()).ok()?;
        // イノベーション y = z − h(x)
        let innovation = -residual;

        let m = innovation.len();
        let n = self.state.len();
        let mut h = DMatrix::zeros(m, n);
        h.columns_mut(0, nb_q).copy_from(&jacobian);

        let r = DMatrix::identity(m, m) * self.config.measurement_noise;
        let pht = &self.covariance * h.transpose();
        let s = &h * &pht + &r;
        let Some(chol) = s.cholesky() else {
            log::debug!("frame {}: innovation covariance is not positive definite, skipping update", self.frame);
            return None;
        };

        // K = P Hᵀ S⁻¹
        let gain = chol.solve(&pht.transpose()).transpose();
        let nis = innovation.dot(&chol.solve(&innovation));

        self.state += &gain * &innovation;
        let i_kh = DMatrix::identity(n, n) - &gain * &h;
        self.covariance = &i_kh * &self.covariance * i_kh.transpose() + &gain * r * gain.transpose();
        Some(nis)
    }

    /// 閾値超えが divergence_window フレーム続いたら発散として報告
    fn check_divergence(&mut self, nis: Option<f64>, observations: usize) -> Option<QualityWarning> {
        let nis = nis?;
        let per_dim = nis / observations.max(1) as f64;
        if per_dim > self.config.divergence_nis_threshold {
            self.outliers += 1;
        } else {
            self.outliers = 0;
        }
        if self.outliers >= self.config.divergence_window.max(1) {
            self.outliers = 0;
            log::warn!("frame {}: Kalman filter diverging (NIS per observation={:.2})", self.frame, per_dim);
            return Some(QualityWarning::FilterDivergence { frame: self.frame, nis });
        }
        None
    }
}

impl Iterator for KalmanFrames<'_> {
    type Item = FrameSolution;

    fn next(&mut self) -> Option<FrameSolution> {
        if self.frame >= self.observations.len() {
            return None;
        }
        let frame = self.frame;
        let visible = self.observations.visible(frame);

        let mut seed_warning = None;
        if frame == 0 {
            // 第0フレームの NLS 解で初期化
            let nb_q = self.nb_q();
            let seed = NlsSolver::solve_frame(self.model, &self.lm, &self.observations, 0, &DVector::zeros(nb_q));
            self.state.rows_mut(0, nb_q).copy_from(&seed.q);
            seed_warning = seed.warning;
        } else {
            self.predict();
        }

        let (status, nis, warning) = if visible.is_empty() {
            (FrameStatus::Occluded, None, Some(QualityWarning::FullOcclusion { frame }))
        } else {
            let nis = self.update(&visible);
            let warning = self.check_divergence(nis, 3 * visible.len());
            (FrameStatus::Filtered, nis, warning)
        };
        // 初期化時の NLS 非収束も第0フレームの警告として残す
        let warning = warning.or(seed_warning);

        let solution = FrameSolution {
            frame,
            q: self.q(),
            status,
            visible_markers: visible.len(),
            filter: Some(FilterDiagnostics {
                nis,
                observations: 3 * visible.len(),
                covariance_trace: self.covariance.trace(),
            }),
            warning,
        };
        self.frame += 1;
        Some(solution)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.observations.len().saturating_sub(self.frame);
        (remaining, Some(remaining))
    }
}

impl KinematicsSolver for KalmanSolver<'_> {
    fn method(&self) -> ReconstructionMethod {
        ReconstructionMethod::Kalman
    }

    fn model(&self) -> &FrozenModel {
        self.model
    }

    fn frames<'s>(&'s self, trial: &MarkerTrajectory) -> Result<Box<dyn Iterator<Item = FrameSolution> + 's>> {
        Ok(Box::new(self.iter(trial)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures;
    use ndarray::s;

    fn solver(model: &FrozenModel) -> KalmanSolver<'_> {
        KalmanSolver::new(model, NlsConfig::default(), KalmanConfig::default())
    }

    #[test]
    fn test_transition_and_noise_structure() {
        let f = transition_matrix(2, 0.01);
        assert_eq!(f[(0, 2)], 0.01);
        assert_eq!(f[(0, 4)], 0.5 * 0.01 * 0.01);
        assert_eq!(f[(2, 4)], 0.01);
        assert_eq!(f[(0, 1)], 0.0);

        let q = process_noise(2, 0.01, 1.0);
        assert_eq!(q, q.transpose());
        assert_eq!(q[(4, 4)], 0.01);
    }

    #[test]
    fn test_tracks_smooth_motion() {
        let (model, _) = fixtures::leg_model();
        let truth = fixtures::gait_q(model.nb_q());
        let trial = fixtures::motion(&model, 100, &truth);

        // 初速 0 から立ち上がれるよう速度の初期分散を広げる
        let config = KalmanConfig { initial_qdot_variance: 10.0, ..KalmanConfig::default() };
        let result = KalmanSolver::new(&model, NlsConfig::default(), config).reconstruct(&trial).unwrap();
        assert!(!result.report.has_divergence(), "{:?}", result.report);
        assert_eq!(result.filter.len(), 100);

        for f in 0..100 {
            let error = (0..model.nb_q()).map(|i| (result.q[[i, f]] - truth(f)[i]).abs()).fold(0.0, f64::max);
            assert!(error < 1e-2, "frame {}: error {}", f, error);
        }
        for d in &result.filter {
            assert!(d.covariance_trace.is_finite() && d.covariance_trace > 0.0);
            assert!(d.nis.map_or(false, |v| v.is_finite() && v >= 0.0));
        }
    }

    #[test]
    fn test_full_occlusion_predicts_only() {
        let (model, _) = fixtures::leg_model();
        let trial = fixtures::motion(&model, 20, fixtures::gait_q(model.nb_q()));
        let mut data = trial.data().clone();
        data.slice_mut(s![.., .., 10]).fill(f64::NAN);
        let trial = MarkerTrajectory::new(trial.names().to_vec(), data, trial.frame_rate()).unwrap();

        let solutions: Vec<FrameSolution> = solver(&model).iter(&trial).unwrap().collect();
        let occluded = &solutions[10];
        assert_eq!(occluded.status, FrameStatus::Occluded);
        let diagnostics = occluded.filter.unwrap();
        assert_eq!(diagnostics.nis, None);
        // 予測のみなので共分散が増える
        assert!(diagnostics.covariance_trace > solutions[9].filter.unwrap().covariance_trace);
        // 予測は前フレームから動いている
        assert_ne!(occluded.q, solutions[9].q);
    }

    #[test]
    fn test_partial_occlusion_updates_with_remaining_markers() {
        let (model, _) = fixtures::leg_model();
        let truth = fixtures::gait_q(model.nb_q());
        let trial = fixtures::motion(&model, 20, &truth);
        // 骨盤マーカー1つと大腿マーカー1つを隠す
        let mut data = trial.data().clone();
        data.slice_mut(s![.., 0..1, 10]).fill(f64::NAN);
        data.slice_mut(s![.., 4..5, 10]).fill(f64::NAN);
        let trial = MarkerTrajectory::new(trial.names().to_vec(), data, trial.frame_rate()).unwrap();

        let config = KalmanConfig { initial_qdot_variance: 10.0, ..KalmanConfig::default() };
        let solutions: Vec<FrameSolution> = KalmanSolver::new(&model, NlsConfig::default(), config)
            .iter(&trial)
            .unwrap()
            .collect();
        let partial = &solutions[10];
        assert_eq!(partial.status, FrameStatus::Filtered);
        assert_eq!(partial.visible_markers, model.nb_technical_markers() - 2);
        let diagnostics = partial.filter.unwrap();
        assert_eq!(diagnostics.observations, 3 * (model.nb_technical_markers() - 2));
        assert!(diagnostics.nis.map_or(false, |v| v.is_finite()));
        assert!((&partial.q - truth(10)).amax() < 1e-2);
    }

    #[test]
    fn test_initial_seed_non_convergence_is_reported() {
        let (model, _) = fixtures::leg_model();
        let trial = fixtures::motion(&model, 5, fixtures::gait_q(model.nb_q()));
        let nls = NlsConfig { max_evaluations: 1, ..NlsConfig::default() };
        let result = KalmanSolver::new(&model, nls, KalmanConfig::default()).reconstruct(&trial).unwrap();
        assert_eq!(result.report.non_converged_frames(), 1);
        assert!(matches!(result.report.warnings()[0], QualityWarning::NonConvergence { frame: 0, .. }));
    }

    #[test]
    fn test_divergence_is_reported() {
        let (model, _) = fixtures::leg_model();
        let truth = fixtures::gait_q(model.nb_q());
        // 30フレーム目で骨盤の X 並進が 0.3 m 跳ぶ
        let trial = fixtures::motion(&model, 60, |f| {
            let mut q = truth(f);
            if f >= 30 {
                q[0] += 0.3;
            }
            q
        });
        let config = KalmanConfig {
            process_noise: 1e-9,
            divergence_window: 3,
            ..KalmanConfig::default()
        };
        let result = KalmanSolver::new(&model, NlsConfig::default(), config).reconstruct(&trial).unwrap();
        assert!(result.report.has_divergence(), "{:?}", result.report);
    }
}
