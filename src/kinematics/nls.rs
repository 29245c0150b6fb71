use nalgebra::DVector;

use crate::config::NlsConfig;
use crate::error::{QualityWarning, Result};
use crate::kinematics::lm::LevenbergMarquardt;
use crate::kinematics::{
    FrameSolution, FrameStatus, KinematicsSolver, MarkerResiduals, Observations, ReconstructionMethod,
};
use crate::markers::MarkerTrajectory;
use crate::model::FrozenModel;

/// フレームごとの非線形最小二乗（前フレームの解から開始）
pub struct NlsSolver<'a> {
    model: &'a FrozenModel,
    config: NlsConfig,
}

impl<'a> NlsSolver<'a> {
    pub fn new(model: &'a FrozenModel, config: NlsConfig) -> Self {
        Self { model, config }
    }

    /// 1フレームを解く。全マーカー欠損なら seed をそのまま返す
    pub(crate) fn solve_frame(
        model: &FrozenModel,
        lm: &LevenbergMarquardt,
        observations: &Observations,
        frame: usize,
        seed: &DVector<f64>,
    ) -> FrameSolution {
        let visible = observations.visible(frame);
        if visible.is_empty() {
            log::debug!("frame {}: all technical markers occluded, repeating previous pose", frame);
            return FrameSolution {
                frame,
                q: seed.clone(),
                status: FrameStatus::Occluded,
                visible_markers: 0,
                filter: None,
                warning: Some(QualityWarning::FullOcclusion { frame }),
            };
        }

        let problem = MarkerResiduals { model, visible: &visible };
        let result = lm.minimize(&problem, seed.clone());
        let (status, warning) = if result.termination.converged() {
            (FrameStatus::Converged { evaluations: result.evaluations }, None)
        } else {
            log::debug!("frame {}: evaluation cap reached (cost={:.3e})", frame, result.cost);
            (
                FrameStatus::IterationCap { cost: result.cost },
                Some(QualityWarning::NonConvergence { frame, cost: result.cost }),
            )
        };

        FrameSolution { frame, q: result.x, status, visible_markers: visible.len(), filter: None, warning }
    }
}

/// フレーム順に解くイテレータ
pub struct NlsFrames<'a> {
    model: &'a FrozenModel,
    lm: LevenbergMarquardt,
    observations: Observations,
    frame: usize,
    q: DVector<f64>,
}

impl Iterator for NlsFrames<'_> {
    type Item = FrameSolution;

    fn next(&mut self) -> Option<FrameSolution> {
        if self.frame >= self.observations.len() {
            return None;
        }
        let solution = NlsSolver::solve_frame(self.model, &self.lm, &self.observations, self.frame, &self.q);
        self.q = solution.q.clone();
        self.frame += 1;
        Some(solution)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.observations.len().saturating_sub(self.frame);
        (remaining, Some(remaining))
    }
}

impl<'a> NlsSolver<'a> {
    pub fn iter(&self, trial: &MarkerTrajectory) -> Result<NlsFrames<'a>> {
        Ok(NlsFrames {
            model: self.model,
            lm: LevenbergMarquardt::new(&self.config),
            observations: Observations::new(self.model, trial)?,
            frame: 0,
            q: DVector::zeros(self.model.nb_q()),
        })
    }
}

impl KinematicsSolver for NlsSolver<'_> {
    fn method(&self) -> ReconstructionMethod {
        ReconstructionMethod::Nls
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

    fn occlude(trial: &MarkerTrajectory, frame: usize, markers: std::ops::Range<usize>) -> MarkerTrajectory {
        let mut data = trial.data().clone();
        data.slice_mut(s![.., markers, frame]).fill(f64::NAN);
        MarkerTrajectory::new(trial.names().to_vec(), data, trial.frame_rate()).unwrap()
    }

    #[test]
    fn test_recovers_known_motion() {
        let (model, _) = fixtures::leg_model();
        let truth = fixtures::gait_q(model.nb_q());
        let trial = fixtures::motion(&model, 50, &truth);

        let solver = NlsSolver::new(&model, NlsConfig::default());
        let result = solver.reconstruct(&trial).unwrap();
        assert!(result.report.is_empty(), "{:?}", result.report);

        for f in 0..50 {
            let expected = truth(f);
            for i in 0..model.nb_q() {
                assert!(
                    (result.q[[i, f]] - expected[i]).abs() < 1e-6,
                    "frame {} dof {}: {} vs {}",
                    f,
                    i,
                    result.q[[i, f]],
                    expected[i]
                );
            }
        }
    }

    #[test]
    fn test_full_occlusion_repeats_previous_frame() {
        let (model, _) = fixtures::leg_model();
        let trial = fixtures::motion(&model, 10, fixtures::gait_q(model.nb_q()));
        let trial = occlude(&trial, 4, 0..trial.marker_count());

        let solver = NlsSolver::new(&model, NlsConfig::default());
        let solutions: Vec<FrameSolution> = solver.iter(&trial).unwrap().collect();
        assert_eq!(solutions.len(), 10);
        assert_eq!(solutions[4].status, FrameStatus::Occluded);
        // ビット単位で一致
        assert_eq!(solutions[4].q, solutions[3].q);
        assert_eq!(solutions[4].warning, Some(QualityWarning::FullOcclusion { frame: 4 }));
        assert!(matches!(solutions[5].status, FrameStatus::Converged { .. }));
    }

    #[test]
    fn test_full_occlusion_at_first_frame_gives_zero_pose() {
        let (model, _) = fixtures::leg_model();
        let trial = fixtures::motion(&model, 3, fixtures::gait_q(model.nb_q()));
        let trial = occlude(&trial, 0, 0..trial.marker_count());

        let solver = NlsSolver::new(&model, NlsConfig::default());
        let result = solver.reconstruct(&trial).unwrap();
        assert!(result.q.column(0).iter().all(|v| *v == 0.0));
        assert_eq!(result.report.occluded_frames(), 1);
    }

    #[test]
    fn test_partial_occlusion_still_solves() {
        let (model, _) = fixtures::leg_model();
        let truth = fixtures::gait_q(model.nb_q());
        let trial = fixtures::motion(&model, 8, &truth);
        // 骨盤マーカー1つと大腿マーカー1つを隠す
        let trial = occlude(&trial, 5, 0..1);
        let trial = occlude(&trial, 5, 4..5);

        let solver = NlsSolver::new(&model, NlsConfig::default());
        let solutions: Vec<FrameSolution> = solver.iter(&trial).unwrap().collect();
        assert_eq!(solutions[5].visible_markers, model.nb_technical_markers() - 2);
        let expected = truth(5);
        assert!((&solutions[5].q - expected).amax() < 1e-6);
    }

    #[test]
    fn test_iteration_cap_is_counted() {
        let (model, _) = fixtures::leg_model();
        let trial = fixtures::motion(&model, 5, fixtures::gait_q(model.nb_q()));
        let config = NlsConfig { max_evaluations: 1, ..NlsConfig::default() };
        let result = NlsSolver::new(&model, config).reconstruct(&trial).unwrap();
        assert_eq!(result.report.non_converged_frames(), 5);
        assert_eq!(result.q.dim(), (model.nb_q(), 5));
    }

    #[test]
    fn test_deterministic() {
        let (model, _) = fixtures::leg_model();
        let trial = fixtures::motion(&model, 10, fixtures::gait_q(model.nb_q()));
        let solver = NlsSolver::new(&model, NlsConfig::default());
        let a = solver.reconstruct(&trial).unwrap();
        let b = solver.reconstruct(&trial).unwrap();
        assert_eq!(a.q, b.q);
    }
}
