//! Levenberg–Marquardt（Marquardt スケーリング付き減衰ガウス・ニュートン）

use nalgebra::{DMatrix, DVector};

use crate::config::NlsConfig;

/// 最小二乗問題 min ½‖r(x)‖²
pub trait LeastSquaresProblem {
    fn residuals(&self, x: &DVector<f64>) -> DVector<f64>;
    fn jacobian(&self, x: &DVector<f64>) -> DMatrix<f64>;
}

/// 停止理由
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// コストの相対減少が ftol 以下
    Ftol,
    /// ステップの相対長が xtol 以下
    Xtol,
    /// 残差と各ヤコビアン列のなす角の余弦が gtol 以下
    Gtol,
    /// 残差評価回数の上限（最良の反復値を返す）
    MaxEvaluations,
}

impl Termination {
    pub fn converged(self) -> bool {
        self != Termination::MaxEvaluations
    }
}

#[derive(Debug, Clone)]
pub struct LmReport {
    pub x: DVector<f64>,
    /// ½‖r‖²
    pub cost: f64,
    pub evaluations: usize,
    pub termination: Termination,
}

#[derive(Debug, Clone)]
pub struct LevenbergMarquardt {
    ftol: f64,
    xtol: f64,
    gtol: f64,
    max_evaluations: usize,
}

/// 初期減衰 μ = τ · max(diag(JᵀJ))
const INITIAL_DAMPING: f64 = 1e-3;
/// 対角スケーリングの下限（ヤコビアンの零列対策）
const MIN_SCALE: f64 = 1e-9;

impl LevenbergMarquardt {
    pub fn new(config: &NlsConfig) -> Self {
        Self {
            ftol: config.ftol,
            xtol: config.xtol,
            gtol: config.gtol,
            max_evaluations: config.max_evaluations.max(1),
        }
    }

    pub fn minimize<P: LeastSquaresProblem>(&self, problem: &P, x0: DVector<f64>) -> LmReport {
        let mut x = x0;
        let mut r = problem.residuals(&x);
        let mut evaluations = 1;
        let mut cost = 0.5 * r.norm_squared();

        let report = |x: DVector<f64>, cost: f64, evaluations: usize, termination: Termination| LmReport {
            x,
            cost,
            evaluations,
            termination,
        };

        if cost == 0.0 {
            return report(x, cost, evaluations, Termination::Ftol);
        }

        let mut j = problem.jacobian(&x);
        let mut jtj = j.transpose() * &j;
        let mut g = j.transpose() * &r;
        if self.gradient_converged(&j, &r, &g) {
            return report(x, cost, evaluations, Termination::Gtol);
        }

        let mut mu = INITIAL_DAMPING * jtj.diagonal().max();
        let mut nu = 2.0;

        loop {
            if evaluations >= self.max_evaluations {
                return report(x, cost, evaluations, Termination::MaxEvaluations);
            }

            let mut a = jtj.clone();
            for i in 0..a.nrows() {
                a[(i, i)] += mu * jtj[(i, i)].max(MIN_SCALE);
            }
            let Some(chol) = a.cholesky() else {
                mu *= nu;
                nu *= 2.0;
                continue;
            };
            let h = chol.solve(&(-&g));

            let x_new = &x + &h;
            let r_new = problem.residuals(&x_new);
            evaluations += 1;
            let cost_new = 0.5 * r_new.norm_squared();

            // 線形化モデルでの予測減少量 ½ hᵀ(μ D h − g)
            let mut damped = DVector::zeros(h.len());
            for i in 0..h.len() {
                damped[i] = mu * jtj[(i, i)].max(MIN_SCALE) * h[i];
            }
            let predicted = 0.5 * h.dot(&(damped - &g));
            let actual = cost - cost_new;
            let step_small = h.norm() <= self.xtol * (x.norm() + self.xtol);

            if actual > 0.0 && cost_new.is_finite() {
                let rho = if predicted > 0.0 { actual / predicted } else { 0.0 };
                let reduction_small = actual <= self.ftol * cost && predicted <= self.ftol * cost;

                x = x_new;
                r = r_new;
                cost = cost_new;

                if cost == 0.0 || reduction_small {
                    return report(x, cost, evaluations, Termination::Ftol);
                }
                if step_small {
                    return report(x, cost, evaluations, Termination::Xtol);
                }

                j = problem.jacobian(&x);
                jtj = j.transpose() * &j;
                g = j.transpose() * &r;
                if self.gradient_converged(&j, &r, &g) {
                    return report(x, cost, evaluations, Termination::Gtol);
                }

                mu *= f64::max(1.0 / 3.0, 1.0 - (2.0 * rho - 1.0).powi(3));
                nu = 2.0;
            } else {
                // 改善しない微小ステップ: これ以上は進めない
                if step_small {
                    return report(x, cost, evaluations, Termination::Xtol);
                }
                mu *= nu;
                nu *= 2.0;
            }
        }
    }

    /// max_j |J_jᵀ r| / (‖J_j‖ ‖r‖) ≤ gtol
    fn gradient_converged(&self, j: &DMatrix<f64>, r: &DVector<f64>, g: &DVector<f64>) -> bool {
        let r_norm = r.norm();
        if r_norm == 0.0 {
            return true;
        }
        let worst = (0..j.ncols())
            .filter_map(|c| {
                let col_norm = j.column(c).norm();
                (col_norm > 0.0).then(|| g[c].abs() / (col_norm * r_norm))
            })
            .fold(0.0, f64::max);
        worst <= self.gtol
    }
}
