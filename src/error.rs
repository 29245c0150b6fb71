use std::fmt;

use thiserror::Error;

/// 設定・入力データの不整合（致命的、リトライなし）
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    #[error("Marker {0} not found in the capture")]
    MarkerNotFound(String),

    #[error("Marker {expected} found multiple times in the capture ({candidates:?})")]
    AmbiguousMarker { expected: String, candidates: Vec<String> },

    #[error("Number of marker names ({names}) does not match number of markers ({markers})")]
    MarkerCountMismatch { names: usize, markers: usize },

    #[error("Markers array first dimension must be 3 (XYZ) or 4 (XYZW), got {0}")]
    InvalidCoordinateDim(usize),

    #[error("Markers array must be 2D or 3D, got {0} dimensions")]
    InvalidArrayRank(usize),

    #[error("Frame rate must be a positive finite number, got {0}")]
    InvalidFrameRate(f64),

    #[error("Duplicate marker name {0}")]
    DuplicateMarker(String),

    #[error("Parent segment {parent} of {segment} has not been added")]
    UnknownParent { segment: String, parent: String },

    #[error("Segment {0} already exists")]
    DuplicateSegment(String),

    #[error("Axis sequence {0:?} is invalid")]
    InvalidAxisSequence(String),

    #[error("Coordinate system of {segment} is degenerate: {reason}")]
    DegenerateAxis { segment: String, reason: String },

    #[error("Functional trial {0} is missing")]
    MissingFunctionalTrial(String),

    #[error("Functional calibration needs at least {required} usable frames, got {available}")]
    InsufficientFrames { required: usize, available: usize },

    #[error("Marker cluster {0:?} could not be fitted (occluded or degenerate)")]
    ClusterFitFailed(Vec<String>),

    #[error("Reconstruction method {0} not recognized")]
    UnknownMethod(String),

    #[error("Invalid kinematic tree: {0}")]
    InvalidTree(String),

    #[error("Generalized coordinate size mismatch: model has {expected} DoF, got {actual}")]
    DofMismatch { expected: usize, actual: usize },
}

pub type Result<T> = std::result::Result<T, Error>;

/// 処理を止めない品質警告（試行・被験者単位で集約して報告）
#[derive(Debug, Clone, PartialEq)]
pub enum QualityWarning {
    /// SCoRE/SARA の回帰が悪条件（機能的可動域不足など）
    IllConditionedCalibration {
        joint: String,
        condition_number: f64,
        residual: f64,
    },
    /// NLS が反復上限に達した（最良推定値を採用）
    NonConvergence { frame: usize, cost: f64 },
    /// 全テクニカルマーカー欠損（前フレームの解を複製）
    FullOcclusion { frame: usize },
    /// EKF のイノベーションが閾値を連続して超えた
    FilterDivergence { frame: usize, nis: f64 },
}

impl fmt::Display for QualityWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IllConditionedCalibration { joint, condition_number, residual } => write!(
                f,
                "{}: ill-conditioned functional calibration (cond={:.3e}, residual={:.4} m)",
                joint, condition_number, residual
            ),
            Self::NonConvergence { frame, cost } => {
                write!(f, "frame {}: iteration cap reached (cost={:.3e})", frame, cost)
            }
            Self::FullOcclusion { frame } => {
                write!(f, "frame {}: all technical markers occluded", frame)
            }
            Self::FilterDivergence { frame, nis } => {
                write!(f, "frame {}: filter divergence (NIS={:.2})", frame, nis)
            }
        }
    }
}

/// 品質警告の集約
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QualityReport {
    warnings: Vec<QualityWarning>,
}

impl QualityReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, warning: QualityWarning) {
        self.warnings.push(warning);
    }

    pub fn extend(&mut self, other: QualityReport) {
        self.warnings.extend(other.warnings);
    }

    pub fn warnings(&self) -> &[QualityWarning] {
        &self.warnings
    }

    pub fn is_empty(&self) -> bool {
        self.warnings.is_empty()
    }

    pub fn non_converged_frames(&self) -> usize {
        self.count(|w| matches!(w, QualityWarning::NonConvergence { .. }))
    }

    pub fn occluded_frames(&self) -> usize {
        self.count(|w| matches!(w, QualityWarning::FullOcclusion { .. }))
    }

    pub fn has_divergence(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, QualityWarning::FilterDivergence { .. }))
    }

    pub fn has_ill_conditioned_calibration(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, QualityWarning::IllConditionedCalibration { .. }))
    }

    fn count(&self, pred: impl Fn(&QualityWarning) -> bool) -> usize {
        self.warnings.iter().filter(|w| pred(w)).count()
    }

    /// 試行終了時にまとめてログ出力
    pub fn log_summary(&self, context: &str) {
        if self.warnings.is_empty() {
            log::info!("{}: no quality warnings", context);
            return;
        }
        let non_converged = self.non_converged_frames();
        let occluded = self.occluded_frames();
        log::warn!(
            "{}: {} quality warnings ({} non-converged frames, {} fully occluded frames)",
            context,
            self.warnings.len(),
            non_converged,
            occluded
        );
        for w in &self.warnings {
            match w {
                // フレーム単位の警告は件数のみ
                QualityWarning::NonConvergence { .. } | QualityWarning::FullOcclusion { .. } => {
                    log::debug!("{}: {}", context, w)
                }
                _ => log::warn!("{}: {}", context, w),
            }
        }
    }
}
