use anyhow::{Context, Result};
use std::path::Path;

use walking_recon::config::Config;
use walking_recon::io;
use walking_recon::kinematics::{create_solver, KinematicsSolver};
use walking_recon::model::generate_lower_body_model;

const CONFIG_PATH: &str = "config.toml";

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("walking_recon ({})", env!("GIT_VERSION"));

    let config = Config::load_or_default(CONFIG_PATH);
    let subjects = io::list_subjects(&config.paths.data_dir, &config.paths.subjects)?;
    log::info!(
        "{} subjects, method={}, functional calibration={}",
        subjects.len(),
        config.reconstruction.method,
        config.calibration.use_functional
    );

    let mut failed = Vec::new();
    for subject in &subjects {
        // 被験者単位で失敗を隔離して続行
        if let Err(e) = process_subject(&config, subject) {
            log::error!("{}: {:#}", subject, e);
            failed.push(subject.as_str());
        }
    }

    if failed.is_empty() {
        log::info!("done: {} subjects", subjects.len());
    } else {
        log::warn!("done: {}/{} subjects failed ({})", failed.len(), subjects.len(), failed.join(", "));
    }
    Ok(())
}

fn process_subject(config: &Config, subject: &str) -> Result<()> {
    let dir = config.paths.subject_dir(subject);
    log::info!("[{}] building model from {}", subject, dir.display());

    let trials = io::load_calibration_trials(&dir, config.calibration.use_functional)?;
    let (model, report) =
        generate_lower_body_model(&trials, &config.calibration).with_context(|| format!("{}: model generation failed", subject))?;
    report.log_summary(subject);

    let model_path = config.paths.model_path(subject);
    io::save_model(&model_path, &model)?;
    log::info!("[{}] model saved to {} ({} DoF)", subject, model_path.display(), model.nb_q());

    let solver = create_solver(config.reconstruction.method, &model, config);
    let motions = io::motion_trials(&dir)?;
    let mut failed = 0;
    for path in &motions {
        if let Err(e) = process_trial(config, subject, solver.as_ref(), path) {
            // 試行単位でも失敗を隔離
            log::error!("[{}] {}: {:#}", subject, path.display(), e);
            failed += 1;
        }
    }
    log::info!("[{}] {} trials reconstructed, {} failed", subject, motions.len() - failed, failed);
    Ok(())
}

fn process_trial(config: &Config, subject: &str, solver: &dyn KinematicsSolver, path: &Path) -> Result<()> {
    let name = path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
    let trial = io::load_capture(path)?;
    log::info!("[{}] {}: {} frames at {} Hz", subject, name, trial.len(), trial.frame_rate());

    let result = solver.reconstruct(&trial).with_context(|| format!("{}: reconstruction failed", name))?;
    result.report.log_summary(&format!("{}/{}", subject, name));

    let output = config.paths.result_path(subject, &name, solver.method());
    io::save_reconstruction(&output, &result)?;
    log::info!("[{}] {} saved", subject, output.display());
    Ok(())
}
