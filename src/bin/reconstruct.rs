use anyhow::{bail, Result};
use std::path::PathBuf;

use walking_recon::config::Config;
use walking_recon::io;
use walking_recon::kinematics::{create_solver, ReconstructionMethod};

const CONFIG_PATH: &str = "config.toml";

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("reconstruct ({})", env!("GIT_VERSION"));

    // Usage: reconstruct <model.json> <trial.json> [method] [output.json]
    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        bail!("Usage: reconstruct <model.json> <trial.json> [nls|kalman] [output.json]");
    }
    let config = Config::load_or_default(CONFIG_PATH);
    let model_path = PathBuf::from(&args[1]);
    let trial_path = PathBuf::from(&args[2]);
    let method: ReconstructionMethod = match args.get(3) {
        Some(m) => m.parse()?,
        None => config.reconstruction.method,
    };
    let output = match args.get(4) {
        Some(p) => PathBuf::from(p),
        None => config.paths.result_path_for_trial(&trial_path, method),
    };

    let model = io::load_model(&model_path)?;
    let trial = io::load_capture(&trial_path)?;
    log::info!("{}: {} frames, {} markers, method={}", trial_path.display(), trial.len(), trial.marker_count(), method);

    let solver = create_solver(method, &model, &config);
    let result = solver.reconstruct(&trial)?;
    result.report.log_summary("reconstruct");

    io::save_reconstruction(&output, &result)?;
    log::info!("saved {}", output.display());
    Ok(())
}
