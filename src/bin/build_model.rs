use anyhow::{bail, Result};
use std::path::PathBuf;

use walking_recon::config::Config;
use walking_recon::io;
use walking_recon::model::generate_lower_body_model;

const CONFIG_PATH: &str = "config.toml";

struct Args {
    subject_dir: PathBuf,
    output: Option<PathBuf>,
    anatomical: bool,
}

fn parse_args() -> Result<Args> {
    // Usage: build_model <subject_dir> [output.json] [--anatomical]
    let mut positional = Vec::new();
    let mut anatomical = false;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--anatomical" => anatomical = true,
            _ => positional.push(PathBuf::from(arg)),
        }
    }
    let mut positional = positional.into_iter();
    let Some(subject_dir) = positional.next() else {
        bail!("Usage: build_model <subject_dir> [output.json] [--anatomical]");
    };
    Ok(Args { subject_dir, output: positional.next(), anatomical })
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("build_model ({})", env!("GIT_VERSION"));

    let args = parse_args()?;
    let mut config = Config::load_or_default(CONFIG_PATH);
    if args.anatomical {
        config.calibration.use_functional = false;
    }

    let trials = io::load_calibration_trials(&args.subject_dir, config.calibration.use_functional)?;
    let (model, report) = generate_lower_body_model(&trials, &config.calibration)?;
    report.log_summary("model");

    for segment in model.segments() {
        log::info!(
            "  {:<8} parent={:<8} T={:<3} R={:<3} markers={}",
            segment.name,
            segment.parent,
            segment.translations.to_string(),
            segment.rotations.to_string(),
            segment.markers.len()
        );
    }

    let output = args.output.unwrap_or_else(|| args.subject_dir.join(format!("{}.json", config.paths.model_name)));
    io::save_model(&output, &model)?;
    log::info!("saved {} ({} DoF)", output.display(), model.nb_q());
    Ok(())
}
