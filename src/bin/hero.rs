//! Generate one hero image from the command line.
//!
//! Exit codes: 0 accepted, 1 generation failed, 2 manual review needed,
//! 3 configuration error.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use log::{error, info, warn};

use hero_image::core::Config;
use hero_image::features::session::{ParamField, RefinementSession};
use hero_image::HeroError;

#[derive(Parser)]
#[command(name = "hero")]
#[command(about = "Generate a validated hero image with automatic model fallback", long_about = None)]
struct Cli {
    /// What the image should show
    #[arg(short, long)]
    prompt: String,

    /// Primary model (flux-pro, flux-dev, flux-schnell, imagen)
    #[arg(short, long)]
    model: Option<String>,

    /// Preset (small, medium, large) or WxH
    #[arg(short, long)]
    size: Option<String>,

    /// Skip the vision quality check
    #[arg(long, default_value_t = false)]
    no_validate: bool,

    /// File name in the output directory
    #[arg(short, long)]
    output: Option<String>,

    /// YAML file overriding environment settings
    #[arg(short, long, env = "HERO_CONFIG_PATH")]
    config: Option<PathBuf>,
}

const EXIT_FAILED: u8 = 1;
const EXIT_MANUAL_REVIEW: u8 = 2;
const EXIT_CONFIGURATION: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv().ok();
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e:#}");
            return ExitCode::from(EXIT_CONFIGURATION);
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&config.log_level))
        .init();

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let code = match &e {
                HeroError::Configuration(_) | HeroError::UnknownModel(_) => EXIT_CONFIGURATION,
                HeroError::NeedsManualReview(_) => EXIT_MANUAL_REVIEW,
                _ => EXIT_FAILED,
            };
            error!("{e}");
            if let Some(report) = e.report() {
                eprintln!("{}", report.diagnostic_summary());
            } else {
                eprintln!("{e}");
            }
            ExitCode::from(code)
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let config = Config::from_env().context("Failed to load configuration from environment")?;
    match &cli.config {
        Some(path) => config
            .with_overlay_file(path)
            .with_context(|| format!("Failed to apply config file {}", path.display())),
        None => Ok(config),
    }
}

async fn run(cli: Cli, config: Config) -> Result<(), HeroError> {
    let mut session = RefinementSession::from_config(config, &cli.prompt)?;

    if let Some(model) = &cli.model {
        session.modify(ParamField::Model, model)?;
    }
    if let Some(size) = &cli.size {
        session.modify(ParamField::Size, size)?;
    }
    if cli.no_validate {
        session.modify(ParamField::Validation, "off")?;
    }

    let cancel = session.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current attempt");
            cancel.cancel();
        }
    });

    info!(
        "Generating {} image with {} (estimated ${:.3})",
        session.request().size,
        session.request().model,
        session.cost_estimate()
    );

    let report = session.regenerate().await?;
    let summary = session.accept(cli.output.as_deref()).await?;

    println!("{}", report.diagnostic_summary());
    println!("{summary}");
    Ok(())
}
