use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use rail_evaluator::{offline, EvaluatorServer, EvaluatorSettings};
use rail_io::{export_score_json, RailConfig, DEFAULT_CONFIG_FILE};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rail-evaluator", version, about = "Score driving sessions")]
struct Cli {
    /// TOML configuration shared with the driver.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Where score files are written (defaults to the configured session output directory).
    #[arg(long, global = true)]
    out_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Listen for simulator connections.
    Serve {
        #[arg(long)]
        port: Option<u16>,
        /// Exit after the first session.
        #[arg(long)]
        once: bool,
    },
    /// Score an exported sample table.
    Offline { samples: PathBuf },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;
    rt.block_on(run(cli))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut cfg = RailConfig::load(&cli.config).map_err(|e| {
        error!("{e}");
        e
    })?;
    if let Some(dir) = cli.out_dir {
        cfg.session.out_dir = dir;
    }
    let curves = Arc::new(cfg.load_curves().map_err(|e| {
        error!("{e}");
        e
    })?);

    match cli.command {
        Command::Serve { port, once } => {
            if let Some(port) = port {
                cfg.link.port = port;
            }
            let bind_addr = format!("0.0.0.0:{}", cfg.link.port);
            let server = EvaluatorServer::bind(&bind_addr, EvaluatorSettings::from_config(&cfg, curves)).await?;
            if once {
                let score = server.serve_one().await?;
                info!(complete = score.complete, overshoot_pct = score.summary.overshoot_pct, "session scored");
                Ok(())
            } else {
                server.serve().await
            }
        }
        Command::Offline { samples } => {
            let score = offline::evaluate_file(&samples, curves, cfg.evaluation.clone())?;
            let stem = samples.file_stem().and_then(|s| s.to_str()).unwrap_or("offline");
            let path = export_score_json(&score, &cfg.session.out_dir, stem)?;
            info!(
                path = %path.display(),
                overshoot_pct = score.summary.overshoot_pct,
                comfort = %score.summary.comfort,
                on_time = score.summary.on_time,
                "offline score written"
            );
            Ok(())
        }
    }
}
