use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use rail_control::{ScaledInterval, SpeedMultiplier};
use rail_driver::{commands, open_session, DriverInput};
use rail_io::{RailConfig, DEFAULT_CONFIG_FILE};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "rail-driver", version, about = "Drive a simulated train against the evaluator")]
struct Cli {
    /// TOML configuration shared with the evaluator.
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Simulation speed, 1..=10 ticks per base period.
    #[arg(long)]
    multiplier: Option<u8>,
    /// Start with the autopilot engaged.
    #[arg(long)]
    autopilot: bool,
    /// End the session after this many simulated seconds.
    #[arg(long)]
    duration: Option<f64>,
    /// Do not connect to the evaluator.
    #[arg(long)]
    no_link: bool,
    #[arg(long)]
    out_dir: Option<PathBuf>,
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
    let mut cfg = match RailConfig::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{e}");
            return Err(e.into());
        }
    };
    if let Some(m) = cli.multiplier {
        cfg.control.multiplier = SpeedMultiplier::new(m)?;
    }
    if cli.autopilot {
        cfg.control.autopilot_on_start = true;
    }
    if cli.duration.is_some() {
        cfg.session.duration_s = cli.duration;
    }
    if let Some(dir) = cli.out_dir {
        cfg.session.out_dir = dir;
    }
    if let Err(e) = cfg.validate() {
        error!("{e}");
        return Err(e.into());
    }

    let curves = match cfg.load_curves() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("{e}");
            return Err(e.into());
        }
    };

    let (tx, rx) = commands::channel();
    commands::spawn_stdin_reader(tx.clone());
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(DriverInput::Quit);
        }
    });

    let session = open_session(&cfg, curves, !cli.no_link, rx).await;
    info!(
        multiplier = cfg.control.multiplier.get(),
        tick_ms = cfg.control.tick_period().as_millis() as u64,
        "driving; inputs: traction|coast|brake|up|down|autopilot|quit"
    );
    let mut scheduler = ScaledInterval::new(cfg.control.base_tick(), cfg.control.multiplier);
    let summary = session.run(&mut scheduler).await;

    for (kind, e) in &summary.report.failed {
        warn!(?kind, error = %e, "artifact missing");
    }
    info!(
        reason = summary.end_reason.as_str(),
        position_m = summary.final_state.position_m,
        overshoot_pct = summary.local_score.overshoot_pct,
        comfort = %summary.local_score.comfort,
        on_time = summary.local_score.on_time,
        link_lost = summary.link_lost,
        "done"
    );
    Ok(())
}
