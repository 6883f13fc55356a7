pub mod offline;
pub mod server;
pub mod session;

use std::{path::PathBuf, sync::Arc, time::Duration};

use rail_analysis::EvaluationPlan;
use rail_io::RailConfig;
use rail_model::CurveSet;

pub use server::{ConnectionState, ConnectionStatus, EvaluatorServer, SessionRegistry};
pub use session::evaluate_connection;

/// Read-only inputs shared by every connection.
#[derive(Debug, Clone)]
pub struct EvaluatorSettings {
    pub curves: Arc<CurveSet>,
    pub plan: EvaluationPlan,
    pub heartbeat: Duration,
    pub io_timeout: Duration,
    /// Where `evaluation_<session>.json` goes; `None` keeps scores in memory only.
    pub out_dir: Option<PathBuf>,
}

impl EvaluatorSettings {
    pub fn from_config(cfg: &RailConfig, curves: Arc<CurveSet>) -> Self {
        Self {
            curves,
            plan: cfg.evaluation.clone(),
            heartbeat: cfg.link.heartbeat(),
            io_timeout: cfg.link.io_timeout(),
            out_dir: Some(cfg.session.out_dir.clone()),
        }
    }
}
