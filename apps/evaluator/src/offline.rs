use std::{path::Path, sync::Arc};

use anyhow::Result;
use rail_analysis::{EvaluationPlan, MetricsEngine, SessionEnd, SessionScore};
use rail_io::import_samples_csv;
use rail_model::CurveSet;
use tracing::{info, warn};

/// Scores a previously exported sample table with the same engine the live
/// link uses. A file is a finished recording, so the score is complete.
pub fn evaluate_file(path: &Path, curves: Arc<CurveSet>, plan: EvaluationPlan) -> Result<SessionScore> {
    let samples = import_samples_csv(path)?;
    info!(path = %path.display(), samples = samples.len(), "offline evaluation");
    let mut engine = MetricsEngine::new(curves, plan);
    for s in &samples {
        if let Err(e) = engine.observe(s) {
            warn!(error = %e, "sample rejected");
        }
    }
    let end = match samples.last() {
        Some(last) => SessionEnd::Explicit { time_s: last.state.time_s, position_m: last.state.position_m },
        None => SessionEnd::LinkClosed,
    };
    Ok(engine.finalize(end))
}
