pub mod commands;
pub mod session;

use std::sync::Arc;

use crossbeam_channel::Receiver;
use rail_control::{ControlLoop, DwellStop, StationDwell};
use rail_dynamics::DynamicsModel;
use rail_io::RailConfig;
use rail_link_tcp::SimLink;
use rail_model::CurveSet;
use tracing::warn;

pub use commands::{DriverInput, UnknownInput};
pub use session::{DriveSession, DriveSettings, EndReason, SessionSummary};

/// Builds a session from configuration. With `connect`, a failed connection
/// is logged and the session runs locally.
pub async fn open_session(
    cfg: &RailConfig,
    curves: Arc<CurveSet>,
    connect: bool,
    inputs: Receiver<DriverInput>,
) -> DriveSession {
    let bounds = cfg.control.bounds();
    let model = DynamicsModel::new(cfg.vehicle.params(), bounds, curves);
    let stops = cfg
        .evaluation
        .stops
        .iter()
        .map(|s| DwellStop { name: s.name.clone(), position_m: s.position_m })
        .collect();
    let dwell = StationDwell::new(stops, cfg.evaluation.capture_radius_m, cfg.session.dwell_s);
    let control = ControlLoop::new(bounds, cfg.control.autopilot.clone()).with_dwell(dwell);
    // a send may never hold up the loop for longer than one tick
    let io_timeout = cfg.link.io_timeout().min(cfg.control.tick_period());

    let mut unreachable = None;
    let link = if connect {
        match SimLink::connect(&cfg.link.addr(), cfg.link.connect_timeout(), io_timeout).await {
            Ok(link) => link,
            Err(e) => {
                warn!(addr = %cfg.link.addr(), error = %e, "evaluator unreachable, driving without scoring");
                unreachable = Some(e.to_string());
                SimLink::offline()
            }
        }
    } else {
        SimLink::offline()
    };

    let mut session = DriveSession::new(DriveSettings::from_config(cfg), model, control, link, inputs, cfg.evaluation.clone());
    if let Some(reason) = unreachable {
        session.note_link_unavailable(reason);
    }
    session
}
