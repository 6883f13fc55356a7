use rail_analysis::{MetricsEngine, SessionEnd, SessionScore};
use rail_io::export_score_json;
use rail_link_core::*;
use rail_link_tcp::FrameStream;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::{EvaluatorSettings, SessionRegistry};

/// Scores one connection until the simulator ends the session or the link
/// closes. A closed link finalizes the score as incomplete; nothing here
/// touches another connection's state.
pub async fn evaluate_connection(
    mut stream: FrameStream,
    settings: &EvaluatorSettings,
    registry: &SessionRegistry,
) -> SessionScore {
    let peer = stream.peer();
    let conn = registry.open(peer);
    info!(conn, %peer, "simulator connected");

    let mut engine = MetricsEngine::new(settings.curves.clone(), settings.plan.clone());
    let mut seq = 0u64;
    let heartbeat = time::sleep(settings.heartbeat);
    tokio::pin!(heartbeat);

    let end = loop {
        tokio::select! {
            res = stream.recv() => match res {
                Ok(Some(Ok(Frame::Sample(rec)))) => {
                    match engine.session_id() {
                        None => {
                            engine.set_session_id(rec.session_id);
                            registry.bind_session(conn, rec.session_id);
                            info!(conn, session = %rec.session_id.simple(), "session started");
                        }
                        Some(id) if id != rec.session_id => {
                            warn!(conn, expected = %id.simple(), got = %rec.session_id.simple(), "sample from another session");
                            engine.note_dropped();
                            continue;
                        }
                        Some(_) => {}
                    }
                    let score = match engine.observe(&rec.to_sample()) {
                        Ok(score) => score,
                        Err(e) => {
                            warn!(conn, error = %e, "sample rejected");
                            continue;
                        }
                    };
                    registry.progress(conn, engine.samples_scored());
                    let reply = Frame::Score(ScoreReply {
                        tick: score.tick,
                        overshoot_pct: score.record.overshoot_pct,
                        comfort: score.record.comfort,
                        cumulative_flag: score.cumulative_flag,
                    });
                    if let Err(e) = stream.send(&reply, settings.io_timeout).await {
                        warn!(conn, error = %e, "reply failed");
                        break SessionEnd::LinkClosed;
                    }
                    heartbeat.as_mut().reset(Instant::now() + settings.heartbeat);
                }
                Ok(Some(Ok(Frame::End(end)))) => {
                    if engine.session_id().is_some_and(|id| id != end.session_id) {
                        warn!(conn, got = %end.session_id.simple(), "end record from another session");
                        engine.note_dropped();
                        continue;
                    }
                    debug!(conn, tick = end.tick, position_m = end.position_m, "end of session");
                    break SessionEnd::Explicit { time_s: end.timestamp_ms as f64 / 1000.0, position_m: end.position_m };
                }
                Ok(Some(Ok(other))) => warn!(conn, kind = other.kind(), "unexpected record from simulator"),
                Ok(Some(Err(e))) => {
                    warn!(conn, error = %e, "dropping malformed record");
                    engine.note_dropped();
                }
                Ok(None) => {
                    warn!(conn, "simulator left without ending the session");
                    break SessionEnd::LinkClosed;
                }
                Err(e) => {
                    warn!(conn, error = %e, "link read failed");
                    break SessionEnd::LinkClosed;
                }
            },
            () = &mut heartbeat => {
                seq += 1;
                if let Err(e) = stream.send(&Frame::Heartbeat(Heartbeat { seq }), settings.io_timeout).await {
                    warn!(conn, error = %e, "heartbeat failed");
                    break SessionEnd::LinkClosed;
                }
                heartbeat.as_mut().reset(Instant::now() + settings.heartbeat);
            }
        }
    };

    if let Err(e) = stream.shutdown().await {
        debug!(conn, error = %e, "shutdown after session");
    }
    let score = engine.finalize(end);
    registry.close(conn, &score);
    if let Some(dir) = &settings.out_dir {
        match export_score_json(&score, dir, &format!("conn{conn}")) {
            Ok(path) => info!(conn, path = %path.display(), complete = score.complete, "score written"),
            Err(e) => warn!(conn, error = %e, "score not written"),
        }
    }
    score
}
