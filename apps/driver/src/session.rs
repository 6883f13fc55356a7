use std::{path::PathBuf, sync::Arc, time::Duration};

use crossbeam_channel::Receiver;
use rail_analysis::{EvaluationPlan, MetricsEngine, SessionEnd, STOPPED_MPS};
use rail_control::{ControlLoop, TickScheduler};
use rail_dynamics::DynamicsModel;
use rail_io::{session_stamp, RailConfig, ReportGenerator, ReportOutcome};
use rail_link_core::*;
use rail_link_tcp::{LinkEvent, SimLink};
use rail_model::*;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::commands::DriverInput;

#[derive(Debug, Clone)]
pub struct DriveSettings {
    pub physics_dt_s: f64,
    pub start_position_m: f64,
    pub duration_s: Option<f64>,
    pub terminal_position_m: Option<f64>,
    pub terminal_radius_m: f64,
    pub autopilot: bool,
    pub out_dir: PathBuf,
    pub linger: Duration,
}

impl DriveSettings {
    pub fn from_config(cfg: &RailConfig) -> Self {
        Self {
            physics_dt_s: cfg.control.physics_dt_s,
            start_position_m: cfg.vehicle.start_position_m,
            duration_s: cfg.session.duration_s,
            terminal_position_m: cfg.session.terminal_position_m,
            terminal_radius_m: cfg.evaluation.capture_radius_m,
            autopilot: cfg.control.autopilot_on_start,
            out_dir: cfg.session.out_dir.clone(),
            linger: cfg.link.linger(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndReason {
    Duration,
    TerminalStop,
    DriverQuit,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EndReason::Duration => "duration",
            EndReason::TerminalStop => "terminal_stop",
            EndReason::DriverQuit => "driver_quit",
        }
    }
}

#[derive(Debug)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub end_reason: EndReason,
    pub ticks: u64,
    pub final_state: VehicleState,
    /// Scored locally from the same samples the evaluator received.
    pub local_score: ScoreRecord,
    pub last_reply: Option<ScoreReply>,
    pub replies: u64,
    pub link_lost: bool,
    pub report: ReportOutcome,
    pub samples: Vec<TelemetrySample>,
}

/// One driving session. Owns every piece of per-session state; nothing is
/// shared with other sessions or threads besides the input channel.
pub struct DriveSession {
    id: Uuid,
    settings: DriveSettings,
    model: DynamicsModel,
    control: ControlLoop,
    link: SimLink,
    inputs: Receiver<DriverInput>,
    local: MetricsEngine,
    state: VehicleState,
    samples: Vec<TelemetrySample>,
    over_ceiling: bool,
    has_moved: bool,
    last_reply: Option<ScoreReply>,
    replies: u64,
    link_lost: bool,
    unreachable: Option<String>,
    stamp: String,
}

impl DriveSession {
    pub fn new(
        settings: DriveSettings,
        model: DynamicsModel,
        control: ControlLoop,
        link: SimLink,
        inputs: Receiver<DriverInput>,
        plan: EvaluationPlan,
    ) -> Self {
        let id = Uuid::new_v4();
        let mut local = MetricsEngine::new(Arc::new(model.curves().clone()), plan);
        local.set_session_id(id);
        let state = VehicleState::at_rest(settings.start_position_m);
        Self {
            id,
            settings,
            model,
            control,
            link,
            inputs,
            local,
            state,
            samples: Vec::new(),
            over_ceiling: false,
            has_moved: false,
            last_reply: None,
            replies: 0,
            link_lost: false,
            unreachable: None,
            stamp: session_stamp(time::OffsetDateTime::now_utc()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn stamp(&self) -> &str {
        &self.stamp
    }

    /// Records that the evaluator could not be reached before the first tick.
    pub fn note_link_unavailable(&mut self, reason: String) {
        self.unreachable = Some(reason);
    }

    pub async fn run<S: TickScheduler>(mut self, scheduler: &mut S) -> SessionSummary {
        let started = Instant::now();
        self.control.set_clock(self.state.time_s);
        self.control.record(SessionEvent::SessionStarted { session_id: self.id, position_m: self.state.position_m });
        if let Some(peer) = self.link.peer() {
            self.control.record(SessionEvent::LinkUp { peer: peer.to_string() });
        }
        if let Some(reason) = self.unreachable.take() {
            self.mark_link_down(reason);
        }
        if self.settings.autopilot {
            self.control.engage_autopilot();
        }
        info!(session = %self.id.simple(), link = %self.link.status(), "session started");

        let mut tick = 0u64;
        let reason = loop {
            tokio::select! {
                _ = scheduler.next_tick() => {
                    if let Some(reason) = self.tick(tick, started).await {
                        break reason;
                    }
                    tick += 1;
                }
                ev = self.link.recv(), if self.link.is_up() => self.on_link_event(ev),
            }
        };
        self.finish(reason, tick + 1).await
    }

    async fn tick(&mut self, tick: u64, started: Instant) -> Option<EndReason> {
        let mut quit = false;
        let pending: Vec<DriverInput> = self.inputs.try_iter().collect();
        for input in pending {
            match input {
                DriverInput::SetMode(mode) => {
                    self.control.set_mode(mode);
                }
                DriverInput::LevelUp => {
                    self.control.adjust_level(1);
                }
                DriverInput::LevelDown => {
                    self.control.adjust_level(-1);
                }
                DriverInput::ToggleAutopilot => {
                    if self.control.autopilot_engaged() {
                        self.control.disengage_autopilot("driver toggle");
                    } else {
                        self.control.engage_autopilot();
                    }
                }
                DriverInput::Quit => quit = true,
            }
        }

        let dt = self.settings.physics_dt_s;
        let cmd = self.control.tick(&self.state, &self.model, dt);
        let out = self.model.step(&self.state, cmd, dt);
        self.state = out.state;
        self.control.set_clock(self.state.time_s);
        self.has_moved |= self.state.velocity_mps > STOPPED_MPS;

        if out.ceiling_exceeded != self.over_ceiling {
            self.over_ceiling = out.ceiling_exceeded;
            let position_m = self.state.position_m;
            if out.ceiling_exceeded {
                warn!(position_m, velocity_mps = self.state.velocity_mps, ceiling_mps = out.ceiling_mps, "above ceiling");
                self.control.record(SessionEvent::CeilingExceeded {
                    position_m,
                    velocity_mps: self.state.velocity_mps,
                    ceiling_mps: out.ceiling_mps,
                });
            } else {
                self.control.record(SessionEvent::CeilingCleared { position_m });
            }
        }

        let sample = TelemetrySample {
            tick,
            state: self.state,
            wall_elapsed_ms: started.elapsed().as_millis() as u64,
        };
        self.samples.push(sample);
        if let Err(e) = self.local.observe(&sample) {
            debug!(error = %e, "local scoring skipped sample");
        }
        if self.link.is_up() {
            if let Err(e) = self.link.send(&Frame::Sample(SampleRecord::from_sample(self.id, &sample))).await {
                self.mark_link_down(e.to_string());
            }
        }

        if quit {
            return Some(EndReason::DriverQuit);
        }
        if let Some(limit) = self.settings.duration_s {
            if self.state.time_s >= limit - 1e-6 {
                return Some(EndReason::Duration);
            }
        }
        if let Some(terminal) = self.settings.terminal_position_m {
            let at_rest = self.state.velocity_mps <= STOPPED_MPS;
            if self.has_moved && at_rest && (self.state.position_m - terminal).abs() <= self.settings.terminal_radius_m {
                return Some(EndReason::TerminalStop);
            }
        }
        None
    }

    fn on_link_event(&mut self, ev: LinkEvent) {
        match ev {
            LinkEvent::Frame(Frame::Score(reply)) => self.on_reply(reply),
            LinkEvent::Frame(Frame::Heartbeat(hb)) => debug!(seq = hb.seq, "evaluator heartbeat"),
            LinkEvent::Frame(other) => warn!(kind = other.kind(), "unexpected record from evaluator"),
            LinkEvent::Dropped(_) => {}
            LinkEvent::Down(reason) => self.mark_link_down(reason),
        }
    }

    fn on_reply(&mut self, reply: ScoreReply) {
        self.replies += 1;
        let changed = match self.last_reply {
            None => true,
            Some(prev) => prev.comfort != reply.comfort || prev.cumulative_flag != reply.cumulative_flag,
        };
        if changed {
            self.control.record(SessionEvent::ScoreReceived {
                tick: reply.tick,
                overshoot_pct: reply.overshoot_pct,
                comfort: reply.comfort,
            });
        }
        self.last_reply = Some(reply);
    }

    fn mark_link_down(&mut self, reason: String) {
        if !self.link_lost {
            self.link_lost = true;
            warn!(%reason, "evaluation link down, driving continues locally");
            self.control.record(SessionEvent::LinkDown { reason });
        }
    }

    async fn finish(mut self, reason: EndReason, ticks: u64) -> SessionSummary {
        let position_m = self.state.position_m;
        self.control.record(SessionEvent::SessionEnded { reason: reason.as_str().to_string(), position_m });

        if self.link.is_up() {
            let end = EndOfSession {
                session_id: self.id,
                tick: self.samples.last().map_or(0, |s| s.tick),
                timestamp_ms: seconds_to_ms(self.state.time_s),
                position_m,
            };
            match self.link.send(&Frame::End(end)).await {
                Ok(()) => {
                    for frame in self.link.close(self.settings.linger).await {
                        if let Frame::Score(reply) = frame {
                            self.on_reply(reply);
                        }
                    }
                }
                Err(e) => self.mark_link_down(e.to_string()),
            }
        }

        let score = self.local.finalize(SessionEnd::Explicit { time_s: self.state.time_s, position_m });
        let log = self.control.into_log();
        let report = ReportGenerator::new(&self.settings.out_dir, &self.stamp).write_all(
            &log,
            &self.samples,
            Some(&score.summary),
            self.model.curves(),
        );
        info!(
            session = %self.id.simple(),
            reason = reason.as_str(),
            ticks,
            position_m,
            replies = self.replies,
            artifacts = report.written.len(),
            "session ended"
        );

        SessionSummary {
            session_id: self.id,
            end_reason: reason,
            ticks,
            final_state: self.state,
            local_score: score.summary,
            last_reply: self.last_reply,
            replies: self.replies,
            link_lost: self.link_lost,
            report,
            samples: self.samples,
        }
    }
}
