//! Driver/autopilot control and tick pacing.
//!
//! `ControlLoop` owns the current command and the session log. Manual input goes
//! through `set_mode` / `adjust_level`; the autopilot is a velocity PID whose
//! output is quantised onto the level notches and rate limited per tick.
//! `TickScheduler` paces the loop in wall-clock time, scaled by the speed
//! multiplier; the physics dt is independent of it. `StationDwell` holds the
//! train at scheduled stops and overrides both driver and autopilot meanwhile.

use std::time::Duration;

use rail_dynamics::DynamicsModel;
use rail_model::*;
use serde::{Deserialize, Serialize};
use tokio::time::{self, Interval, MissedTickBehavior};
use tracing::{debug, info};

pub const DEFAULT_BASE_TICK: Duration = Duration::from_millis(100);
pub const DEFAULT_PHYSICS_DT_S: f64 = 0.1;

// ---------------------------------------------------------------------------
// Pacing

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("speed multiplier {0} outside {min}..={max}", min = SpeedMultiplier::MIN, max = SpeedMultiplier::MAX)]
pub struct MultiplierOutOfRange(pub u8);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct SpeedMultiplier(u8);

impl SpeedMultiplier {
    pub const MIN: u8 = 1;
    pub const MAX: u8 = 10;

    pub fn new(value: u8) -> Result<Self, MultiplierOutOfRange> {
        if (Self::MIN..=Self::MAX).contains(&value) {
            Ok(Self(value))
        } else {
            Err(MultiplierOutOfRange(value))
        }
    }

    pub fn get(self) -> u8 {
        self.0
    }

    pub fn tick_period(self, base: Duration) -> Duration {
        base / self.0 as u32
    }
}

impl Default for SpeedMultiplier {
    fn default() -> Self {
        Self(1)
    }
}

impl TryFrom<u8> for SpeedMultiplier {
    type Error = MultiplierOutOfRange;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SpeedMultiplier> for u8 {
    fn from(m: SpeedMultiplier) -> u8 {
        m.0
    }
}

/// Wall-clock cadence of the control loop.
#[async_trait::async_trait]
pub trait TickScheduler: Send {
    async fn next_tick(&mut self);
    /// Wall time budget of one tick; zero when unpaced.
    fn period(&self) -> Duration;
}

/// Real-time pacing: `base / multiplier` per tick. Late ticks are delayed,
/// never bunched up.
pub struct ScaledInterval {
    interval: Interval,
    period: Duration,
}

impl ScaledInterval {
    pub fn new(base: Duration, multiplier: SpeedMultiplier) -> Self {
        let period = multiplier.tick_period(base).max(Duration::from_millis(1));
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval, period }
    }
}

#[async_trait::async_trait]
impl TickScheduler for ScaledInterval {
    async fn next_tick(&mut self) {
        self.interval.tick().await;
    }

    fn period(&self) -> Duration {
        self.period
    }
}

/// Runs ticks back to back, yielding to the runtime in between. Used for
/// replays and tests.
#[derive(Default)]
pub struct Unpaced;

#[async_trait::async_trait]
impl TickScheduler for Unpaced {
    async fn next_tick(&mut self) {
        tokio::task::yield_now().await;
    }

    fn period(&self) -> Duration {
        Duration::ZERO
    }
}

// ---------------------------------------------------------------------------
// Autopilot

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutopilotGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    /// Demanded acceleration is clamped to ±this (m/s²).
    pub output_limit_mps2: f64,
    /// The integral term is clamped to ±this (m/s²).
    pub integral_limit_mps2: f64,
    /// Largest notch change per tick.
    pub max_notch_step: u8,
}

impl Default for AutopilotGains {
    fn default() -> Self {
        Self {
            kp: 0.8,
            ki: 0.2,
            kd: 0.0,
            output_limit_mps2: 1.1,
            integral_limit_mps2: 0.5,
            max_notch_step: 1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Pid {
    gains: AutopilotGains,
    integral: f64,
    last_error: Option<f64>,
}

impl Pid {
    pub fn new(gains: AutopilotGains) -> Self {
        Self { gains, integral: 0.0, last_error: None }
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.last_error = None;
    }

    pub fn update(&mut self, error: f64, dt: f64) -> f64 {
        let g = &self.gains;
        let limit = g.output_limit_mps2.abs();
        let p = g.kp * error;
        let d = match self.last_error {
            Some(prev) if g.kd != 0.0 && dt > 0.0 => g.kd * (error - prev) / dt,
            _ => 0.0,
        };

        // hold the integral while the output is pinned in the direction of the error
        let unclamped = p + self.integral + d;
        let pinned = (unclamped >= limit && error > 0.0) || (unclamped <= -limit && error < 0.0);
        if !pinned {
            let il = g.integral_limit_mps2.abs();
            self.integral = (self.integral + g.ki * error * dt).clamp(-il, il);
        }
        self.last_error = Some(error);

        (p + self.integral + d).clamp(-limit, limit)
    }
}

#[derive(Clone, Debug)]
pub struct Autopilot {
    pid: Pid,
}

impl Autopilot {
    pub fn new(gains: AutopilotGains) -> Self {
        Self { pid: Pid::new(gains) }
    }

    /// Starts the regulator afresh, as when leaving a station.
    pub fn reset(&mut self) {
        self.pid.reset();
    }

    /// Notch that would deliver the PID's demanded acceleration toward
    /// `target_mps`, with running resistance fed forward.
    pub fn desired_notch(&mut self, state: &VehicleState, target_mps: f64, plant: &DynamicsModel, dt: f64) -> i16 {
        let v = state.velocity_mps;
        let demand = self.pid.update(target_mps - v, dt);
        let required = demand * plant.params().mass_kg() + plant.resistance_force(v);
        let bounds = plant.bounds();

        if required > 0.0 {
            notch_for(required, plant.max_force(ControlMode::Traction, v), bounds.traction_max)
        } else {
            -notch_for(-required, plant.max_force(ControlMode::Brake, v), bounds.brake_max)
        }
    }
}

fn notch_for(force: f64, envelope: f64, max_level: u8) -> i16 {
    if envelope <= 0.0 || max_level == 0 {
        return 0;
    }
    let levels = (force / envelope * max_level as f64).round();
    levels.clamp(0.0, max_level as f64) as i16
}

// ---------------------------------------------------------------------------
// Station dwell

/// Above this speed a train inside a station window is passing, not stopping.
pub const DWELL_CAPTURE_MPS: f64 = 1.0;

#[derive(Clone, Debug, PartialEq)]
pub struct DwellStop {
    pub name: String,
    pub position_m: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum DwellPhase {
    Running { moved: bool },
    Holding { stop: usize, until_s: f64 },
    Departing { stop: usize, clear_at_m: f64 },
}

#[derive(Clone, Debug, PartialEq)]
pub enum DwellTransition {
    Captured { stop: String, position_m: f64 },
    Released { stop: String },
}

/// Scheduled stops in route order. A train that slows below
/// `DWELL_CAPTURE_MPS` within `radius_m` of a pending stop is held there
/// for `dwell_s`, then released toward the far edge of the stop's window.
#[derive(Clone, Debug)]
pub struct StationDwell {
    stops: Vec<DwellStop>,
    next: usize,
    radius_m: f64,
    dwell_s: f64,
    phase: DwellPhase,
}

impl Default for StationDwell {
    fn default() -> Self {
        Self::new(Vec::new(), 0.0, 0.0)
    }
}

impl StationDwell {
    pub fn new(stops: Vec<DwellStop>, radius_m: f64, dwell_s: f64) -> Self {
        Self { stops, next: 0, radius_m, dwell_s, phase: DwellPhase::Running { moved: false } }
    }

    pub fn is_holding(&self) -> bool {
        matches!(self.phase, DwellPhase::Holding { .. })
    }

    /// Stops not yet served.
    pub fn pending(&self) -> &[DwellStop] {
        &self.stops[self.next..]
    }

    /// Where the target curve should be read. Leaving a stop, the approach
    /// curve still pins the target near zero, so it is read past the window.
    pub fn lookup_position(&self, position_m: f64) -> f64 {
        match self.phase {
            DwellPhase::Departing { clear_at_m, .. } => position_m.max(clear_at_m),
            _ => position_m,
        }
    }

    pub fn update(&mut self, state: &VehicleState) -> Option<DwellTransition> {
        match self.phase {
            DwellPhase::Running { moved } => {
                let moved = moved || state.velocity_mps > STOPPED_MPS;
                self.phase = DwellPhase::Running { moved };
                if !moved || state.velocity_mps > DWELL_CAPTURE_MPS {
                    return None;
                }
                let radius = self.radius_m;
                let offset = self.stops[self.next..]
                    .iter()
                    .position(|s| (state.position_m - s.position_m).abs() <= radius)?;
                let stop = self.next + offset;
                self.next = stop + 1;
                self.phase = DwellPhase::Holding { stop, until_s: state.time_s + self.dwell_s };
                Some(DwellTransition::Captured { stop: self.stops[stop].name.clone(), position_m: state.position_m })
            }
            DwellPhase::Holding { stop, until_s } => {
                if state.time_s < until_s {
                    return None;
                }
                let clear_at_m = self.stops[stop].position_m + self.radius_m;
                self.phase = DwellPhase::Departing { stop, clear_at_m };
                Some(DwellTransition::Released { stop: self.stops[stop].name.clone() })
            }
            DwellPhase::Departing { stop, clear_at_m } => {
                if state.position_m >= clear_at_m {
                    debug!(stop = %self.stops[stop].name, "station window cleared");
                    self.phase = DwellPhase::Running { moved: true };
                }
                None
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Control loop

pub struct ControlLoop {
    command: ControlCommand,
    bounds: LevelBounds,
    gains: AutopilotGains,
    autopilot: Option<Autopilot>,
    dwell: StationDwell,
    log: SessionLog,
    clock_s: f64,
}

impl ControlLoop {
    pub fn new(bounds: LevelBounds, gains: AutopilotGains) -> Self {
        Self {
            command: ControlCommand::COAST,
            bounds,
            gains,
            autopilot: None,
            dwell: StationDwell::default(),
            log: SessionLog::new(),
            clock_s: 0.0,
        }
    }

    pub fn with_dwell(mut self, dwell: StationDwell) -> Self {
        self.dwell = dwell;
        self
    }

    pub fn dwell(&self) -> &StationDwell {
        &self.dwell
    }

    pub fn command(&self) -> ControlCommand {
        self.command
    }

    pub fn bounds(&self) -> &LevelBounds {
        &self.bounds
    }

    pub fn log(&self) -> &SessionLog {
        &self.log
    }

    pub fn into_log(self) -> SessionLog {
        self.log
    }

    /// Appends to the session log at the current simulated time.
    pub fn record(&mut self, event: SessionEvent) {
        self.log.push(self.clock_s, event);
    }

    pub fn set_clock(&mut self, time_s: f64) {
        self.clock_s = time_s;
    }

    pub fn autopilot_engaged(&self) -> bool {
        self.autopilot.is_some()
    }

    pub fn engage_autopilot(&mut self) {
        if self.autopilot.is_none() {
            info!(time_s = self.clock_s, "autopilot engaged");
            self.autopilot = Some(Autopilot::new(self.gains.clone()));
            self.record(SessionEvent::AutopilotEngaged);
        }
    }

    pub fn disengage_autopilot(&mut self, reason: &str) {
        if self.autopilot.take().is_some() {
            info!(time_s = self.clock_s, reason, "autopilot disengaged");
            self.record(SessionEvent::AutopilotDisengaged { reason: reason.to_string() });
        }
    }

    /// Edge-triggered: returns false and logs nothing when already in `mode`.
    /// A mode change starts the new mode at level 0.
    pub fn set_mode(&mut self, mode: ControlMode) -> bool {
        if self.ignore_while_holding() {
            return false;
        }
        self.disengage_autopilot("driver input");
        self.change_mode(mode)
    }

    /// Moves the level by `delta`, clamped to the bounds of the current mode.
    /// Returns the resulting level.
    pub fn adjust_level(&mut self, delta: i8) -> u8 {
        if self.ignore_while_holding() {
            return self.command.level;
        }
        self.disengage_autopilot("driver input");
        let mode = self.command.mode;
        let from = self.command.level;
        let requested = from as i16 + delta as i16;
        let to = requested.clamp(0, self.bounds.max_for(mode) as i16) as u8;
        if requested != to as i16 {
            debug!(%mode, requested, clamped = to, "level request clamped");
        }
        self.command.level = to;
        self.record(SessionEvent::LevelAdjusted { mode, from, to, requested });
        to
    }

    /// One autopilot step: the command moves toward the PID's notch by at most
    /// `max_notch_step`. Without the autopilot engaged the command is unchanged.
    pub fn autopilot_tick(&mut self, state: &VehicleState, plant: &DynamicsModel, dt: f64) -> ControlCommand {
        let Some(autopilot) = self.autopilot.as_mut() else {
            return self.command;
        };
        let target = plant.curves().target_speed(self.dwell.lookup_position(state.position_m));
        let desired = autopilot.desired_notch(state, target, plant, dt);
        let current = self.command.notch();
        let step = self.gains.max_notch_step.max(1) as i16;
        let next = ControlCommand::from_notch(current + (desired - current).clamp(-step, step), &self.bounds);
        if next.mode != self.command.mode {
            self.change_mode(next.mode);
        }
        self.command = next;
        next
    }

    /// Called once per tick with the latest state; returns the command to apply.
    pub fn tick(&mut self, state: &VehicleState, plant: &DynamicsModel, dt: f64) -> ControlCommand {
        self.set_clock(state.time_s);
        match self.dwell.update(state) {
            Some(DwellTransition::Captured { stop, position_m }) => {
                info!(%stop, position_m, time_s = state.time_s, "standing at stop");
                self.record(SessionEvent::DwellStarted { stop, position_m });
            }
            Some(DwellTransition::Released { stop }) => {
                info!(%stop, time_s = state.time_s, "dwell over, departing");
                self.record(SessionEvent::DwellEnded { stop });
                self.change_mode(ControlMode::Coast);
                if let Some(autopilot) = self.autopilot.as_mut() {
                    autopilot.reset();
                }
            }
            None => {}
        }
        if self.dwell.is_holding() {
            return self.hold_brake();
        }
        if self.autopilot_engaged() {
            self.autopilot_tick(state, plant, dt)
        } else {
            self.command
        }
    }

    /// Half the brake range: enough to halt from capture speed and stay put.
    fn hold_brake(&mut self) -> ControlCommand {
        self.change_mode(ControlMode::Brake);
        self.command.level = self.bounds.brake_max.div_ceil(2);
        self.command
    }

    fn ignore_while_holding(&self) -> bool {
        if self.dwell.is_holding() {
            debug!(time_s = self.clock_s, "input ignored while standing at a stop");
        }
        self.dwell.is_holding()
    }

    fn change_mode(&mut self, mode: ControlMode) -> bool {
        let from = self.command.mode;
        if from == mode {
            return false;
        }
        self.command = ControlCommand::new(mode, 0);
        self.record(SessionEvent::ModeChanged { from, to: mode });
        true
    }
}
