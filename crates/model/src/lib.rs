//! Shared data model for the rail driving simulator and its evaluator.
//!
//! Everything here is plain data: the vehicle state integrated each tick, the
//! control command the driver or autopilot produces, the curve tables both
//! processes load at startup, and the score types exchanged over the link.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const KMH_PER_MPS: f64 = 3.6;
pub const GRAVITY_MPS2: f64 = 9.81;
/// At or below this speed the train counts as standing.
pub const STOPPED_MPS: f64 = 0.01;

pub fn kmh_to_mps(kmh: f64) -> f64 {
    kmh / KMH_PER_MPS
}

pub fn mps_to_kmh(mps: f64) -> f64 {
    mps * KMH_PER_MPS
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    Traction,
    Coast,
    Brake,
}

impl ControlMode {
    pub fn code(self) -> u8 {
        match self {
            ControlMode::Traction => 0,
            ControlMode::Coast => 1,
            ControlMode::Brake => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ControlMode::Traction),
            1 => Some(ControlMode::Coast),
            2 => Some(ControlMode::Brake),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ControlMode::Traction => "traction",
            ControlMode::Coast => "coast",
            ControlMode::Brake => "brake",
        }
    }
}

impl std::fmt::Display for ControlMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlCommand {
    pub mode: ControlMode,
    pub level: u8,
}

impl ControlCommand {
    pub const COAST: ControlCommand = ControlCommand { mode: ControlMode::Coast, level: 0 };

    pub fn new(mode: ControlMode, level: u8) -> Self {
        Self { mode, level }
    }

    /// Signed notch position: traction levels positive, brake levels negative,
    /// coast zero. Moving between two notches one step at a time always passes
    /// through coast when crossing from traction to brake.
    pub fn notch(&self) -> i16 {
        match self.mode {
            ControlMode::Traction => self.level as i16,
            ControlMode::Coast => 0,
            ControlMode::Brake => -(self.level as i16),
        }
    }

    pub fn from_notch(notch: i16, bounds: &LevelBounds) -> Self {
        if notch > 0 {
            ControlCommand::new(ControlMode::Traction, notch.min(bounds.traction_max as i16) as u8)
        } else if notch < 0 {
            ControlCommand::new(ControlMode::Brake, (-notch).min(bounds.brake_max as i16) as u8)
        } else {
            ControlCommand::COAST
        }
    }
}

/// Inclusive per-mode level bounds. Coast always has a single level, 0.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LevelBounds {
    pub traction_max: u8,
    pub brake_max: u8,
}

impl Default for LevelBounds {
    fn default() -> Self {
        Self { traction_max: 10, brake_max: 10 }
    }
}

impl LevelBounds {
    pub fn max_for(&self, mode: ControlMode) -> u8 {
        match mode {
            ControlMode::Traction => self.traction_max,
            ControlMode::Coast => 0,
            ControlMode::Brake => self.brake_max,
        }
    }

    pub fn contains(&self, command: &ControlCommand) -> bool {
        command.level <= self.max_for(command.mode)
    }

    pub fn clamp(&self, command: ControlCommand) -> ControlCommand {
        ControlCommand {
            mode: command.mode,
            level: command.level.min(self.max_for(command.mode)),
        }
    }

    /// Share of the characteristic envelope requested by `command`, in 0..=1.
    pub fn fraction(&self, command: &ControlCommand) -> f64 {
        let max = self.max_for(command.mode);
        if max == 0 {
            return 0.0;
        }
        command.level.min(max) as f64 / max as f64
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    pub time_s: f64,
    pub position_m: f64,
    pub velocity_mps: f64,
    pub acceleration_mps2: f64,
    pub mode: ControlMode,
    pub level: u8,
}

impl VehicleState {
    pub fn at_rest(position_m: f64) -> Self {
        Self {
            time_s: 0.0,
            position_m,
            velocity_mps: 0.0,
            acceleration_mps2: 0.0,
            mode: ControlMode::Coast,
            level: 0,
        }
    }

    pub fn command(&self) -> ControlCommand {
        ControlCommand::new(self.mode, self.level)
    }
}

/// One frozen snapshot per tick.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub tick: u64,
    pub state: VehicleState,
    pub wall_elapsed_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComfortClass {
    Excellent,
    Comfortable,
    Uncomfortable,
    Intolerable,
}

impl ComfortClass {
    pub const ALL: [ComfortClass; 4] = [
        ComfortClass::Excellent,
        ComfortClass::Comfortable,
        ComfortClass::Uncomfortable,
        ComfortClass::Intolerable,
    ];

    pub const EXCELLENT_MAX_MPS2: f64 = 0.28;
    pub const COMFORTABLE_MAX_MPS2: f64 = 1.23;
    pub const UNCOMFORTABLE_MAX_MPS2: f64 = 2.12;

    /// Thresholds are inclusive upper bounds: exactly 0.28 m/s² is still excellent.
    pub fn classify(acceleration_mps2: f64) -> Self {
        let a = acceleration_mps2.abs();
        if a <= Self::EXCELLENT_MAX_MPS2 {
            ComfortClass::Excellent
        } else if a <= Self::COMFORTABLE_MAX_MPS2 {
            ComfortClass::Comfortable
        } else if a <= Self::UNCOMFORTABLE_MAX_MPS2 {
            ComfortClass::Uncomfortable
        } else {
            // NaN lands here as well
            ComfortClass::Intolerable
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ComfortClass::Excellent => "excellent",
            ComfortClass::Comfortable => "comfortable",
            ComfortClass::Uncomfortable => "uncomfortable",
            ComfortClass::Intolerable => "intolerable",
        }
    }
}

impl std::fmt::Display for ComfortClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub overshoot_pct: f64,
    pub comfort: ComfortClass,
    pub on_time: bool,
    pub stop_error_m: Option<f64>,
}

// ---------------------------------------------------------------------------
// Curves

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CurveError {
    #[error("curve has no points")]
    Empty,
    #[error("non-finite value at row {row}")]
    NonFinite { row: usize },
    #[error("independent variable decreases at row {row} ({prev} -> {next})")]
    NotMonotonic { row: usize, prev: f64, next: f64 },
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub x: f64,
    pub y: f64,
}

/// Ordered (x, y) table, non-decreasing in x. Repeated x values describe a step.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CurveProfile {
    points: Vec<CurvePoint>,
}

impl CurveProfile {
    pub fn new(points: Vec<CurvePoint>) -> Result<Self, CurveError> {
        if points.is_empty() {
            return Err(CurveError::Empty);
        }
        for (row, p) in points.iter().enumerate() {
            if !p.x.is_finite() || !p.y.is_finite() {
                return Err(CurveError::NonFinite { row });
            }
        }
        for (i, w) in points.windows(2).enumerate() {
            if w[1].x < w[0].x {
                return Err(CurveError::NotMonotonic { row: i + 1, prev: w[0].x, next: w[1].x });
            }
        }
        Ok(Self { points })
    }

    pub fn from_pairs(pairs: &[(f64, f64)]) -> Result<Self, CurveError> {
        Self::new(pairs.iter().map(|&(x, y)| CurvePoint { x, y }).collect())
    }

    /// Constant value everywhere.
    pub fn flat(y: f64) -> Result<Self, CurveError> {
        Self::new(vec![CurvePoint { x: 0.0, y }])
    }

    pub fn points(&self) -> &[CurvePoint] {
        &self.points
    }

    pub fn domain(&self) -> (f64, f64) {
        let first = self.points[0].x;
        let last = self.points[self.points.len() - 1].x;
        (first, last)
    }

    /// Linear interpolation between the bracketing pair; clamps to the end values
    /// outside the table.
    pub fn value_at(&self, x: f64) -> f64 {
        let pts = &self.points;
        let idx = pts.partition_point(|p| p.x <= x);
        if idx == 0 {
            return pts[0].y;
        }
        if idx == pts.len() {
            return pts[pts.len() - 1].y;
        }
        let a = pts[idx - 1];
        let b = pts[idx];
        // a.x <= x < b.x, so the span is never zero
        a.y + (b.y - a.y) * (x - a.x) / (b.x - a.x)
    }
}

/// The four read-only tables, in SI units: speeds in m/s, forces in N.
#[derive(Clone, Debug, PartialEq)]
pub struct CurveSet {
    /// position (m) -> target speed (m/s)
    pub target: CurveProfile,
    /// position (m) -> ceiling speed (m/s)
    pub ceiling: CurveProfile,
    /// speed (m/s) -> maximum traction force (N)
    pub traction: CurveProfile,
    /// speed (m/s) -> maximum braking force (N), positive magnitude
    pub brake: CurveProfile,
}

impl CurveSet {
    pub fn target_speed(&self, position_m: f64) -> f64 {
        self.target.value_at(position_m)
    }

    pub fn ceiling_speed(&self, position_m: f64) -> f64 {
        self.ceiling.value_at(position_m)
    }
}

// ---------------------------------------------------------------------------
// Session log

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStarted {
        #[serde(with = "uuid::serde::simple")]
        session_id: Uuid,
        position_m: f64,
    },
    ModeChanged { from: ControlMode, to: ControlMode },
    LevelAdjusted { mode: ControlMode, from: u8, to: u8, requested: i16 },
    AutopilotEngaged,
    AutopilotDisengaged { reason: String },
    LinkUp { peer: String },
    LinkDown { reason: String },
    CeilingExceeded { position_m: f64, velocity_mps: f64, ceiling_mps: f64 },
    CeilingCleared { position_m: f64 },
    DwellStarted { stop: String, position_m: f64 },
    DwellEnded { stop: String },
    ScoreReceived { tick: u64, overshoot_pct: f64, comfort: ComfortClass },
    SessionEnded { reason: String, position_m: f64 },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time_s: f64,
    #[serde(flatten)]
    pub event: SessionEvent,
}

/// Append-only, ordered operation trace.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SessionLog {
    entries: Vec<LogEntry>,
}

impl SessionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, time_s: f64, event: SessionEvent) {
        self.entries.push(LogEntry { time_s, event });
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
