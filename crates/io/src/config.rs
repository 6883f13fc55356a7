use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use rail_analysis::EvaluationPlan;
use rail_control::{AutopilotGains, SpeedMultiplier};
use rail_dynamics::VehicleParams;
use rail_model::{CurveError, LevelBounds};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_FILE: &str = "railsim.toml";
/// Finer steps collide on the wire's millisecond timestamps.
pub const MIN_PHYSICS_DT_S: f64 = 0.001;
pub const DEFAULT_DWELL_S: f64 = 23.5;

/// Fatal at startup: nothing runs on a partial configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("reading {}: {source}", path.display())]
    Read { path: PathBuf, source: std::io::Error },
    #[error("parsing {}: {source}", path.display())]
    Parse { path: PathBuf, source: toml::de::Error },
    #[error("curve table {}: {source}", path.display())]
    CurveTable { path: PathBuf, source: csv::Error },
    #[error("curve table {}: {source}", path.display())]
    Curve { path: PathBuf, source: CurveError },
    #[error("{field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurvePaths {
    /// `position_m,speed_kmh`
    pub target: PathBuf,
    /// `position_m,speed_kmh`
    pub ceiling: PathBuf,
    /// `speed_kmh,force_kn`
    pub traction: PathBuf,
    /// `speed_kmh,force_kn`
    pub brake: PathBuf,
}

impl Default for CurvePaths {
    fn default() -> Self {
        Self {
            target: "curves/target.csv".into(),
            ceiling: "curves/ceiling.csv".into(),
            traction: "curves/traction.csv".into(),
            brake: "curves/brake.csv".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleConfig {
    pub mass_t: f64,
    pub davis_a: f64,
    pub davis_b: f64,
    pub davis_c: f64,
    pub start_position_m: f64,
}

impl Default for VehicleConfig {
    fn default() -> Self {
        let p = VehicleParams::default();
        Self { mass_t: p.mass_t, davis_a: p.davis_a, davis_b: p.davis_b, davis_c: p.davis_c, start_position_m: 0.0 }
    }
}

impl VehicleConfig {
    pub fn params(&self) -> VehicleParams {
        VehicleParams { mass_t: self.mass_t, davis_a: self.davis_a, davis_b: self.davis_b, davis_c: self.davis_c }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub traction_max: u8,
    pub brake_max: u8,
    pub base_tick_ms: u64,
    pub physics_dt_s: f64,
    pub multiplier: SpeedMultiplier,
    pub autopilot_on_start: bool,
    pub autopilot: AutopilotGains,
}

impl Default for ControlConfig {
    fn default() -> Self {
        let bounds = LevelBounds::default();
        Self {
            traction_max: bounds.traction_max,
            brake_max: bounds.brake_max,
            base_tick_ms: rail_control::DEFAULT_BASE_TICK.as_millis() as u64,
            physics_dt_s: rail_control::DEFAULT_PHYSICS_DT_S,
            multiplier: SpeedMultiplier::default(),
            autopilot_on_start: false,
            autopilot: AutopilotGains::default(),
        }
    }
}

impl ControlConfig {
    pub fn bounds(&self) -> LevelBounds {
        LevelBounds { traction_max: self.traction_max, brake_max: self.brake_max }
    }

    pub fn base_tick(&self) -> Duration {
        Duration::from_millis(self.base_tick_ms)
    }

    pub fn tick_period(&self) -> Duration {
        self.multiplier.tick_period(self.base_tick())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout_ms: u64,
    /// Upper bound for one send; never more than a tick period in practice.
    pub io_timeout_ms: u64,
    pub heartbeat_ms: u64,
    /// How long the driver waits for trailing replies after ending a session.
    pub linger_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5000,
            connect_timeout_ms: 2_000,
            io_timeout_ms: 100,
            heartbeat_ms: 1_000,
            linger_ms: 500,
        }
    }
}

impl LinkConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn linger(&self) -> Duration {
        Duration::from_millis(self.linger_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub duration_s: Option<f64>,
    pub terminal_position_m: Option<f64>,
    /// Standing time at each scheduled stop before the train may leave.
    pub dwell_s: f64,
    pub out_dir: PathBuf,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { duration_s: None, terminal_position_m: None, dwell_s: DEFAULT_DWELL_S, out_dir: "logs".into() }
    }
}

/// Shared by both processes; each loads its own copy at startup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RailConfig {
    pub curves: CurvePaths,
    pub vehicle: VehicleConfig,
    pub control: ControlConfig,
    pub link: LinkConfig,
    pub session: SessionConfig,
    pub evaluation: EvaluationPlan,
}

impl RailConfig {
    /// Loads a TOML file. Curve paths are taken relative to the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigurationError::Read { path: path.to_path_buf(), source })?;
        let base = path.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("."));
        let mut cfg: RailConfig =
            toml::from_str(&raw).map_err(|source| ConfigurationError::Parse { path: path.to_path_buf(), source })?;
        cfg.resolve_curves(&base);
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn resolve_curves(&mut self, base: &Path) {
        for p in [&mut self.curves.target, &mut self.curves.ceiling, &mut self.curves.traction, &mut self.curves.brake] {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigurationError {
            ConfigurationError::Invalid { field, reason: reason.into() }
        }
        let v = &self.vehicle;
        if !(v.mass_t.is_finite() && v.mass_t > 0.0) {
            return Err(invalid("vehicle.mass_t", format!("must be positive, got {}", v.mass_t)));
        }
        if ![v.davis_a, v.davis_b, v.davis_c].iter().all(|c| c.is_finite() && *c >= 0.0) {
            return Err(invalid("vehicle.davis_*", "coefficients must be finite and non-negative"));
        }
        let c = &self.control;
        if !(c.physics_dt_s.is_finite() && c.physics_dt_s >= MIN_PHYSICS_DT_S) {
            return Err(invalid(
                "control.physics_dt_s",
                format!("must be at least {MIN_PHYSICS_DT_S}, got {}", c.physics_dt_s),
            ));
        }
        if c.base_tick_ms == 0 {
            return Err(invalid("control.base_tick_ms", "must be positive"));
        }
        if let Some(d) = self.session.duration_s {
            if !(d.is_finite() && d > 0.0) {
                return Err(invalid("session.duration_s", format!("must be positive, got {d}")));
            }
        }
        let dwell = self.session.dwell_s;
        if !(dwell.is_finite() && dwell >= 0.0) {
            return Err(invalid("session.dwell_s", format!("must be non-negative, got {dwell}")));
        }
        let e = &self.evaluation;
        if !(e.capture_radius_m >= 0.0 && e.punctuality_tolerance_s >= 0.0) {
            return Err(invalid("evaluation", "capture radius and tolerance must be non-negative"));
        }
        for pair in e.stops.windows(2) {
            if pair[1].position_m < pair[0].position_m {
                return Err(invalid("evaluation.stops", format!("{} lies before {}", pair[1].name, pair[0].name)));
            }
        }
        Ok(())
    }
}
