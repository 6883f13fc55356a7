//! Longitudinal vehicle dynamics.
//!
//! `DynamicsModel::step` is a pure function of (state, command, dt): it looks up
//! the characteristic force for the commanded mode at the current speed, subtracts
//! running resistance, and integrates with a fixed physical dt. It never corrects
//! for the ceiling curve; it only reports when the ceiling is exceeded.

use std::sync::Arc;

use rail_model::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleParams {
    /// Train mass in tonnes.
    pub mass_t: f64,
    /// Davis coefficients in N/kN, speed in km/h.
    pub davis_a: f64,
    pub davis_b: f64,
    pub davis_c: f64,
}

impl Default for VehicleParams {
    fn default() -> Self {
        Self { mass_t: 194.295, davis_a: 2.03, davis_b: 0.062, davis_c: 0.0018 }
    }
}

impl VehicleParams {
    pub fn mass_kg(&self) -> f64 {
        self.mass_t * 1000.0
    }
}

/// Which characteristic table a mode draws its force from.
pub trait ModeCharacteristic {
    fn characteristic<'a>(&self, curves: &'a CurveSet) -> Option<&'a CurveProfile>;
    /// +1 pushes forward, -1 retards, 0 applies nothing.
    fn direction(&self) -> f64;
}

impl ModeCharacteristic for ControlMode {
    fn characteristic<'a>(&self, curves: &'a CurveSet) -> Option<&'a CurveProfile> {
        match self {
            ControlMode::Traction => Some(&curves.traction),
            ControlMode::Coast => None,
            ControlMode::Brake => Some(&curves.brake),
        }
    }

    fn direction(&self) -> f64 {
        match self {
            ControlMode::Traction => 1.0,
            ControlMode::Coast => 0.0,
            ControlMode::Brake => -1.0,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct StepOutcome {
    pub state: VehicleState,
    pub ceiling_mps: f64,
    pub ceiling_exceeded: bool,
}

#[derive(Clone, Debug)]
pub struct DynamicsModel {
    params: VehicleParams,
    bounds: LevelBounds,
    curves: Arc<CurveSet>,
}

impl DynamicsModel {
    pub fn new(params: VehicleParams, bounds: LevelBounds, curves: Arc<CurveSet>) -> Self {
        Self { params, bounds, curves }
    }

    pub fn params(&self) -> &VehicleParams {
        &self.params
    }

    pub fn bounds(&self) -> &LevelBounds {
        &self.bounds
    }

    pub fn curves(&self) -> &CurveSet {
        &self.curves
    }

    /// Running resistance magnitude in N. Zero at rest.
    pub fn resistance_force(&self, velocity_mps: f64) -> f64 {
        if velocity_mps <= 0.0 {
            return 0.0;
        }
        let v = mps_to_kmh(velocity_mps);
        let per_kn = self.params.davis_a + self.params.davis_b * v + self.params.davis_c * v * v;
        per_kn * self.params.mass_kg() * GRAVITY_MPS2 / 1000.0
    }

    /// Full characteristic force available to `mode` at this speed, in N.
    pub fn max_force(&self, mode: ControlMode, velocity_mps: f64) -> f64 {
        mode.characteristic(&self.curves)
            .map(|c| c.value_at(velocity_mps).max(0.0))
            .unwrap_or(0.0)
    }

    /// Signed force from the command alone: traction positive, brake negative.
    pub fn command_force(&self, command: ControlCommand, velocity_mps: f64) -> f64 {
        let fraction = self.bounds.fraction(&command);
        command.mode.direction() * fraction * self.max_force(command.mode, velocity_mps)
    }

    pub fn step(&self, state: &VehicleState, command: ControlCommand, dt: f64) -> StepOutcome {
        let command = self.bounds.clamp(command);
        if !(dt > 0.0) {
            let ceiling_mps = self.curves.ceiling_speed(state.position_m);
            return StepOutcome {
                state: *state,
                ceiling_mps,
                ceiling_exceeded: state.velocity_mps > ceiling_mps,
            };
        }

        let v0 = state.velocity_mps.max(0.0);
        let net = self.command_force(command, v0) - self.resistance_force(v0);
        let mut accel = net / self.params.mass_kg();
        // at rest nothing can push the train backwards
        if v0 <= 0.0 && accel < 0.0 {
            accel = 0.0;
        }

        let mut v1 = v0 + accel * dt;
        if v1 < 0.0 {
            v1 = 0.0;
            accel = (v1 - v0) / dt;
        }

        let position_m = state.position_m + (v0 + v1) * 0.5 * dt;
        let ceiling_mps = self.curves.ceiling_speed(position_m);

        StepOutcome {
            state: VehicleState {
                time_s: state.time_s + dt,
                position_m,
                velocity_mps: v1,
                acceleration_mps2: accel,
                mode: command.mode,
                level: command.level,
            },
            ceiling_mps,
            ceiling_exceeded: v1 > ceiling_mps,
        }
    }
}
