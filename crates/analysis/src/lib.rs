//! Per-session scoring.
//!
//! A `MetricsEngine` is created per connection (or per offline file), fed
//! samples strictly in arrival order, and consumed by `finalize`. The engine
//! goes idle -> collecting on the first accepted sample; finalizing takes it by
//! value, so a finished engine cannot be fed again.

use std::sync::Arc;

use rail_model::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DEFAULT_PUNCTUALITY_TOLERANCE_S: f64 = 180.0;
pub const DEFAULT_CAPTURE_RADIUS_M: f64 = 50.0;
/// Targets below this are station approaches; overshoot is not scored there.
pub const MIN_SCORED_TARGET_MPS: f64 = 1.0;

pub use rail_model::STOPPED_MPS;

/// Percentage by which `actual` exceeds `target`; zero when it doesn't, and
/// zero while the target is below `MIN_SCORED_TARGET_MPS`.
pub fn overshoot_pct(actual: f64, target: f64) -> f64 {
    if target < MIN_SCORED_TARGET_MPS || actual <= target {
        return 0.0;
    }
    (actual - target) / target * 100.0
}

pub fn is_on_time(arrival_s: f64, scheduled_s: f64, tolerance_s: f64) -> bool {
    (arrival_s - scheduled_s).abs() <= tolerance_s
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StopTarget {
    pub name: String,
    pub position_m: f64,
    pub scheduled_arrival_s: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvaluationPlan {
    pub punctuality_tolerance_s: f64,
    pub capture_radius_m: f64,
    pub stops: Vec<StopTarget>,
}

impl Default for EvaluationPlan {
    fn default() -> Self {
        Self {
            punctuality_tolerance_s: DEFAULT_PUNCTUALITY_TOLERANCE_S,
            capture_radius_m: DEFAULT_CAPTURE_RADIUS_M,
            stops: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StopResult {
    pub name: String,
    pub target_position_m: f64,
    pub scheduled_arrival_s: f64,
    pub arrival_s: Option<f64>,
    pub stopped_position_m: Option<f64>,
    pub error_m: Option<f64>,
    pub on_time: bool,
}

impl StopResult {
    fn pending(stop: &StopTarget) -> Self {
        Self {
            name: stop.name.clone(),
            target_position_m: stop.position_m,
            scheduled_arrival_s: stop.scheduled_arrival_s,
            arrival_s: None,
            stopped_position_m: None,
            error_m: None,
            on_time: false,
        }
    }

    pub fn reached(&self) -> bool {
        self.arrival_s.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Collecting,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SampleRejection {
    #[error("sample {tick} at {time_s}s does not advance past {last_s}s")]
    NotAdvancing { tick: u64, time_s: f64, last_s: f64 },
    #[error("sample {tick} carries a non-finite or negative value")]
    Invalid { tick: u64 },
}

/// What the evaluator replies for one accepted sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickScore {
    pub tick: u64,
    pub record: ScoreRecord,
    /// A ceiling violation has occurred at some point in this session.
    pub cumulative_flag: bool,
    pub ceiling_exceeded: bool,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SessionEnd {
    Explicit { time_s: f64, position_m: f64 },
    LinkClosed,
}

/// Share of session time per comfort class; fields sum to 1 unless no time elapsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ComfortDistribution {
    pub excellent: f64,
    pub comfortable: f64,
    pub uncomfortable: f64,
    pub intolerable: f64,
}

impl ComfortDistribution {
    fn from_seconds(seconds: &[f64; 4]) -> Self {
        let total: f64 = seconds.iter().sum();
        if total <= 0.0 {
            return Self::default();
        }
        Self {
            excellent: seconds[0] / total,
            comfortable: seconds[1] / total,
            uncomfortable: seconds[2] / total,
            intolerable: seconds[3] / total,
        }
    }

    pub fn share(&self, class: ComfortClass) -> f64 {
        match class {
            ComfortClass::Excellent => self.excellent,
            ComfortClass::Comfortable => self.comfortable,
            ComfortClass::Uncomfortable => self.uncomfortable,
            ComfortClass::Intolerable => self.intolerable,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionScore {
    pub session_id: Option<Uuid>,
    pub complete: bool,
    pub summary: ScoreRecord,
    pub comfort: ComfortDistribution,
    pub uncomfortable_s: f64,
    pub peak_overshoot_pct: f64,
    pub ceiling_violations: u32,
    pub mean_speed_deviation_pct: f64,
    pub stops: Vec<StopResult>,
    pub unscheduled_stops: u32,
    pub samples_scored: u64,
    pub samples_dropped: u64,
    pub started_s: Option<f64>,
    pub duration_s: f64,
    /// Where the session ended: the end record's position, else the last scored sample's.
    pub end_position_m: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct LastSample {
    time_s: f64,
    position_m: f64,
    class: ComfortClass,
}

pub struct MetricsEngine {
    curves: Arc<CurveSet>,
    plan: EvaluationPlan,
    session_id: Option<Uuid>,
    phase: Phase,
    started_s: Option<f64>,
    last: Option<LastSample>,
    comfort_s: [f64; 4],
    peak_overshoot_pct: f64,
    in_violation: bool,
    ceiling_violations: u32,
    deviation_sum_pct: f64,
    deviation_samples: u64,
    was_moving: bool,
    stops: Vec<StopResult>,
    next_stop: usize,
    unscheduled_stops: u32,
    samples_scored: u64,
    samples_dropped: u64,
}

impl MetricsEngine {
    pub fn new(curves: Arc<CurveSet>, plan: EvaluationPlan) -> Self {
        let stops = plan.stops.iter().map(StopResult::pending).collect();
        Self {
            curves,
            plan,
            session_id: None,
            phase: Phase::Idle,
            started_s: None,
            last: None,
            comfort_s: [0.0; 4],
            peak_overshoot_pct: 0.0,
            in_violation: false,
            ceiling_violations: 0,
            deviation_sum_pct: 0.0,
            deviation_samples: 0,
            was_moving: false,
            stops,
            next_stop: 0,
            unscheduled_stops: 0,
            samples_scored: 0,
            samples_dropped: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    pub fn set_session_id(&mut self, id: Uuid) {
        self.session_id = Some(id);
    }

    pub fn samples_scored(&self) -> u64 {
        self.samples_scored
    }

    /// Counts a record that never reached `observe` (malformed on the wire).
    pub fn note_dropped(&mut self) {
        self.samples_dropped += 1;
    }

    pub fn observe(&mut self, sample: &TelemetrySample) -> Result<TickScore, SampleRejection> {
        let s = &sample.state;
        let finite = s.time_s.is_finite()
            && s.position_m.is_finite()
            && s.velocity_mps.is_finite()
            && s.acceleration_mps2.is_finite();
        if !finite || s.velocity_mps < 0.0 {
            self.samples_dropped += 1;
            return Err(SampleRejection::Invalid { tick: sample.tick });
        }
        if let Some(last) = self.last {
            if s.time_s <= last.time_s {
                self.samples_dropped += 1;
                return Err(SampleRejection::NotAdvancing { tick: sample.tick, time_s: s.time_s, last_s: last.time_s });
            }
            self.comfort_s[last.class.index()] += s.time_s - last.time_s;
        }
        if self.phase == Phase::Idle {
            debug!(tick = sample.tick, time_s = s.time_s, "first sample, collecting");
            self.phase = Phase::Collecting;
            self.started_s = Some(s.time_s);
        }

        let class = ComfortClass::classify(s.acceleration_mps2);
        let target = self.curves.target_speed(s.position_m);
        let ceiling = self.curves.ceiling_speed(s.position_m);
        let overshoot = overshoot_pct(s.velocity_mps, target);
        self.peak_overshoot_pct = self.peak_overshoot_pct.max(overshoot);

        let moving = s.velocity_mps > STOPPED_MPS;
        if moving && target >= MIN_SCORED_TARGET_MPS {
            self.deviation_sum_pct += (s.velocity_mps - target).abs() / target * 100.0;
            self.deviation_samples += 1;
        }

        let exceeded = s.velocity_mps > ceiling;
        if exceeded && !self.in_violation {
            self.ceiling_violations += 1;
            info!(tick = sample.tick, position_m = s.position_m, velocity_mps = s.velocity_mps, ceiling_mps = ceiling, "ceiling exceeded");
        }
        self.in_violation = exceeded;

        if self.was_moving && !moving {
            self.on_stopped(s.time_s, s.position_m);
        }
        self.was_moving = moving;

        self.last = Some(LastSample { time_s: s.time_s, position_m: s.position_m, class });
        self.samples_scored += 1;

        Ok(TickScore {
            tick: sample.tick,
            record: ScoreRecord {
                overshoot_pct: overshoot,
                comfort: class,
                on_time: self.on_time_so_far(s.time_s),
                stop_error_m: self.stops[..self.next_stop].iter().rev().find_map(|r| r.error_m),
            },
            cumulative_flag: self.ceiling_violations > 0,
            ceiling_exceeded: exceeded,
        })
    }

    fn on_stopped(&mut self, time_s: f64, position_m: f64) {
        let radius = self.plan.capture_radius_m;
        let hit = self.stops[self.next_stop..]
            .iter()
            .position(|r| (position_m - r.target_position_m).abs() <= radius);
        let Some(offset) = hit else {
            self.unscheduled_stops += 1;
            debug!(time_s, position_m, "unscheduled stop");
            return;
        };
        let idx = self.next_stop + offset;
        let tolerance = self.plan.punctuality_tolerance_s;
        let stop = &mut self.stops[idx];
        let error = (position_m - stop.target_position_m).abs();
        stop.arrival_s = Some(time_s);
        stop.stopped_position_m = Some(position_m);
        stop.error_m = Some(error);
        stop.on_time = is_on_time(time_s, stop.scheduled_arrival_s, tolerance);
        info!(stop = %stop.name, time_s, error_m = error, on_time = stop.on_time, "arrived at stop");
        // stops passed without halting stay unreached
        self.next_stop = idx + 1;
    }

    /// False once a reached stop was off schedule or a pending one is overdue.
    fn on_time_so_far(&self, now_s: f64) -> bool {
        let tolerance = self.plan.punctuality_tolerance_s;
        self.stops.iter().enumerate().all(|(i, r)| {
            if r.reached() {
                r.on_time
            } else if i < self.next_stop {
                false
            } else {
                now_s <= r.scheduled_arrival_s + tolerance
            }
        })
    }

    pub fn finalize(mut self, end: SessionEnd) -> SessionScore {
        let complete = matches!(end, SessionEnd::Explicit { .. });
        let mut ended_s = self.last.map(|l| l.time_s);
        let mut end_position_m = self.last.map(|l| l.position_m);
        if let SessionEnd::Explicit { time_s, position_m } = end {
            if let Some(last) = self.last {
                if time_s > last.time_s {
                    self.comfort_s[last.class.index()] += time_s - last.time_s;
                    ended_s = Some(time_s);
                }
                if (position_m - last.position_m).abs() > 1e-3 {
                    warn!(end_m = position_m, last_sample_m = last.position_m, "end record disagrees with last scored sample");
                }
            }
            end_position_m = Some(position_m);
        }

        let dominant = ComfortClass::ALL
            .into_iter()
            .fold((ComfortClass::Excellent, 0.0), |best, class| {
                let t = self.comfort_s[class.index()];
                if t > best.1 { (class, t) } else { best }
            })
            .0;
        let reached: Vec<f64> = self.stops.iter().filter_map(|r| r.error_m).collect();
        let stop_error_m = if reached.is_empty() {
            None
        } else {
            Some(reached.iter().sum::<f64>() / reached.len() as f64)
        };
        let mean_speed_deviation_pct = if self.deviation_samples > 0 {
            self.deviation_sum_pct / self.deviation_samples as f64
        } else {
            0.0
        };

        let score = SessionScore {
            session_id: self.session_id,
            complete,
            summary: ScoreRecord {
                overshoot_pct: self.peak_overshoot_pct,
                comfort: dominant,
                on_time: self.stops.iter().all(|r| r.on_time),
                stop_error_m,
            },
            comfort: ComfortDistribution::from_seconds(&self.comfort_s),
            uncomfortable_s: self.comfort_s[ComfortClass::Uncomfortable.index()]
                + self.comfort_s[ComfortClass::Intolerable.index()],
            peak_overshoot_pct: self.peak_overshoot_pct,
            ceiling_violations: self.ceiling_violations,
            mean_speed_deviation_pct,
            stops: self.stops,
            unscheduled_stops: self.unscheduled_stops,
            samples_scored: self.samples_scored,
            samples_dropped: self.samples_dropped,
            started_s: self.started_s,
            duration_s: match (self.started_s, ended_s) {
                (Some(a), Some(b)) => b - a,
                _ => 0.0,
            },
            end_position_m,
        };
        info!(
            complete = score.complete,
            samples = score.samples_scored,
            dropped = score.samples_dropped,
            peak_overshoot_pct = score.peak_overshoot_pct,
            violations = score.ceiling_violations,
            "session finalized"
        );
        score
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curves() -> Arc<CurveSet> {
        Arc::new(CurveSet {
            target: CurveProfile::flat(20.0).unwrap(),
            ceiling: CurveProfile::flat(25.0).unwrap(),
            traction: CurveProfile::flat(200_000.0).unwrap(),
            brake: CurveProfile::flat(200_000.0).unwrap(),
        })
    }

    fn sample(tick: u64, time_s: f64, position_m: f64, velocity_mps: f64, acceleration_mps2: f64) -> TelemetrySample {
        TelemetrySample {
            tick,
            state: VehicleState { time_s, position_m, velocity_mps, acceleration_mps2, ..VehicleState::at_rest(0.0) },
            wall_elapsed_ms: tick * 100,
        }
    }

    fn plan(stops: &[(&str, f64, f64)]) -> EvaluationPlan {
        EvaluationPlan {
            stops: stops
                .iter()
                .map(|&(name, position_m, scheduled_arrival_s)| StopTarget { name: name.into(), position_m, scheduled_arrival_s })
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn overshoot_percentages() {
        assert!((overshoot_pct(22.0, 20.0) - 10.0).abs() < 1e-9);
        assert_eq!(overshoot_pct(18.0, 20.0), 0.0);
        assert_eq!(overshoot_pct(20.0, 20.0), 0.0);
        assert_eq!(overshoot_pct(5.0, 0.0), 0.0);
        // creeping into a station against a near-zero target
        assert_eq!(overshoot_pct(0.5, 0.02), 0.0);
        assert!((overshoot_pct(1.5, MIN_SCORED_TARGET_MPS) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn punctuality_window() {
        for arrival in [120.0, 200.0, 300.0, 479.9, 480.0] {
            assert!(is_on_time(arrival, 300.0, DEFAULT_PUNCTUALITY_TOLERANCE_S), "{arrival}");
        }
        assert!(!is_on_time(481.0, 300.0, DEFAULT_PUNCTUALITY_TOLERANCE_S));
        assert!(!is_on_time(119.0, 300.0, DEFAULT_PUNCTUALITY_TOLERANCE_S));
    }

    #[test]
    fn idle_until_first_sample() {
        let mut engine = MetricsEngine::new(curves(), EvaluationPlan::default());
        assert_eq!(engine.phase(), Phase::Idle);
        let score = engine.observe(&sample(0, 0.0, 0.0, 0.0, 0.0)).unwrap();
        assert_eq!(engine.phase(), Phase::Collecting);
        assert_eq!(score.tick, 0);
        assert_eq!(score.record.comfort, ComfortClass::Excellent);
        assert!(score.record.on_time);
    }

    #[test]
    fn rejects_time_going_backwards() {
        let mut engine = MetricsEngine::new(curves(), EvaluationPlan::default());
        engine.observe(&sample(0, 1.0, 0.0, 1.0, 0.0)).unwrap();
        let err = engine.observe(&sample(1, 1.0, 0.0, 1.0, 0.0)).unwrap_err();
        assert!(matches!(err, SampleRejection::NotAdvancing { tick: 1, .. }));
        assert!(engine.observe(&sample(2, f64::NAN, 0.0, 1.0, 0.0)).is_err());
        engine.observe(&sample(3, 1.1, 0.1, 1.0, 0.0)).unwrap();
        let score = engine.finalize(SessionEnd::LinkClosed);
        assert_eq!(score.samples_scored, 2);
        assert_eq!(score.samples_dropped, 2);
    }

    #[test]
    fn comfort_is_time_weighted() {
        let mut engine = MetricsEngine::new(curves(), EvaluationPlan::default());
        engine.observe(&sample(0, 0.0, 0.0, 1.0, 0.0)).unwrap();
        engine.observe(&sample(1, 1.0, 1.0, 2.5, 1.5)).unwrap();
        engine.observe(&sample(2, 3.0, 5.0, 2.5, 0.0)).unwrap();
        let score = engine.finalize(SessionEnd::Explicit { time_s: 4.0, position_m: 7.5 });
        assert!(score.complete);
        assert!((score.comfort.excellent - 0.5).abs() < 1e-9);
        assert!((score.comfort.uncomfortable - 0.5).abs() < 1e-9);
        assert!((score.uncomfortable_s - 2.0).abs() < 1e-9);
        assert!((score.duration_s - 4.0).abs() < 1e-9);
        assert_eq!(score.end_position_m, Some(7.5));
        // tie goes to the gentler class
        assert_eq!(score.summary.comfort, ComfortClass::Excellent);
    }

    #[test]
    fn peak_overshoot_and_violation_edges() {
        let mut engine = MetricsEngine::new(curves(), EvaluationPlan::default());
        let speeds = [19.0, 22.0, 26.0, 27.0, 24.0, 26.0, 20.0];
        let mut flags = Vec::new();
        for (i, v) in speeds.iter().enumerate() {
            let s = engine.observe(&sample(i as u64, i as f64, i as f64 * 20.0, *v, 0.0)).unwrap();
            flags.push(s.cumulative_flag);
        }
        assert_eq!(flags, vec![false, false, true, true, true, true, true]);
        let score = engine.finalize(SessionEnd::LinkClosed);
        assert!(!score.complete);
        assert_eq!(score.end_position_m, Some(120.0));
        assert_eq!(score.ceiling_violations, 2);
        assert!((score.peak_overshoot_pct - 35.0).abs() < 1e-9);
        assert_eq!(score.summary.overshoot_pct, score.peak_overshoot_pct);
    }

    #[test]
    fn stop_arrival_scored() {
        let mut engine = MetricsEngine::new(curves(), plan(&[("A", 1_000.0, 300.0), ("B", 3_000.0, 600.0)]));
        engine.observe(&sample(0, 0.0, 0.0, 0.0, 0.0)).unwrap();
        engine.observe(&sample(1, 100.0, 500.0, 10.0, 0.0)).unwrap();
        // halt 12 m short of A
        let at_a = engine.observe(&sample(2, 290.0, 988.0, 0.0, -0.5)).unwrap();
        assert_eq!(at_a.record.stop_error_m, Some(12.0));
        assert!(at_a.record.on_time);
        engine.observe(&sample(3, 300.0, 1_200.0, 10.0, 0.0)).unwrap();
        // a stop between A and B is unscheduled
        engine.observe(&sample(4, 400.0, 2_000.0, 0.0, 0.0)).unwrap();
        engine.observe(&sample(5, 500.0, 2_500.0, 10.0, 0.0)).unwrap();
        // B reached late
        let at_b = engine.observe(&sample(6, 800.0, 3_004.0, 0.0, 0.0)).unwrap();
        assert!(!at_b.record.on_time);
        let score = engine.finalize(SessionEnd::Explicit { time_s: 801.0, position_m: 3_004.0 });
        assert_eq!(score.unscheduled_stops, 1);
        assert!(score.stops.iter().all(StopResult::reached));
        assert!(score.stops[0].on_time);
        assert!(!score.stops[1].on_time);
        assert!(!score.summary.on_time);
        assert!((score.summary.stop_error_m.unwrap() - 8.0).abs() < 1e-9);
    }

    #[test]
    fn no_stops_is_vacuously_on_time() {
        let mut engine = MetricsEngine::new(curves(), EvaluationPlan::default());
        engine.observe(&sample(0, 0.0, 0.0, 5.0, 0.0)).unwrap();
        let score = engine.finalize(SessionEnd::LinkClosed);
        assert!(score.summary.on_time);
        assert_eq!(score.summary.stop_error_m, None);
    }

    #[test]
    fn overdue_stop_clears_running_on_time() {
        let mut engine = MetricsEngine::new(curves(), plan(&[("A", 1_000.0, 100.0)]));
        assert!(engine.observe(&sample(0, 200.0, 0.0, 10.0, 0.0)).unwrap().record.on_time);
        assert!(!engine.observe(&sample(1, 281.0, 800.0, 10.0, 0.0)).unwrap().record.on_time);
    }

    #[test]
    fn empty_session_finalizes() {
        let engine = MetricsEngine::new(curves(), EvaluationPlan::default());
        let score = engine.finalize(SessionEnd::LinkClosed);
        assert!(!score.complete);
        assert_eq!(score.samples_scored, 0);
        assert_eq!(score.duration_s, 0.0);
        assert_eq!(score.end_position_m, None);
        assert_eq!(score.summary.comfort, ComfortClass::Excellent);
        assert!(serde_json::to_string(&score).unwrap().contains("\"complete\":false"));
    }
}
