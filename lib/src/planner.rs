//! Trapezoid move planning.
//!
//! Common suffixes: `_d` is distance (mm), `_v` velocity (mm/s), `_v2`
//! velocity squared (mm²/s²), `_t` time (s), `_r` a unit ratio.

use glam::{DVec4 as Vec4, Vec4Swizzles};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::trace;

use crate::extruder::Extruder;

/// Window of queued move time that triggers a lazy lookahead flush.
pub const LOOKAHEAD_FLUSH_TIME: f64 = 0.250;

/// Acceleration stand-in for extrude-only moves; effectively unbounded.
const EXTRUDE_ONLY_ACCEL: f64 = 99_999_999.9;

#[derive(Error, Debug)]
pub enum MoveError {
    #[error("move out of range: {:.3} {:.3} {:.3} [{:.3}]", .0.x, .0.y, .0.z, .0.w)]
    OutOfRange(Vec4),
    #[error("must home axis {0} first")]
    MustHomeFirst(char),
    #[error("extrude when no extruder present")]
    NoExtruder,
    #[error("toolhead has been shut down")]
    Shutdown,
}

/// Operator-facing velocity limits. `junction_deviation` and the effective
/// `max_accel_to_decel` are derived; setters keep them in sync. An
/// unconfigured accel-to-decel follows the configured `max_accel` at half
/// strength.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerLimits {
    pub max_velocity: f64,
    pub max_accel: f64,
    #[serde(rename = "max_accel_to_decel", skip_serializing_if = "Option::is_none")]
    pub requested_accel_to_decel: Option<f64>,
    pub square_corner_velocity: f64,
    #[serde(skip)]
    pub max_accel_to_decel: f64,
    #[serde(skip)]
    pub junction_deviation: f64,
}

impl Default for PlannerLimits {
    fn default() -> Self {
        let mut limits = PlannerLimits {
            max_velocity: 300.0,
            max_accel: 3000.0,
            requested_accel_to_decel: None,
            square_corner_velocity: 5.0,
            max_accel_to_decel: 0.0,
            junction_deviation: 0.0,
        };
        limits.recalculate();
        limits
    }
}

impl PlannerLimits {
    /// The requested accel-to-decel, defaulting to half of `max_accel`.
    pub fn accel_to_decel(&self) -> f64 {
        self.requested_accel_to_decel
            .unwrap_or(self.max_accel * 0.5)
    }

    /// Re-derive `junction_deviation` and the effective `max_accel_to_decel`
    /// from the current settings. Must be called after deserializing and
    /// after any direct field mutation.
    pub fn recalculate(&mut self) {
        let scv2 = self.square_corner_velocity * self.square_corner_velocity;
        self.junction_deviation = scv2 * (2.0f64.sqrt() - 1.0) / self.max_accel;
        self.max_accel_to_decel = self.accel_to_decel().min(self.max_accel);
    }

    pub fn set_max_velocity(&mut self, v: f64) {
        self.max_velocity = v;
    }

    pub fn set_max_accel(&mut self, accel: f64) {
        self.max_accel = accel;
        self.recalculate();
    }

    pub fn set_accel_to_decel(&mut self, accel_to_decel: f64) {
        self.requested_accel_to_decel = Some(accel_to_decel);
        self.recalculate();
    }

    pub fn set_square_corner_velocity(&mut self, scv: f64) {
        self.square_corner_velocity = scv;
        self.recalculate();
    }

    pub fn report(&self) -> String {
        format!(
            "max_velocity: {:.6}\nmax_accel: {:.6}\nmax_accel_to_decel: {:.6}\nsquare_corner_velocity: {:.6}",
            self.max_velocity,
            self.max_accel,
            self.accel_to_decel(),
            self.square_corner_velocity
        )
    }
}

/// One straight-line segment through (x, y, z, e) space, with the junction
/// bookkeeping needed by the lookahead pass and, once planned, its
/// trapezoid timing.
pub struct Move {
    pub start_pos: Vec4,
    pub end_pos: Vec4,
    pub axes_d: Vec4,
    pub axes_r: Vec4,
    /// Cartesian travel, or extrusion length for extrude-only moves.
    pub move_d: f64,
    pub min_move_t: f64,
    pub accel: f64,
    pub junction_deviation: f64,
    pub is_kinematic_move: bool,
    pub max_start_v2: f64,
    pub max_cruise_v2: f64,
    pub delta_v2: f64,
    pub max_smoothed_v2: f64,
    pub smooth_delta_v2: f64,
    pub start_v: f64,
    pub cruise_v: f64,
    pub end_v: f64,
    pub accel_t: f64,
    pub cruise_t: f64,
    pub decel_t: f64,
    /// Invoked with the move's end print time during dispatch.
    pub timing_callbacks: Vec<Box<dyn FnOnce(f64)>>,
}

impl std::fmt::Debug for Move {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Move")
            .field("start_pos", &self.start_pos)
            .field("end_pos", &self.end_pos)
            .field("move_d", &self.move_d)
            .field("is_kinematic_move", &self.is_kinematic_move)
            .field("velocity", &(self.start_v, self.cruise_v, self.end_v))
            .field("timing", &(self.accel_t, self.cruise_t, self.decel_t))
            .finish()
    }
}

impl Move {
    /// Limits are snapshotted at construction so a later operator command
    /// cannot skew a move already in flight.
    pub fn new(limits: &PlannerLimits, start_pos: Vec4, end_pos: Vec4, speed: f64) -> Move {
        let mut end_pos = end_pos;
        let mut axes_d = end_pos - start_pos;
        let mut accel = limits.max_accel;
        let mut velocity = speed.min(limits.max_velocity);
        let mut is_kinematic_move = true;
        let mut move_d = axes_d.xyz().length();
        if move_d < 1e-9 {
            // Extrude only move
            end_pos = Vec4::new(start_pos.x, start_pos.y, start_pos.z, end_pos.w);
            axes_d.x = 0.0;
            axes_d.y = 0.0;
            axes_d.z = 0.0;
            move_d = axes_d.w.abs();
            accel = EXTRUDE_ONLY_ACCEL;
            velocity = speed;
            is_kinematic_move = false;
        }
        let inv_move_d = if move_d > 0.0 { 1.0 / move_d } else { 0.0 };
        Move {
            start_pos,
            end_pos,
            axes_d,
            axes_r: axes_d * inv_move_d,
            move_d,
            min_move_t: if velocity > 0.0 { move_d / velocity } else { 0.0 },
            accel,
            junction_deviation: limits.junction_deviation,
            is_kinematic_move,
            max_start_v2: 0.0,
            max_cruise_v2: velocity * velocity,
            delta_v2: 2.0 * move_d * accel,
            max_smoothed_v2: 0.0,
            smooth_delta_v2: 2.0 * move_d * limits.max_accel_to_decel,
            start_v: 0.0,
            cruise_v: 0.0,
            end_v: 0.0,
            accel_t: 0.0,
            cruise_t: 0.0,
            decel_t: 0.0,
            timing_callbacks: Vec::new(),
        }
    }

    /// Lower the speed and/or acceleration caps. Kinematics and the extruder
    /// call this from `check_move`; caps only ever tighten.
    pub fn limit_speed(&mut self, speed: f64, accel: f64) {
        let speed2 = speed * speed;
        if speed2 < self.max_cruise_v2 {
            self.max_cruise_v2 = speed2;
            self.min_move_t = self.move_d / speed;
        }
        self.accel = self.accel.min(accel);
        self.delta_v2 = 2.0 * self.move_d * self.accel;
        self.smooth_delta_v2 = self.smooth_delta_v2.min(self.delta_v2);
    }

    /// Largest squared entry velocity compatible with a smooth transition
    /// from `prev`, per the approximated-centripetal junction model.
    /// `extruder_v2` is the ceiling imposed by the extruder's own junction
    /// rule.
    pub fn calc_junction(&mut self, prev: &Move, extruder_v2: f64) {
        if !self.is_kinematic_move || !prev.is_kinematic_move {
            return;
        }
        let mut junction_cos_theta = -self.axes_r.xyz().dot(prev.axes_r.xyz());
        if junction_cos_theta > 0.999999 {
            // Effectively collinear
            return;
        }
        junction_cos_theta = junction_cos_theta.max(-0.999999);
        let sin_theta_d2 = (0.5 * (1.0 - junction_cos_theta)).sqrt();
        let r_jd = sin_theta_d2 / (1.0 - sin_theta_d2);
        // Approximated circle must contact moves no further away than mid-move
        let tan_theta_d2 = sin_theta_d2 / (0.5 * (1.0 + junction_cos_theta)).sqrt();
        let move_centripetal_v2 = 0.5 * self.move_d * tan_theta_d2 * self.accel;
        let prev_centripetal_v2 = 0.5 * prev.move_d * tan_theta_d2 * prev.accel;
        self.max_start_v2 = extruder_v2
            .min(r_jd * self.junction_deviation * self.accel)
            .min(r_jd * prev.junction_deviation * prev.accel)
            .min(move_centripetal_v2)
            .min(prev_centripetal_v2)
            .min(self.max_cruise_v2)
            .min(prev.max_cruise_v2)
            .min(prev.max_start_v2 + prev.delta_v2);
        self.max_smoothed_v2 = self
            .max_start_v2
            .min(prev.max_smoothed_v2 + prev.smooth_delta_v2);
    }

    /// Fix the trapezoid for the chosen junction velocities.
    pub fn set_junction(&mut self, start_v2: f64, cruise_v2: f64, end_v2: f64) {
        let half_inv_accel = 0.5 / self.accel;
        let accel_d = (cruise_v2 - start_v2) * half_inv_accel;
        let decel_d = (cruise_v2 - end_v2) * half_inv_accel;
        let cruise_d = self.move_d - accel_d - decel_d;
        self.start_v = start_v2.sqrt();
        self.cruise_v = cruise_v2.sqrt();
        self.end_v = end_v2.sqrt();
        // Time is distance over average velocity; a numerically negative
        // cruise remainder collapses to a zero-duration phase.
        self.accel_t = accel_d / ((self.start_v + self.cruise_v) * 0.5);
        self.cruise_t = cruise_d.max(0.0) / self.cruise_v;
        self.decel_t = decel_d / ((self.end_v + self.cruise_v) * 0.5);
    }

    pub fn total_time(&self) -> f64 {
        self.accel_t + self.cruise_t + self.decel_t
    }

    pub fn is_extrude_move(&self) -> bool {
        self.axes_d.w != 0.0
    }
}

/// Lookahead buffer of pending moves. The backward pass sizes junction
/// velocities assuming the machine comes to rest after the final queued
/// move; a lazy flush only releases the prefix whose plan can no longer
/// change.
#[derive(Default)]
pub struct MoveQueue {
    queue: Vec<Move>,
    junction_flush: f64,
}

impl MoveQueue {
    pub fn new() -> MoveQueue {
        MoveQueue {
            queue: Vec::new(),
            junction_flush: LOOKAHEAD_FLUSH_TIME,
        }
    }

    pub fn reset(&mut self) {
        self.queue.clear();
        self.junction_flush = LOOKAHEAD_FLUSH_TIME;
    }

    pub fn set_flush_time(&mut self, flush_time: f64) {
        self.junction_flush = flush_time;
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn last_move_mut(&mut self) -> Option<&mut Move> {
        self.queue.last_mut()
    }

    /// Append a move, computing its junction limit against the queue tail.
    /// Returns true once enough move time has accumulated that the caller
    /// should run a lazy flush.
    pub fn add_move(&mut self, mut m: Move, extruder: &dyn Extruder) -> bool {
        if let Some(prev) = self.queue.last() {
            let extruder_v2 = extruder.calc_junction(prev, &m);
            m.calc_junction(prev, extruder_v2);
            self.junction_flush -= m.min_move_t;
        }
        self.queue.push(m);
        self.queue.len() > 1 && self.junction_flush <= 0.0
    }

    /// Backward-plan the queue and drain the ready prefix, fully timed. A
    /// lazy flush keeps the suffix that a future move could still replan and
    /// may return nothing.
    pub fn flush(&mut self, lazy: bool) -> Vec<Move> {
        self.junction_flush = LOOKAHEAD_FLUSH_TIME;
        let mut update_flush_count = lazy;
        let mut flush_count = self.queue.len();
        // Traverse from last to first; assume v = 0 after the last move.
        let mut delayed: Vec<(&mut Move, f64, f64)> = Vec::new();
        let mut next_end_v2 = 0.0;
        let mut next_smoothed_v2 = 0.0;
        let mut peak_cruise_v2 = 0.0;
        for (idx, m) in self.queue.iter_mut().enumerate().rev() {
            let reachable_start_v2 = next_end_v2 + m.delta_v2;
            let start_v2 = m.max_start_v2.min(reachable_start_v2);
            let reachable_smoothed_v2 = next_smoothed_v2 + m.smooth_delta_v2;
            let smoothed_v2 = m.max_smoothed_v2.min(reachable_smoothed_v2);
            if smoothed_v2 < reachable_smoothed_v2 {
                // This move can accelerate in the smoothed envelope
                if smoothed_v2 + m.smooth_delta_v2 > next_smoothed_v2 || !delayed.is_empty() {
                    // It can also decelerate, or it caps a run of full-accel
                    // moves after a full-decel one: close out the peak window
                    if update_flush_count && peak_cruise_v2 != 0.0 {
                        flush_count = idx;
                        update_flush_count = false;
                    }
                    peak_cruise_v2 = m
                        .max_cruise_v2
                        .min((smoothed_v2 + reachable_smoothed_v2) * 0.5);
                    if !delayed.is_empty() {
                        if !update_flush_count && idx < flush_count {
                            let mut mc_v2 = peak_cruise_v2;
                            for (dm, ms_v2, me_v2) in delayed.iter_mut().rev() {
                                mc_v2 = mc_v2.min(*ms_v2);
                                dm.set_junction(ms_v2.min(mc_v2), mc_v2, me_v2.min(mc_v2));
                            }
                        }
                        delayed.clear();
                    }
                }
                if !update_flush_count && idx < flush_count {
                    let cruise_v2 = ((start_v2 + reachable_start_v2) * 0.5)
                        .min(m.max_cruise_v2)
                        .min(peak_cruise_v2);
                    m.set_junction(
                        start_v2.min(cruise_v2),
                        cruise_v2,
                        next_end_v2.min(cruise_v2),
                    );
                }
            } else {
                // Hold until the governing peak cruise velocity is known
                delayed.push((m, start_v2, next_end_v2));
            }
            next_end_v2 = start_v2;
            next_smoothed_v2 = smoothed_v2;
        }
        drop(delayed);
        if update_flush_count || flush_count == 0 {
            return Vec::new();
        }
        trace!(
            flushed = flush_count,
            remaining = self.queue.len() - flush_count,
            "lookahead flush"
        );
        self.queue.drain(..flush_count).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extruder::DummyExtruder;
    use approx::assert_relative_eq;

    fn limits(max_velocity: f64, max_accel: f64, accel_to_decel: f64, scv: f64) -> PlannerLimits {
        let mut limits = PlannerLimits {
            max_velocity,
            max_accel,
            requested_accel_to_decel: Some(accel_to_decel),
            square_corner_velocity: scv,
            max_accel_to_decel: 0.0,
            junction_deviation: 0.0,
        };
        limits.recalculate();
        limits
    }

    fn xmove(limits: &PlannerLimits, from: f64, to: f64, speed: f64) -> Move {
        Move::new(
            limits,
            Vec4::new(from, 0.0, 0.0, 0.0),
            Vec4::new(to, 0.0, 0.0, 0.0),
            speed,
        )
    }

    #[test]
    fn junction_deviation_from_square_corner_velocity() {
        let limits = limits(200.0, 1000.0, 1000.0, 5.0);
        assert_relative_eq!(
            limits.junction_deviation,
            25.0 * (2.0f64.sqrt() - 1.0) / 1000.0,
            epsilon = 1e-12
        );
    }

    #[test]
    fn accel_to_decel_default_tracks_max_accel() {
        let mut limits = PlannerLimits {
            max_accel: 6000.0,
            ..PlannerLimits::default()
        };
        limits.recalculate();
        assert_eq!(limits.max_accel_to_decel, 3000.0);
        // and it follows a later accel change until explicitly requested
        limits.set_max_accel(2000.0);
        assert_eq!(limits.max_accel_to_decel, 1000.0);
        limits.set_accel_to_decel(1500.0);
        limits.set_max_accel(8000.0);
        assert_eq!(limits.max_accel_to_decel, 1500.0);
    }

    #[test]
    fn extrude_only_move_classification() {
        let limits = limits(200.0, 1000.0, 500.0, 5.0);
        let m = Move::new(&limits, Vec4::ZERO, Vec4::new(0.0, 0.0, 0.0, 5.0), 10.0);
        assert!(!m.is_kinematic_move);
        assert_eq!(m.move_d, 5.0);
        assert_eq!(m.axes_d.xyz(), glam::DVec3::ZERO);
        assert!(m.accel > 1e7);
        // requested speed wins over max_velocity for pure extrusion
        assert_eq!(m.max_cruise_v2, 100.0);
    }

    #[test]
    fn kinematic_move_direction_is_unit() {
        let limits = limits(200.0, 1000.0, 500.0, 5.0);
        let m = Move::new(&limits, Vec4::ZERO, Vec4::new(3.0, 4.0, 0.0, 1.0), 50.0);
        assert!(m.is_kinematic_move);
        assert_relative_eq!(m.axes_r.xyz().length(), 1.0, epsilon = 1e-12);
        assert_relative_eq!(m.move_d, 5.0, epsilon = 1e-12);
    }

    #[test]
    fn limit_speed_only_tightens() {
        let limits = limits(200.0, 1000.0, 1000.0, 5.0);
        let mut m = xmove(&limits, 0.0, 10.0, 100.0);
        m.limit_speed(500.0, 5000.0);
        assert_eq!(m.max_cruise_v2, 10000.0);
        assert_eq!(m.accel, 1000.0);
        m.limit_speed(50.0, 400.0);
        assert_eq!(m.max_cruise_v2, 2500.0);
        assert_eq!(m.accel, 400.0);
        assert_eq!(m.delta_v2, 2.0 * 10.0 * 400.0);
    }

    #[test]
    fn collinear_junction_carries_full_speed() {
        let limits = limits(200.0, 1000.0, 1000.0, 5.0);
        let extruder = DummyExtruder::new();
        let mut queue = MoveQueue::new();
        queue.add_move(xmove(&limits, 0.0, 10.0, 50.0), &extruder);
        queue.add_move(xmove(&limits, 10.0, 20.0, 50.0), &extruder);
        let moves = queue.flush(false);
        assert_eq!(moves.len(), 2);
        assert_relative_eq!(moves[0].end_v, 50.0, epsilon = 1e-9);
        assert_relative_eq!(moves[1].start_v, 50.0, epsilon = 1e-9);
        assert_relative_eq!(moves[1].end_v, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn right_angle_junction_honors_square_corner_velocity() {
        let limits = limits(200.0, 1000.0, 1000.0, 5.0);
        let extruder = DummyExtruder::new();
        let mut queue = MoveQueue::new();
        queue.add_move(xmove(&limits, 0.0, 10.0, 200.0), &extruder);
        queue.add_move(
            Move::new(
                &limits,
                Vec4::new(10.0, 0.0, 0.0, 0.0),
                Vec4::new(10.0, 10.0, 0.0, 0.0),
                200.0,
            ),
            &extruder,
        );
        let moves = queue.flush(false);
        assert_eq!(moves.len(), 2);
        assert_relative_eq!(moves[1].start_v, 5.0, epsilon = 1e-6);
        assert_relative_eq!(moves[0].end_v, 5.0, epsilon = 1e-6);
    }

    #[test]
    fn junction_entry_never_exceeds_previous_exit() {
        let limits = limits(300.0, 2000.0, 1000.0, 5.0);
        let extruder = DummyExtruder::new();
        let mut queue = MoveQueue::new();
        let path = [
            (10.0, 0.0),
            (10.0, 10.0),
            (0.0, 10.0),
            (0.0, 0.5),
            (20.0, 0.5),
        ];
        let mut last = Vec4::ZERO;
        for (x, y) in path {
            let next = Vec4::new(x, y, 0.0, 0.0);
            queue.add_move(Move::new(&limits, last, next, 150.0), &extruder);
            last = next;
        }
        let moves = queue.flush(false);
        assert_eq!(moves.len(), path.len());
        for pair in moves.windows(2) {
            let exit_v2 = pair[0].end_v * pair[0].end_v;
            let entry_v2 = pair[1].start_v * pair[1].start_v;
            assert!(entry_v2 <= exit_v2 + 1e-6);
        }
        for m in &moves {
            assert!(m.cruise_v + 1e-9 >= m.start_v.max(m.end_v));
        }
    }

    #[test]
    fn trapezoid_distances_close() {
        let limits = limits(200.0, 1000.0, 1000.0, 5.0);
        let extruder = DummyExtruder::new();
        let mut queue = MoveQueue::new();
        queue.add_move(xmove(&limits, 0.0, 10.0, 100.0), &extruder);
        let moves = queue.flush(false);
        let m = &moves[0];
        let accel_d = (m.cruise_v * m.cruise_v - m.start_v * m.start_v) / (2.0 * m.accel);
        let decel_d = (m.cruise_v * m.cruise_v - m.end_v * m.end_v) / (2.0 * m.accel);
        let cruise_d = m.cruise_t * m.cruise_v;
        assert_relative_eq!(
            accel_d + cruise_d + decel_d,
            m.move_d,
            epsilon = 1e-9 * m.move_d
        );
    }

    #[test]
    fn lazy_flush_waits_for_complete_peak_window() {
        let limits = limits(200.0, 1000.0, 1000.0, 5.0);
        let extruder = DummyExtruder::new();
        let mut queue = MoveQueue::new();
        // A single short move gives the lazy pass nothing safe to release:
        // a future move could still raise its exit velocity.
        queue.add_move(xmove(&limits, 0.0, 1.0, 100.0), &extruder);
        let moves = queue.flush(true);
        assert!(moves.is_empty());
        assert_eq!(queue.len(), 1);
        // A forced flush releases it
        let moves = queue.flush(false);
        assert_eq!(moves.len(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn add_move_requests_flush_after_budget() {
        let limits = limits(200.0, 1000.0, 1000.0, 5.0);
        let extruder = DummyExtruder::new();
        let mut queue = MoveQueue::new();
        // each move takes 1s at 10mm/s; second add burns through the budget
        assert!(!queue.add_move(xmove(&limits, 0.0, 10.0, 10.0), &extruder));
        assert!(queue.add_move(xmove(&limits, 10.0, 20.0, 10.0), &extruder));
    }
}
