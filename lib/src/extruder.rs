//! Extruder contract and the rail-backed implementation.
//!
//! The toolhead only ever talks to the trait: junction ceilings during
//! lookahead, `check_move` vetting, and the projection of each planned
//! trapezoid onto the extruder axis of its own trapq.

use std::cell::RefCell;
use std::rc::Rc;

use glam::DVec3 as Vec3;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::planner::{Move, MoveError};
use crate::trapq::TrapQueue;

pub trait Extruder {
    /// Vet a move that changes the extruder axis; may tighten its caps via
    /// `Move::limit_speed` or reject it outright.
    fn check_move(&self, m: &mut Move) -> Result<(), MoveError>;

    /// Extruder-imposed ceiling (mm²/s²) on the junction between two moves.
    fn calc_junction(&self, prev_move: &Move, m: &Move) -> f64;

    /// Project a planned move onto the extruder axis at `print_time`.
    fn queue_move(&mut self, print_time: f64, m: &Move);

    /// Expire extruder trapq entries older than `flush_time`.
    fn update_move_time(&mut self, flush_time: f64);

    fn name(&self) -> &str;

    fn trapq(&self) -> Option<Rc<RefCell<TrapQueue>>>;

    fn last_position(&self) -> f64;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtruderConfig {
    pub max_extrude_only_velocity: f64,
    pub max_extrude_only_accel: f64,
    pub instant_corner_velocity: f64,
}

impl Default for ExtruderConfig {
    fn default() -> Self {
        ExtruderConfig {
            max_extrude_only_velocity: 60.0,
            max_extrude_only_accel: 1800.0,
            instant_corner_velocity: 1.0,
        }
    }
}

/// An extruder with its own trapezoid queue. Filament handling (pressure
/// advance, heater gating) lives with the stepper side; this covers what the
/// planner needs.
pub struct PrinterExtruder {
    name: String,
    config: ExtruderConfig,
    trapq: Rc<RefCell<TrapQueue>>,
    last_position: f64,
}

impl PrinterExtruder {
    pub fn new(name: &str, config: ExtruderConfig) -> PrinterExtruder {
        PrinterExtruder {
            name: name.to_string(),
            config,
            trapq: Rc::new(RefCell::new(TrapQueue::new())),
            last_position: 0.0,
        }
    }
}

impl Extruder for PrinterExtruder {
    fn check_move(&self, m: &mut Move) -> Result<(), MoveError> {
        if !m.is_kinematic_move {
            // Pure extrusion is bounded by the extruder's own caps, scaled
            // back to the full move
            let inv_extrude_r = 1.0 / m.axes_r.w.abs();
            m.limit_speed(
                self.config.max_extrude_only_velocity * inv_extrude_r,
                self.config.max_extrude_only_accel * inv_extrude_r,
            );
        }
        Ok(())
    }

    fn calc_junction(&self, prev_move: &Move, m: &Move) -> f64 {
        let diff_r = (m.axes_r.w - prev_move.axes_r.w).abs();
        if diff_r > 0.0 {
            let v = self.config.instant_corner_velocity / diff_r;
            v * v
        } else {
            m.max_cruise_v2
        }
    }

    fn queue_move(&mut self, print_time: f64, m: &Move) {
        let axis_r = m.axes_r.w;
        self.trapq.borrow_mut().append(
            print_time,
            m.accel_t,
            m.cruise_t,
            m.decel_t,
            Vec3::new(m.start_pos.w, 0.0, 0.0),
            Vec3::X,
            m.start_v * axis_r,
            m.cruise_v * axis_r,
            m.accel * axis_r,
        );
        self.last_position = m.end_pos.w;
    }

    fn update_move_time(&mut self, flush_time: f64) {
        self.trapq.borrow_mut().finalize_moves(flush_time);
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn trapq(&self) -> Option<Rc<RefCell<TrapQueue>>> {
        Some(self.trapq.clone())
    }

    fn last_position(&self) -> f64 {
        self.last_position
    }
}

/// Placeholder wired in when the machine has no extruder at all.
#[derive(Debug, Default)]
pub struct DummyExtruder;

impl DummyExtruder {
    pub fn new() -> DummyExtruder {
        DummyExtruder
    }
}

impl Extruder for DummyExtruder {
    fn check_move(&self, _m: &mut Move) -> Result<(), MoveError> {
        Err(MoveError::NoExtruder)
    }

    fn calc_junction(&self, _prev_move: &Move, m: &Move) -> f64 {
        m.max_cruise_v2
    }

    fn queue_move(&mut self, _print_time: f64, _m: &Move) {
        debug!("dropping extruder move without an extruder");
    }

    fn update_move_time(&mut self, _flush_time: f64) {}

    fn name(&self) -> &str {
        ""
    }

    fn trapq(&self) -> Option<Rc<RefCell<TrapQueue>>> {
        None
    }

    fn last_position(&self) -> f64 {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::PlannerLimits;
    use glam::DVec4 as Vec4;

    fn planned_extrude_move(e_dist: f64, speed: f64) -> Move {
        let limits = PlannerLimits::default();
        let mut m = Move::new(
            &limits,
            Vec4::ZERO,
            Vec4::new(0.0, 0.0, 0.0, e_dist),
            speed,
        );
        let v2 = m.max_cruise_v2;
        m.set_junction(0.0, v2, 0.0);
        m
    }

    #[test]
    fn extrude_only_caps_apply() {
        let extruder = PrinterExtruder::new("extruder", ExtruderConfig::default());
        let limits = PlannerLimits::default();
        let mut m = Move::new(&limits, Vec4::ZERO, Vec4::new(0.0, 0.0, 0.0, 5.0), 500.0);
        extruder.check_move(&mut m).unwrap();
        // axes_r.w == 1 for pure extrusion, so the caps bind directly
        assert_eq!(m.max_cruise_v2, 60.0 * 60.0);
        assert_eq!(m.accel, 1800.0);
    }

    #[test]
    fn junction_ceiling_follows_flow_change() {
        let config = ExtruderConfig {
            instant_corner_velocity: 1.0,
            ..ExtruderConfig::default()
        };
        let extruder = PrinterExtruder::new("extruder", config);
        let limits = PlannerLimits::default();
        let a = Move::new(&limits, Vec4::ZERO, Vec4::new(10.0, 0.0, 0.0, 0.5), 100.0);
        let b = Move::new(
            &limits,
            Vec4::new(10.0, 0.0, 0.0, 0.5),
            Vec4::new(20.0, 0.0, 0.0, 1.5),
            100.0,
        );
        let diff_r = (b.axes_r.w - a.axes_r.w).abs();
        let expected = (1.0 / diff_r) * (1.0 / diff_r);
        assert!((extruder.calc_junction(&a, &b) - expected).abs() < 1e-6);
        // identical flow ratio puts no extra bound on the junction
        let c = Move::new(
            &limits,
            Vec4::new(20.0, 0.0, 0.0, 1.5),
            Vec4::new(30.0, 0.0, 0.0, 2.5),
            100.0,
        );
        let d = Move::new(
            &limits,
            Vec4::new(30.0, 0.0, 0.0, 2.5),
            Vec4::new(40.0, 0.0, 0.0, 3.5),
            100.0,
        );
        assert_eq!(extruder.calc_junction(&c, &d), d.max_cruise_v2);
    }

    #[test]
    fn queue_move_lands_in_own_trapq() {
        let mut extruder = PrinterExtruder::new("extruder", ExtruderConfig::default());
        let m = planned_extrude_move(5.0, 10.0);
        extruder.queue_move(1.0, &m);
        let tq = extruder.trapq().unwrap();
        assert!(tq.borrow().active_len() > 0);
        assert_eq!(extruder.last_position(), 5.0);
    }

    #[test]
    fn dummy_rejects_extrusion() {
        let extruder = DummyExtruder::new();
        let limits = PlannerLimits::default();
        let mut m = Move::new(&limits, Vec4::ZERO, Vec4::new(0.0, 0.0, 0.0, 1.0), 10.0);
        assert!(matches!(
            extruder.check_move(&mut m),
            Err(MoveError::NoExtruder)
        ));
    }
}
