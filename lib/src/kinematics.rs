//! Kinematics contract and the Cartesian reference implementation.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use glam::{DVec3 as Vec3, DVec4 as Vec4};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::homing::Rail;
use crate::planner::{Move, MoveError};

pub trait Kinematics {
    /// Vet a queued move against axis limits; may tighten its caps via
    /// `Move::limit_speed` or reject it.
    fn check_move(&self, m: &mut Move) -> Result<(), MoveError>;

    /// Adopt an externally-imposed position; `homing_axes` marks axes that
    /// are now considered homed.
    fn set_position(&mut self, newpos: Vec4, homing_axes: &[usize]);

    fn get_steppers(&self) -> Vec<Rc<RefCell<dyn Rail>>>;

    /// Map stepper coordinates (keyed by rail name) to a Cartesian triple.
    fn calc_position(&self, stepper_positions: &HashMap<String, f64>) -> Vec3;

    fn get_status(&self, eventtime: f64) -> serde_json::Value;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CartesianConfig {
    pub position_min: [f64; 3],
    pub position_max: [f64; 3],
    pub max_z_velocity: f64,
    pub max_z_accel: f64,
}

impl Default for CartesianConfig {
    fn default() -> Self {
        CartesianConfig {
            position_min: [0.0; 3],
            position_max: [200.0, 200.0, 200.0],
            max_z_velocity: 25.0,
            max_z_accel: 100.0,
        }
    }
}

const AXIS_NAMES: [char; 3] = ['x', 'y', 'z'];

/// Straight-through Cartesian kinematics: one rail per axis. Axes start
/// unhomed (inverted limits) and only accept motion after `set_position`
/// marks them homed.
pub struct CartesianKinematics {
    config: CartesianConfig,
    limits: [(f64, f64); 3],
    rails: Vec<Rc<RefCell<dyn Rail>>>,
}

impl CartesianKinematics {
    pub fn new(config: CartesianConfig) -> CartesianKinematics {
        CartesianKinematics {
            config,
            limits: [(1.0, -1.0); 3],
            rails: Vec::new(),
        }
    }

    /// Attach rails in x, y, z order; optional, used by homing.
    pub fn add_rail(&mut self, rail: Rc<RefCell<dyn Rail>>) {
        self.rails.push(rail);
    }

    fn check_endstops(&self, m: &Move) -> Result<(), MoveError> {
        let end = m.end_pos;
        let end_axes = end.as_ref();
        let axes_d = m.axes_d.as_ref();
        for axis in 0..3 {
            let (lo, hi) = self.limits[axis];
            if axes_d[axis] != 0.0 && (end_axes[axis] < lo || end_axes[axis] > hi) {
                if lo > hi {
                    return Err(MoveError::MustHomeFirst(AXIS_NAMES[axis]));
                }
                return Err(MoveError::OutOfRange(end));
            }
        }
        Ok(())
    }

    fn homed_axes(&self) -> String {
        (0..3)
            .filter(|&axis| {
                let (lo, hi) = self.limits[axis];
                lo <= hi
            })
            .map(|axis| AXIS_NAMES[axis])
            .collect()
    }
}

impl Kinematics for CartesianKinematics {
    fn check_move(&self, m: &mut Move) -> Result<(), MoveError> {
        let end = m.end_pos;
        let (xlo, xhi) = self.limits[0];
        let (ylo, yhi) = self.limits[1];
        if end.x < xlo || end.x > xhi || end.y < ylo || end.y > yhi {
            self.check_endstops(m)?;
        }
        if m.axes_d.z == 0.0 {
            // Normal XY move: limits already vetted above
            return Ok(());
        }
        self.check_endstops(m)?;
        // Move with Z: cap to the slower Z axis, scaled back to full travel
        let z_ratio = m.move_d / m.axes_d.z.abs();
        m.limit_speed(
            self.config.max_z_velocity * z_ratio,
            self.config.max_z_accel * z_ratio,
        );
        Ok(())
    }

    fn set_position(&mut self, newpos: Vec4, homing_axes: &[usize]) {
        for (axis, rail) in self.rails.iter().enumerate() {
            rail.borrow_mut()
                .set_position(Vec3::new(newpos.as_ref()[axis], 0.0, 0.0));
        }
        for &axis in homing_axes {
            if axis < 3 {
                self.limits[axis] = (
                    self.config.position_min[axis],
                    self.config.position_max[axis],
                );
            }
        }
    }

    fn get_steppers(&self) -> Vec<Rc<RefCell<dyn Rail>>> {
        self.rails.clone()
    }

    fn calc_position(&self, stepper_positions: &HashMap<String, f64>) -> Vec3 {
        let lookup = |axis: usize| {
            let name = self
                .rails
                .get(axis)
                .map(|r| r.borrow().name())
                .unwrap_or_else(|| format!("stepper_{}", AXIS_NAMES[axis]));
            stepper_positions.get(&name).copied().unwrap_or(0.0)
        };
        Vec3::new(lookup(0), lookup(1), lookup(2))
    }

    fn get_status(&self, _eventtime: f64) -> serde_json::Value {
        json!({
            "homed_axes": self.homed_axes(),
            "axis_minimum": self.config.position_min,
            "axis_maximum": self.config.position_max,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planner::PlannerLimits;

    fn kin() -> CartesianKinematics {
        CartesianKinematics::new(CartesianConfig::default())
    }

    fn planner_limits() -> PlannerLimits {
        PlannerLimits::default()
    }

    #[test]
    fn unhomed_axis_rejects_motion() {
        let kin = kin();
        let limits = planner_limits();
        let mut m = Move::new(&limits, Vec4::ZERO, Vec4::new(10.0, 0.0, 0.0, 0.0), 100.0);
        assert!(matches!(
            kin.check_move(&mut m),
            Err(MoveError::MustHomeFirst('x'))
        ));
    }

    #[test]
    fn out_of_range_move_rejected_after_homing() {
        let mut kin = kin();
        kin.set_position(Vec4::ZERO, &[0, 1, 2]);
        let limits = planner_limits();
        let mut m = Move::new(&limits, Vec4::ZERO, Vec4::new(250.0, 0.0, 0.0, 0.0), 100.0);
        assert!(matches!(
            kin.check_move(&mut m),
            Err(MoveError::OutOfRange(_))
        ));
        let mut m = Move::new(&limits, Vec4::ZERO, Vec4::new(150.0, 0.0, 0.0, 0.0), 100.0);
        kin.check_move(&mut m).unwrap();
    }

    #[test]
    fn z_moves_are_speed_capped() {
        let mut kin = kin();
        kin.set_position(Vec4::ZERO, &[0, 1, 2]);
        let limits = planner_limits();
        let mut m = Move::new(&limits, Vec4::ZERO, Vec4::new(0.0, 0.0, 10.0, 0.0), 100.0);
        kin.check_move(&mut m).unwrap();
        assert_eq!(m.max_cruise_v2, 25.0 * 25.0);
        assert_eq!(m.accel, 100.0);
    }

    #[test]
    fn status_reports_homed_axes() {
        let mut kin = kin();
        assert_eq!(kin.get_status(0.0)["homed_axes"], "");
        kin.set_position(Vec4::ZERO, &[0, 2]);
        assert_eq!(kin.get_status(0.0)["homed_axes"], "xz");
    }
}
