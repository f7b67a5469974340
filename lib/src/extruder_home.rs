//! Homing an extruder rail through the regular homing machinery.
//!
//! The homing driver expects a toolhead; `ExtruderHomer` satisfies that
//! contract while routing all motion at a single auxiliary rail. The main
//! toolhead still drives the physical move (the rail rides the extruder axis
//! of the 4-D drip move), so XYZ stay frozen at their captured positions.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use glam::{DVec3 as Vec3, DVec4 as Vec4};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::homing::{self, HomingError, HomingToolhead, Rail};
use crate::planner::MoveError;
use crate::reactor::Completion;
use crate::toolhead::ToolHead;
use crate::trapq::TrapQueue;

/// What to adopt as the rail position once the homing move halts.
///
/// `HaltPosition` keeps the endstop-derived halt coordinate. `Zero` clamps
/// the rail to zero instead, which hides any halt-position correction but
/// avoids a spurious follow-up move on setups whose rail coordinate is only
/// meaningful relative to the endstop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetractPolicy {
    HaltPosition,
    Zero,
}

impl Default for RetractPolicy {
    fn default() -> Self {
        RetractPolicy::HaltPosition
    }
}

/// Toolhead adapter narrowed to one auxiliary rail. Lives only for the
/// duration of a homing cycle.
pub struct ExtruderHomer<'a> {
    toolhead: &'a mut ToolHead,
    rail: Rc<RefCell<dyn Rail>>,
    extruder_trapq: Rc<RefCell<TrapQueue>>,
    th_orig_pos: Vec4,
    policy: RetractPolicy,
}

impl<'a> ExtruderHomer<'a> {
    pub fn new(
        toolhead: &'a mut ToolHead,
        rail: Rc<RefCell<dyn Rail>>,
        policy: RetractPolicy,
    ) -> Result<ExtruderHomer<'a>, MoveError> {
        let extruder_trapq = toolhead.extruder().trapq().ok_or(MoveError::NoExtruder)?;
        let th_orig_pos = toolhead.get_position();
        Ok(ExtruderHomer {
            toolhead,
            rail,
            extruder_trapq,
            th_orig_pos,
            policy,
        })
    }
}

impl HomingToolhead for ExtruderHomer<'_> {
    fn flush_step_generation(&mut self) {
        self.toolhead.flush_step_generation();
    }

    fn get_last_move_time(&mut self) -> f64 {
        self.toolhead.get_last_move_time()
    }

    fn dwell(&mut self, delay: f64) {
        self.toolhead.dwell(delay);
    }

    fn drip_move(
        &mut self,
        newpos: Vec4,
        speed: f64,
        completion: &Completion,
    ) -> Result<(), MoveError> {
        debug!(?newpos, speed, "drip-moving auxiliary rail");
        self.toolhead.drip_move(newpos, speed, completion)
    }

    /// XYZ as captured at homing start, the rail's commanded coordinate as
    /// the extruder component.
    fn get_position(&self) -> Vec4 {
        let orig = self.th_orig_pos;
        Vec4::new(
            orig.x,
            orig.y,
            orig.z,
            self.rail.borrow().get_commanded_position(),
        )
    }

    /// Adopt the homed coordinate on the auxiliary axis only. The halt
    /// coordinate arrives in the first element, per `calc_position`.
    fn set_position(&mut self, newpos: Vec4, _homing_axes: &[usize]) {
        let e_new = match self.policy {
            RetractPolicy::HaltPosition => newpos.x,
            RetractPolicy::Zero => 0.0,
        };
        self.toolhead.flush_step_generation();
        let print_time = self.toolhead.print_time();
        self.extruder_trapq
            .borrow_mut()
            .set_position(print_time, Vec3::new(e_new, 0.0, 0.0));
        self.rail
            .borrow_mut()
            .set_position(Vec3::new(e_new, 0.0, 0.0));
        let orig = self.th_orig_pos;
        self.toolhead
            .set_position(Vec4::new(orig.x, orig.y, orig.z, e_new), &[]);
    }

    fn get_steppers(&self) -> Vec<Rc<RefCell<dyn Rail>>> {
        vec![self.rail.clone()]
    }

    /// The homing driver assumes a Cartesian-style stepper-to-axis mapping;
    /// expose the rail's own coordinate as the first axis.
    fn calc_position(&self, stepper_positions: &HashMap<String, f64>) -> Vec3 {
        let name = self.rail.borrow().name();
        Vec3::new(
            stepper_positions.get(&name).copied().unwrap_or(0.0),
            0.0,
            0.0,
        )
    }
}

/// Home one auxiliary rail end to end: compute the homing travel from the
/// rail's own homing info, then run the generic homing cycle through the
/// adapter.
pub fn home_extruder(
    toolhead: &mut ToolHead,
    rail: Rc<RefCell<dyn Rail>>,
    policy: RetractPolicy,
) -> Result<(), HomingError> {
    let reactor = toolhead.reactor().clone();
    let (homing_info, range, endstops) = {
        let rail = rail.borrow();
        (rail.get_homing_info(), rail.get_range(), rail.get_endstops())
    };
    let movepos_e = homing::homing_travel_distance(&homing_info, range);
    let mut homer = ExtruderHomer::new(toolhead, rail, policy)?;
    let orig = homer.th_orig_pos;
    let target = Vec4::new(orig.x, orig.y, orig.z, movepos_e);
    info!(target_e = movepos_e, speed = homing_info.speed, "homing extruder rail");
    homing::manual_home(
        &mut homer,
        &reactor,
        &endstops,
        target,
        homing_info.speed,
        true,
        true,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extruder::{ExtruderConfig, PrinterExtruder};
    use crate::homing::{HomingInfo, SimRail};
    use crate::kinematics::{CartesianConfig, CartesianKinematics};
    use crate::mcu::{McuClock, SimulatedMcu};
    use crate::reactor::Reactor;
    use crate::toolhead::{QueuingState, ToolHead, ToolheadConfig};

    fn build(reactor: &Reactor) -> ToolHead {
        let mcu: Rc<RefCell<dyn McuClock>> =
            Rc::new(RefCell::new(SimulatedMcu::new("mcu")));
        let kin = Box::new(CartesianKinematics::new(CartesianConfig::default()));
        let extruder = Box::new(PrinterExtruder::new(
            "extruder",
            ExtruderConfig::default(),
        ));
        let mut th = ToolHead::new(
            ToolheadConfig::default(),
            reactor.clone(),
            vec![mcu],
            kin,
            extruder,
        )
        .unwrap();
        th.set_position(Vec4::new(7.0, 8.0, 9.0, 0.0), &[0, 1, 2]);
        th
    }

    fn e_rail(reactor: &Reactor) -> SimRail {
        SimRail::new(
            reactor,
            "extruder_stepper",
            (0.0, 100.0),
            HomingInfo {
                speed: 5.0,
                position_endstop: 0.0,
                positive_dir: false,
            },
        )
    }

    #[test]
    fn homing_freezes_xyz_and_updates_extruder_axis() {
        let reactor = Reactor::new_manual();
        let mut th = build(&reactor);
        let rail = e_rail(&reactor);
        rail.trip_at(0.8, 1.25);
        home_extruder(&mut th, rail.as_rail(), RetractPolicy::HaltPosition).unwrap();
        let pos = th.get_position();
        assert_eq!(pos.x, 7.0);
        assert_eq!(pos.y, 8.0);
        assert_eq!(pos.z, 9.0);
        assert_eq!(pos.w, 1.25);
        assert_eq!(rail.commanded_position(), 1.25);
        assert_eq!(th.queuing_state(), QueuingState::Flushed);
        assert_eq!(th.lookahead_depth(), 0);
    }

    #[test]
    fn zero_policy_clamps_rail_to_zero() {
        let reactor = Reactor::new_manual();
        let mut th = build(&reactor);
        let rail = e_rail(&reactor);
        rail.trip_at(0.8, 1.25);
        home_extruder(&mut th, rail.as_rail(), RetractPolicy::Zero).unwrap();
        assert_eq!(th.get_position().w, 0.0);
        assert_eq!(rail.commanded_position(), 0.0);
    }

    #[test]
    fn missed_trigger_is_an_error() {
        let reactor = Reactor::new_manual();
        let mut th = build(&reactor);
        let rail = e_rail(&reactor);
        // never tripped: the full travel completes without a trigger
        let result = home_extruder(&mut th, rail.as_rail(), RetractPolicy::HaltPosition);
        assert!(matches!(
            result,
            Err(HomingError::EndstopNotTriggered(name)) if name == "extruder_stepper"
        ));
        // the failed cycle still leaves the toolhead parked and consistent
        assert_eq!(th.queuing_state(), QueuingState::Flushed);
    }
}
