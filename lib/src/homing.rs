//! Endstop-driven homing.
//!
//! The homing cycle only needs a narrow slice of the toolhead: flush, dwell,
//! drip-move, and position bookkeeping. `HomingToolhead` captures that slice
//! so the same driver can home the machine proper or, through an adapter, a
//! single auxiliary rail.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use glam::{DVec3 as Vec3, DVec4 as Vec4};
use thiserror::Error;
use tracing::{debug, info};

use crate::planner::MoveError;
use crate::reactor::{Completion, Reactor};

/// Settle time between arming the endstops and starting the drip move.
const HOMING_START_DELAY: f64 = 0.001;

#[derive(Error, Debug)]
pub enum HomingError {
    #[error("no trigger on {0} after full movement")]
    EndstopNotTriggered(String),
    #[error(transparent)]
    Move(#[from] MoveError),
}

/// The toolhead capability set consumed by the homing driver. Implemented by
/// the real toolhead and by auxiliary-rail adapters.
pub trait HomingToolhead {
    fn flush_step_generation(&mut self);
    fn get_last_move_time(&mut self) -> f64;
    fn dwell(&mut self, delay: f64);
    fn drip_move(&mut self, newpos: Vec4, speed: f64, completion: &Completion)
        -> Result<(), MoveError>;
    fn get_position(&self) -> Vec4;
    fn set_position(&mut self, newpos: Vec4, homing_axes: &[usize]);
    fn get_steppers(&self) -> Vec<Rc<RefCell<dyn Rail>>>;
    fn calc_position(&self, stepper_positions: &HashMap<String, f64>) -> Vec3;
}

/// Homing parameters a rail advertises.
#[derive(Debug, Clone, Copy)]
pub struct HomingInfo {
    pub speed: f64,
    pub position_endstop: f64,
    pub positive_dir: bool,
}

/// One linear rail: a stepper with a commanded coordinate and any endstops
/// wired to it.
pub trait Rail {
    fn name(&self) -> String;
    fn get_commanded_position(&self) -> f64;
    /// Coordinate layout is `[axis, 0, 0]`, matching the solver convention.
    fn set_position(&mut self, pos: Vec3);
    fn get_endstops(&self) -> Vec<(Rc<RefCell<dyn Endstop>>, String)>;
    fn get_homing_info(&self) -> HomingInfo;
    fn get_range(&self) -> (f64, f64);
}

pub trait Endstop {
    /// Arm the endstop; `completion` fires on trigger. `triggered` selects
    /// the trigger sense.
    fn home_start(&mut self, print_time: f64, completion: &Completion, triggered: bool);
    /// Finish the homing check. Returns the trigger time, or 0.0 when the
    /// move ended without a trigger.
    fn home_wait(&mut self, home_end_time: f64) -> f64;
}

/// Travel that guarantees reaching the endstop from anywhere in the range.
pub fn homing_travel_distance(homing: &HomingInfo, range: (f64, f64)) -> f64 {
    let (position_min, position_max) = range;
    if homing.positive_dir {
        homing.position_endstop - 1.5 * (homing.position_endstop - position_min)
    } else {
        homing.position_endstop + 1.5 * (position_max - homing.position_endstop)
    }
}

/// Drive one homing cycle: arm, drip toward the endstop, verify the trigger,
/// and rewrite the toolhead position from the halted stepper coordinates.
pub fn manual_home(
    toolhead: &mut dyn HomingToolhead,
    reactor: &Reactor,
    endstops: &[(Rc<RefCell<dyn Endstop>>, String)],
    movepos: Vec4,
    speed: f64,
    triggered: bool,
    check_triggered: bool,
) -> Result<(), HomingError> {
    toolhead.flush_step_generation();
    let startpos = toolhead.get_position();
    let print_time = toolhead.get_last_move_time();
    let completion = reactor.completion();
    for (endstop, name) in endstops {
        debug!(endstop = %name, print_time, "arming endstop");
        endstop
            .borrow_mut()
            .home_start(print_time, &completion, triggered);
    }
    toolhead.dwell(HOMING_START_DELAY);
    toolhead.drip_move(movepos, speed, &completion)?;
    let move_end_print_time = toolhead.get_last_move_time();
    let mut any_triggered = false;
    for (endstop, name) in endstops {
        let trigger_time = endstop.borrow_mut().home_wait(move_end_print_time);
        if trigger_time > 0.0 {
            any_triggered = true;
        } else if check_triggered {
            return Err(HomingError::EndstopNotTriggered(name.clone()));
        }
    }
    // Rewrite positions from where the steppers actually halted
    let mut stepper_positions = HashMap::new();
    for rail in toolhead.get_steppers() {
        let rail = rail.borrow();
        stepper_positions.insert(rail.name(), rail.get_commanded_position());
    }
    let halt = toolhead.calc_position(&stepper_positions);
    let current = toolhead.get_position();
    let newpos = Vec4::new(halt.x, halt.y, halt.z, current.w);
    let homing_axes: Vec<usize> = (0..3)
        .filter(|&axis| (movepos.as_ref()[axis] - startpos.as_ref()[axis]).abs() > 1e-9)
        .collect();
    toolhead.set_position(newpos, &homing_axes);
    info!(?newpos, triggered = any_triggered, "homing move finished");
    Ok(())
}

/// In-memory rail for tests and offline simulation. The shared inner state
/// lets its endstop report a halt position back to the rail the moment the
/// trigger fires.
#[derive(Debug)]
pub struct SimRailState {
    pub name: String,
    pub range: (f64, f64),
    pub homing: HomingInfo,
    pub commanded_pos: f64,
    /// Reactor time at which the endstop trips, if ever.
    pub trigger_eventtime: Option<f64>,
    /// Commanded position to report once tripped.
    pub halt_position: Option<f64>,
    armed: Option<Completion>,
}

#[derive(Debug, Clone)]
pub struct SimRail {
    state: Rc<RefCell<SimRailState>>,
    reactor: Reactor,
}

impl SimRail {
    pub fn new(reactor: &Reactor, name: &str, range: (f64, f64), homing: HomingInfo) -> SimRail {
        SimRail {
            state: Rc::new(RefCell::new(SimRailState {
                name: name.to_string(),
                range,
                homing,
                commanded_pos: 0.0,
                trigger_eventtime: None,
                halt_position: None,
                armed: None,
            })),
            reactor: reactor.clone(),
        }
    }

    /// Arrange for the endstop to trip at `eventtime` with the rail halted
    /// at `halt_position`.
    pub fn trip_at(&self, eventtime: f64, halt_position: f64) {
        let mut state = self.state.borrow_mut();
        state.trigger_eventtime = Some(eventtime);
        state.halt_position = Some(halt_position);
    }

    pub fn commanded_position(&self) -> f64 {
        self.state.borrow().commanded_pos
    }

    pub fn as_rail(&self) -> Rc<RefCell<dyn Rail>> {
        Rc::new(RefCell::new(self.clone()))
    }
}

impl Rail for SimRail {
    fn name(&self) -> String {
        self.state.borrow().name.clone()
    }

    fn get_commanded_position(&self) -> f64 {
        self.state.borrow().commanded_pos
    }

    fn set_position(&mut self, pos: Vec3) {
        self.state.borrow_mut().commanded_pos = pos.x;
    }

    fn get_endstops(&self) -> Vec<(Rc<RefCell<dyn Endstop>>, String)> {
        let endstop: Rc<RefCell<dyn Endstop>> = Rc::new(RefCell::new(SimEndstop {
            state: self.state.clone(),
            reactor: self.reactor.clone(),
        }));
        vec![(endstop, self.name())]
    }

    fn get_homing_info(&self) -> HomingInfo {
        self.state.borrow().homing
    }

    fn get_range(&self) -> (f64, f64) {
        self.state.borrow().range
    }
}

pub struct SimEndstop {
    state: Rc<RefCell<SimRailState>>,
    reactor: Reactor,
}

impl Endstop for SimEndstop {
    fn home_start(&mut self, _print_time: f64, completion: &Completion, _triggered: bool) {
        let mut state = self.state.borrow_mut();
        if let Some(at) = state.trigger_eventtime {
            self.reactor.schedule_completion(completion, at);
        }
        state.armed = Some(completion.clone());
    }

    fn home_wait(&mut self, _home_end_time: f64) -> f64 {
        let mut state = self.state.borrow_mut();
        let fired = state.armed.as_ref().map_or(false, Completion::test);
        state.armed = None;
        if fired {
            if let Some(halt) = state.halt_position {
                state.commanded_pos = halt;
            }
            state.trigger_eventtime.unwrap_or(0.0)
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn travel_distance_overshoots_range() {
        let homing = HomingInfo {
            speed: 5.0,
            position_endstop: 0.0,
            positive_dir: false,
        };
        let d = homing_travel_distance(&homing, (0.0, 100.0));
        assert_eq!(d, 150.0);
        let homing = HomingInfo {
            speed: 5.0,
            position_endstop: 200.0,
            positive_dir: true,
        };
        let d = homing_travel_distance(&homing, (0.0, 200.0));
        assert_eq!(d, -100.0);
    }

    #[test]
    fn sim_endstop_reports_trigger() {
        let reactor = Reactor::new_manual();
        let rail = SimRail::new(
            &reactor,
            "stepper_e",
            (0.0, 100.0),
            HomingInfo {
                speed: 5.0,
                position_endstop: 0.0,
                positive_dir: false,
            },
        );
        rail.trip_at(0.5, 2.0);
        let endstops = rail.get_endstops();
        assert_eq!(endstops[0].1, "stepper_e");
        let completion = reactor.completion();
        endstops[0]
            .0
            .borrow_mut()
            .home_start(0.0, &completion, true);
        reactor.pause(1.0);
        assert!(completion.test());
        let t = endstops[0].0.borrow_mut().home_wait(1.0);
        assert!(t > 0.0);
        assert_eq!(rail.commanded_position(), 2.0);
    }

    #[test]
    fn untripped_endstop_reports_zero() {
        let reactor = Reactor::new_manual();
        let rail = SimRail::new(
            &reactor,
            "stepper_e",
            (0.0, 100.0),
            HomingInfo {
                speed: 5.0,
                position_endstop: 0.0,
                positive_dir: false,
            },
        );
        let endstops = rail.get_endstops();
        let completion = reactor.completion();
        endstops[0]
            .0
            .borrow_mut()
            .home_start(0.0, &completion, true);
        reactor.pause(1.0);
        assert_eq!(endstops[0].0.borrow_mut().home_wait(1.0), 0.0);
    }
}
