//! Dispatch of parsed G-code commands onto the toolhead.
//!
//! Owns the little bit of front-end state the planner surface needs:
//! per-axis absolute/relative modes, G92 offsets, and the sticky feedrate.
//! Full G-code session handling (macros, transforms, multi-extruder tool
//! switching) stays with the host front-end.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use glam::DVec4 as Vec4;
use thiserror::Error;
use tracing::{debug, trace};

use crate::extruder_home::{self, RetractPolicy};
use crate::gcode::{GCodeCommand, GCodeOp};
use crate::homing::{HomingError, Rail};
use crate::planner::MoveError;
use crate::toolhead::ToolHead;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Move(#[from] MoveError),
    #[error(transparent)]
    Homing(#[from] HomingError),
    #[error("unknown auxiliary axis '{0}'")]
    UnknownAuxAxis(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionMode {
    Absolute,
    Relative,
}

/// An auxiliary rail registered for `HOME_EXTRUDER`.
pub struct AuxHome {
    pub rail: Rc<RefCell<dyn Rail>>,
    pub policy: RetractPolicy,
}

pub struct CommandDispatch {
    position_modes: [PositionMode; 4],
    base_position: Vec4,
    speed: f64,
    aux_homers: HashMap<String, AuxHome>,
}

impl Default for CommandDispatch {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandDispatch {
    pub fn new() -> CommandDispatch {
        CommandDispatch {
            position_modes: [
                PositionMode::Absolute,
                PositionMode::Absolute,
                PositionMode::Absolute,
                PositionMode::Relative,
            ],
            base_position: Vec4::ZERO,
            speed: 25.0,
            aux_homers: HashMap::new(),
        }
    }

    pub fn register_aux_homer(&mut self, name: &str, aux: AuxHome) {
        self.aux_homers.insert(name.to_string(), aux);
    }

    /// Execute one parsed command. Returns response text when the command
    /// produces any.
    pub fn execute(
        &mut self,
        toolhead: &mut ToolHead,
        cmd: &GCodeCommand,
    ) -> Result<Option<String>, DispatchError> {
        match &cmd.op {
            GCodeOp::Nop => Ok(None),
            GCodeOp::Move { x, y, z, e, f } => {
                if let Some(f) = f {
                    if *f > 0.0 {
                        self.speed = f / 60.0;
                    }
                }
                let cur = toolhead.get_position();
                let mut target = cur;
                let axes = [x, y, z, e];
                for (axis, value) in axes.iter().enumerate() {
                    if let Some(v) = value {
                        target.as_mut()[axis] = match self.position_modes[axis] {
                            PositionMode::Absolute => v + self.base_position.as_ref()[axis],
                            PositionMode::Relative => cur.as_ref()[axis] + v,
                        };
                    }
                }
                toolhead.move_to(target, self.speed)?;
                Ok(None)
            }
            GCodeOp::Numbered {
                letter,
                code,
                params,
            } => match (letter, code) {
                ('G', 4) => {
                    let delay = params.get_number::<f64>('P').map_or(0.0, |ms| ms / 1000.0);
                    toolhead.dwell(delay.max(0.0));
                    Ok(None)
                }
                ('G', 28) => {
                    // Primary-axis homing belongs to the host front-end
                    debug!("ignoring G28; primary homing is host-driven");
                    Ok(None)
                }
                ('G', 90) => {
                    for mode in &mut self.position_modes[..3] {
                        *mode = PositionMode::Absolute;
                    }
                    Ok(None)
                }
                ('G', 91) => {
                    for mode in &mut self.position_modes[..3] {
                        *mode = PositionMode::Relative;
                    }
                    Ok(None)
                }
                ('G', 92) => {
                    let commanded = toolhead.get_position();
                    let values = [
                        params.get_number::<f64>('X'),
                        params.get_number::<f64>('Y'),
                        params.get_number::<f64>('Z'),
                        params.get_number::<f64>('E'),
                    ];
                    for (axis, value) in values.iter().enumerate() {
                        if let Some(v) = value {
                            self.base_position.as_mut()[axis] =
                                commanded.as_ref()[axis] - v;
                        }
                    }
                    Ok(None)
                }
                ('M', 82) => {
                    self.position_modes[3] = PositionMode::Absolute;
                    Ok(None)
                }
                ('M', 83) => {
                    self.position_modes[3] = PositionMode::Relative;
                    Ok(None)
                }
                ('M', 204) => {
                    let s = params.get_number::<f64>('S');
                    let accel = match s {
                        Some(s) => s,
                        None => {
                            let p = params.get_number::<f64>('P');
                            let t = params.get_number::<f64>('T');
                            match (p, t) {
                                (Some(p), Some(t)) => p.min(t),
                                _ => return Ok(Some("Invalid M204 command".to_string())),
                            }
                        }
                    };
                    if accel > 0.0 {
                        toolhead.set_max_accel(accel);
                    }
                    Ok(None)
                }
                ('M', 400) => {
                    toolhead.wait_moves();
                    Ok(None)
                }
                _ => {
                    trace!(letter = %letter, code, "ignoring unhandled command");
                    Ok(None)
                }
            },
            GCodeOp::Extended { command, params } => match command.as_str() {
                "set_velocity_limit" => {
                    let report = toolhead.update_limits(
                        params.get_number::<f64>("velocity"),
                        params.get_number::<f64>("accel"),
                        params.get_number::<f64>("square_corner_velocity"),
                        params.get_number::<f64>("accel_to_decel"),
                    );
                    Ok(Some(report))
                }
                "home_extruder" => {
                    let name = params.get_str("extruder").unwrap_or("extruder");
                    let aux = self
                        .aux_homers
                        .get(name)
                        .ok_or_else(|| DispatchError::UnknownAuxAxis(name.to_string()))?;
                    let rail = aux.rail.clone();
                    let policy = aux.policy;
                    extruder_home::home_extruder(toolhead, rail, policy)?;
                    Ok(None)
                }
                _ => {
                    trace!(command = %command, "ignoring unhandled extended command");
                    Ok(None)
                }
            },
        }
    }
}
