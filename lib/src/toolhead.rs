//! Print-time coordination for the toolhead.
//!
//! Tracks the planner's `print_time` against the MCU's estimated clock,
//! batches planned trapezoids into the step-generation queue, and keeps the
//! stream inside the buffering watermarks: far enough ahead that the MCU
//! never starves, close enough that aborts stay cheap.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use glam::{DVec4 as Vec4, Vec4Swizzles};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::extruder::Extruder;
use crate::homing::{HomingToolhead, Rail};
use crate::kinematics::Kinematics;
use crate::mcu::McuClock;
use crate::planner::{Move, MoveError, MoveQueue, PlannerLimits};
use crate::reactor::{self, Completion, Reactor, TimerHandle};
use crate::trapq::{TrapQueue, NEVER_TIME};

/// Minimum scheduling lead given to freshly-resynced kinematic activity.
const MIN_KIN_TIME: f64 = 0.100;
/// Step generation advances in batches of this much print time.
const MOVE_BATCH_TIME: f64 = 0.500;
/// Step+dir+step filter window in the step compressor.
const SDS_CHECK_TIME: f64 = 0.001;

const DRIP_SEGMENT_TIME: f64 = 0.050;
const DRIP_TIME: f64 = 0.100;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config option '{option}' {problem}")]
    Invalid {
        option: &'static str,
        problem: &'static str,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolheadConfig {
    pub limits: PlannerLimits,
    pub buffer_time_low: f64,
    pub buffer_time_high: f64,
    pub buffer_time_start: f64,
    pub move_flush_time: f64,
    pub kinematics: String,
}

impl Default for ToolheadConfig {
    fn default() -> Self {
        ToolheadConfig {
            limits: PlannerLimits::default(),
            buffer_time_low: 1.000,
            buffer_time_high: 2.000,
            buffer_time_start: 0.250,
            move_flush_time: 0.050,
            kinematics: "cartesian".to_string(),
        }
    }
}

impl ToolheadConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let above_zero: [(&'static str, f64); 6] = [
            ("max_velocity", self.limits.max_velocity),
            ("max_accel", self.limits.max_accel),
            ("buffer_time_low", self.buffer_time_low),
            ("buffer_time_high", self.buffer_time_high),
            ("buffer_time_start", self.buffer_time_start),
            ("move_flush_time", self.move_flush_time),
        ];
        for (option, value) in above_zero {
            if value <= 0.0 {
                return Err(ConfigError::Invalid {
                    option,
                    problem: "must be above 0",
                });
            }
        }
        if let Some(v) = self.limits.requested_accel_to_decel {
            if v <= 0.0 {
                return Err(ConfigError::Invalid {
                    option: "max_accel_to_decel",
                    problem: "must be above 0",
                });
            }
        }
        if self.limits.square_corner_velocity < 0.0 {
            return Err(ConfigError::Invalid {
                option: "square_corner_velocity",
                problem: "must not be negative",
            });
        }
        if self.buffer_time_high <= self.buffer_time_low {
            return Err(ConfigError::Invalid {
                option: "buffer_time_high",
                problem: "must be above buffer_time_low",
            });
        }
        Ok(())
    }
}

/// Queuing states. `Main` is steady streaming; everything else pauses or
/// reshapes the flush pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuingState {
    Main,
    Flushed,
    Priming,
    Drip,
}

/// Outcome of the drip-mode pump loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DripState {
    Active,
    Cancelled,
}

#[derive(Debug, Clone)]
pub enum ToolheadEvent {
    SetPosition { position: Vec4 },
    ManualMove,
    SyncPrintTime {
        curtime: f64,
        est_print_time: f64,
        print_time: f64,
    },
    Shutdown,
}

type EventHandler = Box<dyn FnMut(&ToolheadEvent)>;
type StepGenerator = Box<dyn FnMut(f64)>;

pub struct ToolHead {
    reactor: Reactor,
    mcus: Vec<Rc<RefCell<dyn McuClock>>>,
    can_pause: bool,
    move_queue: MoveQueue,
    commanded_pos: Vec4,
    limits: PlannerLimits,
    config: ToolheadConfig,
    print_time: f64,
    special_queuing_state: QueuingState,
    need_check_stall: f64,
    flush_timer: TimerHandle,
    idle_flush_print_time: f64,
    print_stall: u64,
    drip_completion: Option<Completion>,
    kin_flush_delay: f64,
    kin_flush_times: Vec<f64>,
    last_kin_flush_time: f64,
    last_kin_move_time: f64,
    trapq: Rc<RefCell<TrapQueue>>,
    step_generators: Vec<StepGenerator>,
    kin: Box<dyn Kinematics>,
    extruder: Box<dyn Extruder>,
    event_handlers: Vec<EventHandler>,
    is_shutdown: bool,
}

impl ToolHead {
    pub fn new(
        config: ToolheadConfig,
        reactor: Reactor,
        mcus: Vec<Rc<RefCell<dyn McuClock>>>,
        kin: Box<dyn Kinematics>,
        extruder: Box<dyn Extruder>,
    ) -> Result<ToolHead, ConfigError> {
        config.validate()?;
        if mcus.is_empty() {
            return Err(ConfigError::Invalid {
                option: "mcu",
                problem: "requires at least one mcu",
            });
        }
        let can_pause = !mcus[0].borrow().is_fileoutput();
        let mut limits = config.limits.clone();
        limits.recalculate();
        let flush_timer = reactor.register_timer();
        let mut move_queue = MoveQueue::new();
        move_queue.set_flush_time(config.buffer_time_high);
        Ok(ToolHead {
            reactor,
            mcus,
            can_pause,
            move_queue,
            commanded_pos: Vec4::ZERO,
            limits,
            config,
            print_time: 0.0,
            special_queuing_state: QueuingState::Flushed,
            need_check_stall: -1.0,
            flush_timer,
            idle_flush_print_time: 0.0,
            print_stall: 0,
            drip_completion: None,
            kin_flush_delay: SDS_CHECK_TIME,
            kin_flush_times: Vec::new(),
            last_kin_flush_time: 0.0,
            last_kin_move_time: 0.0,
            trapq: Rc::new(RefCell::new(TrapQueue::new())),
            step_generators: Vec::new(),
            kin,
            extruder,
            event_handlers: Vec::new(),
            is_shutdown: false,
        })
    }

    fn primary_mcu(&self) -> &Rc<RefCell<dyn McuClock>> {
        &self.mcus[0]
    }

    fn emit(&mut self, event: ToolheadEvent) {
        for handler in &mut self.event_handlers {
            handler(&event);
        }
    }

    pub fn register_event_handler(&mut self, handler: EventHandler) {
        self.event_handlers.push(handler);
    }

    // Print time tracking

    fn update_move_time(&mut self, next_print_time: f64) {
        let kin_flush_delay = self.kin_flush_delay;
        let lkft = self.last_kin_flush_time;
        loop {
            self.print_time = (self.print_time + MOVE_BATCH_TIME).min(next_print_time);
            let sg_flush_time = lkft.max(self.print_time - kin_flush_delay);
            for sg in &mut self.step_generators {
                sg(sg_flush_time);
            }
            let free_time = lkft.max(sg_flush_time - kin_flush_delay);
            self.trapq.borrow_mut().finalize_moves(free_time);
            self.extruder.update_move_time(free_time);
            let mcu_flush_time = lkft.max(sg_flush_time - self.config.move_flush_time);
            for mcu in &self.mcus {
                mcu.borrow_mut().flush_moves(mcu_flush_time);
            }
            if self.print_time >= next_print_time {
                break;
            }
        }
    }

    fn calc_print_time(&mut self) {
        let curtime = self.reactor.monotonic();
        let est_print_time = self.primary_mcu().borrow().estimated_print_time(curtime);
        let mut kin_time = (est_print_time + MIN_KIN_TIME).max(self.last_kin_flush_time);
        kin_time += self.kin_flush_delay;
        let min_print_time = (est_print_time + self.config.buffer_time_start).max(kin_time);
        if min_print_time > self.print_time {
            self.print_time = min_print_time;
            info!(
                curtime,
                est_print_time,
                print_time = self.print_time,
                "resynced print time"
            );
            self.emit(ToolheadEvent::SyncPrintTime {
                curtime,
                est_print_time,
                print_time: min_print_time,
            });
        }
    }

    fn process_moves(&mut self, moves: Vec<Move>) -> DripState {
        if self.special_queuing_state != QueuingState::Main {
            if self.special_queuing_state != QueuingState::Drip {
                // Transition from "Flushed"/"Priming" state to main state
                self.special_queuing_state = QueuingState::Main;
                self.need_check_stall = -1.0;
                self.reactor.update_timer(self.flush_timer, reactor::NOW);
            }
            self.calc_print_time();
        }
        let mut next_move_time = self.print_time;
        for mut m in moves {
            if m.is_kinematic_move {
                self.trapq.borrow_mut().append(
                    next_move_time,
                    m.accel_t,
                    m.cruise_t,
                    m.decel_t,
                    m.start_pos.xyz(),
                    m.axes_r.xyz(),
                    m.start_v,
                    m.cruise_v,
                    m.accel,
                );
            }
            if m.axes_d.w != 0.0 {
                self.extruder.queue_move(next_move_time, &m);
            }
            next_move_time += m.accel_t + m.cruise_t + m.decel_t;
            for callback in m.timing_callbacks.drain(..) {
                callback(next_move_time);
            }
        }
        if self.special_queuing_state == QueuingState::Drip {
            if self.update_drip_move_time(next_move_time) == DripState::Cancelled {
                return DripState::Cancelled;
            }
        }
        self.update_move_time(next_move_time);
        self.last_kin_move_time = next_move_time;
        DripState::Active
    }

    fn flush_queue(&mut self, lazy: bool) -> DripState {
        let moves = self.move_queue.flush(lazy);
        if moves.is_empty() {
            return DripState::Active;
        }
        self.process_moves(moves)
    }

    /// Commit all generated steps and park in the `Flushed` state.
    pub fn flush_step_generation(&mut self) {
        self.flush_queue(false);
        self.special_queuing_state = QueuingState::Flushed;
        self.need_check_stall = -1.0;
        self.reactor.update_timer(self.flush_timer, reactor::NEVER);
        self.move_queue.set_flush_time(self.config.buffer_time_high);
        self.idle_flush_print_time = 0.0;
        self.drip_completion = None;
        let mut flush_time = self.last_kin_move_time + self.kin_flush_delay;
        flush_time = flush_time.max(self.print_time - self.kin_flush_delay);
        self.last_kin_flush_time = self.last_kin_flush_time.max(flush_time);
        self.update_move_time(self.print_time.max(self.last_kin_flush_time));
    }

    fn flush_lookahead(&mut self) {
        if self.special_queuing_state != QueuingState::Main {
            self.flush_step_generation();
        } else {
            self.flush_queue(false);
        }
    }

    pub fn get_last_move_time(&mut self) -> f64 {
        self.flush_lookahead();
        if self.special_queuing_state != QueuingState::Main {
            self.calc_print_time();
        }
        self.print_time
    }

    fn check_stall(&mut self) {
        let mut eventtime = self.reactor.monotonic();
        if self.special_queuing_state != QueuingState::Main {
            if self.idle_flush_print_time != 0.0 {
                // Was in "Flushed" state and got there from idle input
                let est_print_time =
                    self.primary_mcu().borrow().estimated_print_time(eventtime);
                if est_print_time < self.idle_flush_print_time {
                    self.print_stall += 1;
                    warn!(stalls = self.print_stall, "print stall detected");
                }
                self.idle_flush_print_time = 0.0;
            }
            // Transition from "Flushed"/"Priming" state to "Priming" state
            self.special_queuing_state = QueuingState::Priming;
            self.need_check_stall = -1.0;
            self.reactor.update_timer(self.flush_timer, eventtime + 0.100);
        }
        // Suspend the producer while the buffer sits above the high mark
        let mut est_print_time;
        loop {
            est_print_time = self.primary_mcu().borrow().estimated_print_time(eventtime);
            let buffer_time = self.print_time - est_print_time;
            let stall_time = buffer_time - self.config.buffer_time_high;
            if stall_time <= 0.0 {
                break;
            }
            if !self.can_pause {
                self.need_check_stall = reactor::NEVER;
                return;
            }
            eventtime = self.reactor.pause(eventtime + stall_time.min(1.0));
        }
        if self.special_queuing_state == QueuingState::Main {
            // In main state - defer stall checking until needed
            self.need_check_stall =
                est_print_time + self.config.buffer_time_high + 0.100;
        }
    }

    /// Periodic flush handler; the host loop runs this when the registered
    /// flush timer comes due and re-arms the timer with the returned
    /// waketime.
    pub fn flush_tick(&mut self, eventtime: f64) -> f64 {
        if self.is_shutdown {
            return reactor::NEVER;
        }
        let print_time = self.print_time;
        let buffer_time =
            print_time - self.primary_mcu().borrow().estimated_print_time(eventtime);
        if buffer_time > self.config.buffer_time_low {
            // Running normally - reschedule check
            return eventtime + buffer_time - self.config.buffer_time_low;
        }
        // Under ran low buffer mark - flush lookahead queue
        self.flush_step_generation();
        if print_time != self.print_time {
            self.idle_flush_print_time = self.print_time;
        }
        reactor::NEVER
    }

    /// Run the flush timer if it has come due; models the reactor
    /// dispatching timers while this loop owns the thread.
    fn run_due_flush_timer(&mut self, eventtime: f64) {
        if self.reactor.timer_waketime(self.flush_timer) <= eventtime {
            self.reactor.update_timer(self.flush_timer, reactor::NEVER);
            let waketime = self.flush_tick(eventtime);
            self.reactor.update_timer(self.flush_timer, waketime);
        }
    }

    // Movement commands

    pub fn get_position(&self) -> Vec4 {
        self.commanded_pos
    }

    pub fn set_position(&mut self, newpos: Vec4, homing_axes: &[usize]) {
        self.flush_step_generation();
        self.trapq
            .borrow_mut()
            .set_position(self.print_time, newpos.xyz());
        self.commanded_pos = newpos;
        self.kin.set_position(newpos, homing_axes);
        debug!(?newpos, "set position");
        self.emit(ToolheadEvent::SetPosition { position: newpos });
    }

    /// Queue a move to `newpos`. Validation happens before anything is
    /// mutated, so a rejected move leaves the planner untouched.
    pub fn move_to(&mut self, newpos: Vec4, speed: f64) -> Result<(), MoveError> {
        if self.is_shutdown {
            return Err(MoveError::Shutdown);
        }
        let mut m = Move::new(&self.limits, self.commanded_pos, newpos, speed);
        if m.move_d == 0.0 {
            return Ok(());
        }
        if m.is_kinematic_move {
            self.kin.check_move(&mut m)?;
        }
        if m.axes_d.w != 0.0 {
            self.extruder.check_move(&mut m)?;
        }
        self.commanded_pos = m.end_pos;
        if self.move_queue.add_move(m, &*self.extruder) {
            self.flush_queue(true);
        }
        if self.print_time > self.need_check_stall {
            self.check_stall();
        }
        Ok(())
    }

    /// Like `move_to`, but unspecified coordinates carry over from the last
    /// commanded position.
    pub fn manual_move(
        &mut self,
        coord: [Option<f64>; 4],
        speed: f64,
    ) -> Result<(), MoveError> {
        let mut curpos = self.commanded_pos;
        for (axis, value) in coord.iter().enumerate() {
            if let Some(v) = value {
                curpos.as_mut()[axis] = *v;
            }
        }
        self.move_to(curpos, speed)?;
        self.emit(ToolheadEvent::ManualMove);
        Ok(())
    }

    pub fn dwell(&mut self, delay: f64) {
        let next_print_time = self.get_last_move_time() + delay.max(0.0);
        self.update_move_time(next_print_time);
        self.check_stall();
    }

    /// Block until all queued motion has executed on the MCU.
    pub fn wait_moves(&mut self) {
        self.flush_lookahead();
        let mut eventtime = self.reactor.monotonic();
        loop {
            self.run_due_flush_timer(eventtime);
            let est = self.primary_mcu().borrow().estimated_print_time(eventtime);
            if self.special_queuing_state != QueuingState::Main && self.print_time < est {
                break;
            }
            if !self.can_pause {
                break;
            }
            eventtime = self.reactor.pause(eventtime + 0.100);
        }
    }

    pub fn set_extruder(&mut self, extruder: Box<dyn Extruder>, extrude_pos: f64) {
        self.extruder = extruder;
        self.commanded_pos.w = extrude_pos;
    }

    pub fn extruder(&self) -> &dyn Extruder {
        &*self.extruder
    }

    // Homing "drip move" handling

    fn update_drip_move_time(&mut self, next_print_time: f64) -> DripState {
        let completion = match &self.drip_completion {
            Some(completion) => completion.clone(),
            None => return DripState::Active,
        };
        let flush_delay = DRIP_TIME + self.config.move_flush_time + self.kin_flush_delay;
        while self.print_time < next_print_time {
            if completion.test() {
                return DripState::Cancelled;
            }
            let curtime = self.reactor.monotonic();
            let est_print_time = self.primary_mcu().borrow().estimated_print_time(curtime);
            let wait_time = self.print_time - est_print_time - flush_delay;
            if wait_time > 0.0 && self.can_pause {
                // Pause before sending more steps
                completion.wait(&self.reactor, curtime + wait_time);
                continue;
            }
            let npt = (self.print_time + DRIP_SEGMENT_TIME).min(next_print_time);
            self.update_move_time(npt);
        }
        DripState::Active
    }

    /// Issue a move with the MCU buffer held shallow, so `completion` firing
    /// can abort it with little queued motion left to discard.
    pub fn drip_move(
        &mut self,
        newpos: Vec4,
        speed: f64,
        completion: &Completion,
    ) -> Result<(), MoveError> {
        if self.is_shutdown {
            return Err(MoveError::Shutdown);
        }
        self.dwell(self.kin_flush_delay);
        // Transition from "Flushed"/"Priming"/main state to "Drip" state
        self.flush_queue(false);
        self.special_queuing_state = QueuingState::Drip;
        self.need_check_stall = reactor::NEVER;
        self.reactor.update_timer(self.flush_timer, reactor::NEVER);
        self.move_queue.set_flush_time(self.config.buffer_time_high);
        self.idle_flush_print_time = 0.0;
        self.drip_completion = Some(completion.clone());
        debug!(?newpos, speed, "entering drip mode");
        // Submit move
        if let Err(e) = self.move_to(newpos, speed) {
            self.flush_step_generation();
            return Err(e);
        }
        // Transmit move in "drip" mode
        if self.flush_queue(false) == DripState::Cancelled {
            info!("drip move cancelled, discarding queued motion");
            self.move_queue.reset();
            self.trapq.borrow_mut().finalize_moves(NEVER_TIME);
            self.extruder.update_move_time(NEVER_TIME);
        }
        // Exit "Drip" state
        self.flush_step_generation();
        Ok(())
    }

    // Misc commands

    pub fn stats(&self, eventtime: f64) -> (bool, String) {
        for mcu in &self.mcus {
            mcu.borrow().check_active(self.print_time, eventtime);
        }
        let mut buffer_time =
            self.print_time - self.primary_mcu().borrow().estimated_print_time(eventtime);
        let is_active =
            buffer_time > -60.0 || self.special_queuing_state == QueuingState::Main;
        if self.special_queuing_state == QueuingState::Drip {
            buffer_time = 0.0;
        }
        (
            is_active,
            format!(
                "print_time={:.3} buffer_time={:.3} print_stall={}",
                self.print_time,
                buffer_time.max(0.0),
                self.print_stall
            ),
        )
    }

    pub fn check_busy(&self, eventtime: f64) -> (f64, f64, bool) {
        let est_print_time = self.primary_mcu().borrow().estimated_print_time(eventtime);
        (est_print_time, self.print_time, self.move_queue.is_empty())
    }

    pub fn get_status(&self, eventtime: f64) -> serde_json::Value {
        let est_print_time = self.primary_mcu().borrow().estimated_print_time(eventtime);
        let mut status = self.kin.get_status(eventtime);
        let overlay = json!({
            "print_time": self.print_time,
            "stalls": self.print_stall,
            "estimated_print_time": est_print_time,
            "extruder": self.extruder.name(),
            "position": [
                self.commanded_pos.x,
                self.commanded_pos.y,
                self.commanded_pos.z,
                self.commanded_pos.w,
            ],
            "max_velocity": self.limits.max_velocity,
            "max_accel": self.limits.max_accel,
            "max_accel_to_decel": self.limits.accel_to_decel(),
            "square_corner_velocity": self.limits.square_corner_velocity,
        });
        if let (Some(status), Some(overlay)) = (status.as_object_mut(), overlay.as_object())
        {
            for (key, value) in overlay {
                status.insert(key.clone(), value.clone());
            }
        }
        status
    }

    /// Disable pausing and drop all queued motion; subsequent move requests
    /// are refused.
    pub fn handle_shutdown(&mut self) {
        warn!("toolhead shutdown requested");
        self.can_pause = false;
        self.move_queue.reset();
        self.is_shutdown = true;
        self.emit(ToolheadEvent::Shutdown);
    }

    pub fn get_trapq(&self) -> Rc<RefCell<TrapQueue>> {
        self.trapq.clone()
    }

    pub fn kinematics(&self) -> &dyn Kinematics {
        &*self.kin
    }

    pub fn kinematics_mut(&mut self) -> &mut dyn Kinematics {
        &mut *self.kin
    }

    pub fn register_step_generator(&mut self, handler: StepGenerator) {
        self.step_generators.push(handler);
    }

    /// Track the widest step-compression scan window of any registered
    /// generator; flushes trail `print_time` by at least this much.
    pub fn note_step_generation_scan_time(&mut self, delay: f64, old_delay: f64) {
        self.flush_step_generation();
        if old_delay != 0.0 {
            if let Some(at) = self.kin_flush_times.iter().position(|&d| d == old_delay) {
                self.kin_flush_times.remove(at);
            }
        }
        if delay != 0.0 {
            self.kin_flush_times.push(delay);
        }
        self.kin_flush_delay = self
            .kin_flush_times
            .iter()
            .copied()
            .fold(SDS_CHECK_TIME, f64::max);
    }

    /// Run `callback` with the end print time of the currently queued move,
    /// or immediately if the queue is empty.
    pub fn register_lookahead_callback(&mut self, callback: Box<dyn FnOnce(f64)>) {
        if self.move_queue.is_empty() {
            let print_time = self.get_last_move_time();
            callback(print_time);
            return;
        }
        if let Some(last) = self.move_queue.last_move_mut() {
            last.timing_callbacks.push(callback);
        }
    }

    pub fn note_kinematic_activity(&mut self, kin_time: f64) {
        self.last_kin_move_time = self.last_kin_move_time.max(kin_time);
    }

    pub fn get_max_velocity(&self) -> (f64, f64) {
        (self.limits.max_velocity, self.limits.max_accel)
    }

    /// Apply a SET_VELOCITY_LIMIT style update and return the resulting
    /// limits report.
    pub fn update_limits(
        &mut self,
        max_velocity: Option<f64>,
        max_accel: Option<f64>,
        square_corner_velocity: Option<f64>,
        accel_to_decel: Option<f64>,
    ) -> String {
        if let Some(v) = max_velocity {
            self.limits.max_velocity = v;
        }
        if let Some(v) = max_accel {
            self.limits.max_accel = v;
        }
        if let Some(v) = square_corner_velocity {
            self.limits.square_corner_velocity = v;
        }
        if let Some(v) = accel_to_decel {
            self.limits.requested_accel_to_decel = Some(v);
        }
        self.limits.recalculate();
        info!(report = %self.limits.report(), "velocity limits updated");
        self.limits.report()
    }

    pub fn set_max_accel(&mut self, accel: f64) {
        self.limits.set_max_accel(accel);
    }

    pub fn limits(&self) -> &PlannerLimits {
        &self.limits
    }

    pub fn print_time(&self) -> f64 {
        self.print_time
    }

    pub fn queuing_state(&self) -> QueuingState {
        self.special_queuing_state
    }

    pub fn print_stall_count(&self) -> u64 {
        self.print_stall
    }

    pub fn lookahead_depth(&self) -> usize {
        self.move_queue.len()
    }

    pub fn flush_timer(&self) -> TimerHandle {
        self.flush_timer
    }

    pub fn reactor(&self) -> &Reactor {
        &self.reactor
    }
}

impl HomingToolhead for ToolHead {
    fn flush_step_generation(&mut self) {
        ToolHead::flush_step_generation(self)
    }

    fn get_last_move_time(&mut self) -> f64 {
        ToolHead::get_last_move_time(self)
    }

    fn dwell(&mut self, delay: f64) {
        ToolHead::dwell(self, delay)
    }

    fn drip_move(
        &mut self,
        newpos: Vec4,
        speed: f64,
        completion: &Completion,
    ) -> Result<(), MoveError> {
        ToolHead::drip_move(self, newpos, speed, completion)
    }

    fn get_position(&self) -> Vec4 {
        ToolHead::get_position(self)
    }

    fn set_position(&mut self, newpos: Vec4, homing_axes: &[usize]) {
        ToolHead::set_position(self, newpos, homing_axes)
    }

    fn get_steppers(&self) -> Vec<Rc<RefCell<dyn Rail>>> {
        self.kin.get_steppers()
    }

    fn calc_position(&self, stepper_positions: &HashMap<String, f64>) -> glam::DVec3 {
        self.kin.calc_position(stepper_positions)
    }
}
