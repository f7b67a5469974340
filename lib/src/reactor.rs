//! Cooperative event loop services: a monotonic clock, explicit suspension,
//! poll-style timers, and completion handles.
//!
//! All planner mutation happens on one loop, so none of this is thread-safe
//! by design. The clock comes in two flavours: `Monotonic` for a live host
//! and `Manual` for deterministic simulation, where `pause` advances virtual
//! time instead of sleeping. Simulated external events (endstop triggers)
//! are modelled by scheduling a completion to fire at a clock time.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::{Duration, Instant};

use tracing::trace;

/// Timer waketime meaning "run on the next dispatch".
pub const NOW: f64 = 0.0;
/// Timer waketime meaning "disabled".
pub const NEVER: f64 = crate::trapq::NEVER_TIME;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle(usize);

#[derive(Debug)]
enum ClockSource {
    Monotonic(Instant),
    Manual(Cell<f64>),
}

#[derive(Debug)]
struct ReactorState {
    timers: RefCell<Vec<f64>>,
    scheduled: RefCell<Vec<(f64, Completion)>>,
}

/// Shared handle to the event loop. Cloning hands out another reference to
/// the same loop state.
#[derive(Clone)]
pub struct Reactor {
    clock: Rc<ClockSource>,
    state: Rc<ReactorState>,
}

impl Reactor {
    /// Reactor backed by the host monotonic clock; `pause` really sleeps.
    pub fn new() -> Reactor {
        Self::with_clock(ClockSource::Monotonic(Instant::now()))
    }

    /// Reactor backed by a virtual clock; `pause` advances it.
    pub fn new_manual() -> Reactor {
        Self::with_clock(ClockSource::Manual(Cell::new(0.0)))
    }

    fn with_clock(clock: ClockSource) -> Reactor {
        Reactor {
            clock: Rc::new(clock),
            state: Rc::new(ReactorState {
                timers: RefCell::new(Vec::new()),
                scheduled: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn monotonic(&self) -> f64 {
        match &*self.clock {
            ClockSource::Monotonic(start) => start.elapsed().as_secs_f64(),
            ClockSource::Manual(now) => now.get(),
        }
    }

    /// Suspend until `waketime`. Returns the eventtime on resume. Scheduled
    /// completions that come due during the pause fire before returning.
    pub fn pause(&self, waketime: f64) -> f64 {
        match &*self.clock {
            ClockSource::Monotonic(start) => {
                let now = start.elapsed().as_secs_f64();
                if waketime > now && waketime < NEVER {
                    std::thread::sleep(Duration::from_secs_f64(waketime - now));
                }
            }
            ClockSource::Manual(now) => {
                let target = self.next_scheduled_before(waketime);
                if target > now.get() {
                    now.set(target);
                }
            }
        }
        let eventtime = self.monotonic();
        self.fire_scheduled(eventtime);
        eventtime
    }

    /// Advance a manual clock without a suspension point. No-op on a
    /// monotonic reactor.
    pub fn advance(&self, eventtime: f64) {
        if let ClockSource::Manual(now) = &*self.clock {
            if eventtime > now.get() {
                now.set(eventtime);
            }
        }
        self.fire_scheduled(self.monotonic());
    }

    pub fn register_timer(&self) -> TimerHandle {
        let mut timers = self.state.timers.borrow_mut();
        timers.push(NEVER);
        TimerHandle(timers.len() - 1)
    }

    pub fn update_timer(&self, handle: TimerHandle, waketime: f64) {
        self.state.timers.borrow_mut()[handle.0] = waketime;
    }

    pub fn timer_waketime(&self, handle: TimerHandle) -> f64 {
        self.state.timers.borrow()[handle.0]
    }

    /// Pop the next due timer, if any. The timer is parked at `NEVER`; its
    /// owner runs the handler and re-arms it with `update_timer`.
    pub fn next_due_timer(&self, eventtime: f64) -> Option<TimerHandle> {
        let mut timers = self.state.timers.borrow_mut();
        for (idx, waketime) in timers.iter_mut().enumerate() {
            if *waketime <= eventtime {
                *waketime = NEVER;
                return Some(TimerHandle(idx));
            }
        }
        None
    }

    pub fn completion(&self) -> Completion {
        Completion {
            done: Rc::new(Cell::new(false)),
        }
    }

    /// Arrange for `completion` to fire once the clock reaches `at`. This is
    /// the simulation stand-in for an asynchronous trigger.
    pub fn schedule_completion(&self, completion: &Completion, at: f64) {
        self.state
            .scheduled
            .borrow_mut()
            .push((at, completion.clone()));
    }

    fn next_scheduled_before(&self, waketime: f64) -> f64 {
        let scheduled = self.state.scheduled.borrow();
        scheduled
            .iter()
            .map(|(at, _)| *at)
            .filter(|at| *at > self.monotonic())
            .fold(waketime, f64::min)
    }

    fn fire_scheduled(&self, eventtime: f64) {
        let mut scheduled = self.state.scheduled.borrow_mut();
        scheduled.retain(|(at, completion)| {
            if *at <= eventtime {
                trace!(at, "firing scheduled completion");
                completion.complete();
                false
            } else {
                true
            }
        });
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor")
            .field("monotonic", &self.monotonic())
            .finish()
    }
}

/// One-shot signalling handle. Cloning shares the underlying flag.
#[derive(Debug, Clone)]
pub struct Completion {
    done: Rc<Cell<bool>>,
}

impl Completion {
    pub fn test(&self) -> bool {
        self.done.get()
    }

    pub fn complete(&self) {
        self.done.set(true);
    }

    /// Suspend until the completion fires or `waketime` passes. Returns
    /// whether the completion has fired.
    pub fn wait(&self, reactor: &Reactor, waketime: f64) -> bool {
        if self.test() {
            return true;
        }
        reactor.pause(waketime);
        self.test()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_pause_advances() {
        let reactor = Reactor::new_manual();
        assert_eq!(reactor.monotonic(), 0.0);
        let t = reactor.pause(1.5);
        assert_eq!(t, 1.5);
        // pausing into the past does not rewind
        let t = reactor.pause(1.0);
        assert_eq!(t, 1.5);
    }

    #[test]
    fn timers_pop_once_until_rearmed() {
        let reactor = Reactor::new_manual();
        let h = reactor.register_timer();
        assert!(reactor.next_due_timer(10.0).is_none());
        reactor.update_timer(h, 2.0);
        assert!(reactor.next_due_timer(1.0).is_none());
        assert_eq!(reactor.next_due_timer(2.0), Some(h));
        // parked until re-armed
        assert!(reactor.next_due_timer(100.0).is_none());
        reactor.update_timer(h, NOW);
        assert_eq!(reactor.next_due_timer(0.0), Some(h));
    }

    #[test]
    fn scheduled_completion_fires_during_pause() {
        let reactor = Reactor::new_manual();
        let c = reactor.completion();
        reactor.schedule_completion(&c, 0.5);
        assert!(!c.test());
        // waiting past the trigger point stops at it
        assert!(c.wait(&reactor, 2.0));
        assert_eq!(reactor.monotonic(), 0.5);
    }

    #[test]
    fn wait_returns_false_on_timeout() {
        let reactor = Reactor::new_manual();
        let c = reactor.completion();
        assert!(!c.wait(&reactor, 0.25));
        assert_eq!(reactor.monotonic(), 0.25);
    }
}
