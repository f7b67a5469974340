//! Microcontroller clock contract.
//!
//! The planner only ever reads the estimated print time and pushes flush
//! horizons; clock recovery itself lives with the transport. `SimulatedMcu`
//! stands in for a synchronised MCU during tests and offline runs.

use tracing::{debug, warn};

/// Clock-side view of one microcontroller.
pub trait McuClock {
    /// Estimated MCU print time corresponding to the host `eventtime`.
    fn estimated_print_time(&self, eventtime: f64) -> f64;

    /// Transmit any compressed step schedules up to `mcu_flush_time`.
    fn flush_moves(&mut self, mcu_flush_time: f64);

    /// Whether output goes to a file instead of real hardware. File output
    /// never blocks, so the planner must not pause on buffer depth.
    fn is_fileoutput(&self) -> bool {
        false
    }

    /// Connection liveness probe used by periodic stats.
    fn check_active(&self, print_time: f64, eventtime: f64) -> bool;
}

/// An MCU whose clock tracks reactor time with a fixed offset and rate.
#[derive(Debug)]
pub struct SimulatedMcu {
    name: String,
    clock_offset: f64,
    clock_rate: f64,
    fileoutput: bool,
    last_flush_time: f64,
    flush_count: u64,
}

impl SimulatedMcu {
    pub fn new(name: &str) -> SimulatedMcu {
        SimulatedMcu {
            name: name.to_string(),
            clock_offset: 0.0,
            clock_rate: 1.0,
            fileoutput: false,
            last_flush_time: 0.0,
            flush_count: 0,
        }
    }

    /// MCU clock starts `offset` seconds behind the reactor clock.
    pub fn with_offset(mut self, offset: f64) -> SimulatedMcu {
        self.clock_offset = offset;
        self
    }

    pub fn fileoutput(mut self) -> SimulatedMcu {
        self.fileoutput = true;
        self
    }

    pub fn last_flush_time(&self) -> f64 {
        self.last_flush_time
    }

    pub fn flush_count(&self) -> u64 {
        self.flush_count
    }
}

impl McuClock for SimulatedMcu {
    fn estimated_print_time(&self, eventtime: f64) -> f64 {
        (eventtime - self.clock_offset) * self.clock_rate
    }

    fn flush_moves(&mut self, mcu_flush_time: f64) {
        if mcu_flush_time < self.last_flush_time {
            warn!(
                mcu = %self.name,
                mcu_flush_time,
                last = self.last_flush_time,
                "flush horizon moved backwards"
            );
            return;
        }
        if mcu_flush_time > self.last_flush_time {
            debug!(mcu = %self.name, mcu_flush_time, "flushing step schedules");
            self.last_flush_time = mcu_flush_time;
            self.flush_count += 1;
        }
    }

    fn is_fileoutput(&self) -> bool {
        self.fileoutput
    }

    fn check_active(&self, print_time: f64, eventtime: f64) -> bool {
        // A simulated link never drops; report inactive only if the clock
        // estimate has run ahead of the planned stream by a wide margin.
        self.estimated_print_time(eventtime) - print_time < 60.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn estimate_tracks_offset() {
        let mcu = SimulatedMcu::new("mcu").with_offset(0.5);
        assert_eq!(mcu.estimated_print_time(0.5), 0.0);
        assert_eq!(mcu.estimated_print_time(2.5), 2.0);
    }

    #[test]
    fn flush_horizon_is_monotonic() {
        let mut mcu = SimulatedMcu::new("mcu");
        mcu.flush_moves(1.0);
        mcu.flush_moves(0.5);
        assert_eq!(mcu.last_flush_time(), 1.0);
        assert_eq!(mcu.flush_count(), 1);
    }
}
