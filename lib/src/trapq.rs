//! Trapezoid velocity queue.
//!
//! Time-indexed store of constant-acceleration segments. Step generators pull
//! from the active window, anything older than the finalize horizon moves into
//! a bounded history used for position lookups after the fact.

use std::collections::VecDeque;

use glam::DVec3 as Vec3;

/// Horizon value meaning "forever"; used both as the tail sentinel time and
/// as the finalize horizon that drains the whole queue.
pub const NEVER_TIME: f64 = 9_999_999_999_999_999.0;

/// Longest gap bridged by a synthetic null segment.
const MAX_NULL_MOVE: f64 = 1.0;

/// How many expired segments the history retains.
const HISTORY_LIMIT: usize = 128;

/// One constant-acceleration segment of a trapezoid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrapSegment {
    pub print_time: f64,
    pub move_t: f64,
    pub start_v: f64,
    pub half_accel: f64,
    pub start_pos: Vec3,
    pub axes_r: Vec3,
}

impl Default for TrapSegment {
    fn default() -> Self {
        TrapSegment {
            print_time: 0.0,
            move_t: 0.0,
            start_v: 0.0,
            half_accel: 0.0,
            start_pos: Vec3::ZERO,
            axes_r: Vec3::ZERO,
        }
    }
}

impl TrapSegment {
    pub fn distance_at(&self, move_time: f64) -> f64 {
        (self.start_v + self.half_accel * move_time) * move_time
    }

    pub fn position_at(&self, move_time: f64) -> Vec3 {
        self.start_pos + self.axes_r * self.distance_at(move_time)
    }

    pub fn end_time(&self) -> f64 {
        self.print_time + self.move_t
    }

    fn is_null(&self) -> bool {
        self.start_v == 0.0 && self.half_accel == 0.0
    }
}

/// The trapezoid queue proper. Active segments are kept in time order between
/// two sentinels so gap handling never has to special-case the ends.
#[derive(Debug)]
pub struct TrapQueue {
    segments: VecDeque<TrapSegment>,
    history: VecDeque<TrapSegment>,
}

impl Default for TrapQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TrapQueue {
    pub fn new() -> Self {
        let mut segments = VecDeque::new();
        segments.push_back(TrapSegment {
            print_time: -1.0,
            ..TrapSegment::default()
        });
        segments.push_back(TrapSegment {
            print_time: NEVER_TIME,
            move_t: NEVER_TIME,
            ..TrapSegment::default()
        });
        TrapQueue {
            segments,
            history: VecDeque::new(),
        }
    }

    fn tail_index(&self) -> usize {
        self.segments.len() - 1
    }

    /// Queue a prepared segment, bridging any gap to the previous one with a
    /// null segment so position lookups stay continuous.
    pub fn add_segment(&mut self, seg: TrapSegment) {
        let prev = self.segments[self.tail_index() - 1];
        if prev.end_time() < seg.print_time {
            let mut null_seg = TrapSegment {
                start_pos: seg.start_pos,
                ..TrapSegment::default()
            };
            if prev.print_time <= 0.0 && seg.print_time > MAX_NULL_MOVE {
                null_seg.print_time = seg.print_time - MAX_NULL_MOVE;
            } else {
                null_seg.print_time = prev.end_time();
            }
            null_seg.move_t = seg.print_time - null_seg.print_time;
            let at = self.tail_index();
            self.segments.insert(at, null_seg);
        }
        let at = self.tail_index();
        self.segments.insert(at, seg);
        let tail_at = self.tail_index();
        let prev_end = self.segments[tail_at - 1].end_time();
        let prev_pos = {
            let p = self.segments[tail_at - 1];
            p.position_at(p.move_t)
        };
        let tail = &mut self.segments[tail_at];
        tail.print_time = prev_end;
        tail.move_t = 0.0;
        tail.start_pos = prev_pos;
    }

    /// Split one trapezoid into its accel/cruise/decel segments and queue
    /// them. Zero-duration phases are skipped.
    #[allow(clippy::too_many_arguments)]
    pub fn append(
        &mut self,
        print_time: f64,
        accel_t: f64,
        cruise_t: f64,
        decel_t: f64,
        start_pos: Vec3,
        axes_r: Vec3,
        start_v: f64,
        cruise_v: f64,
        accel: f64,
    ) {
        let mut cur_time = print_time;
        let mut cur_pos = start_pos;
        if accel_t > 0.0 {
            let seg = TrapSegment {
                print_time: cur_time,
                move_t: accel_t,
                start_v,
                half_accel: 0.5 * accel,
                start_pos: cur_pos,
                axes_r,
            };
            self.add_segment(seg);
            cur_time += accel_t;
            cur_pos = seg.position_at(accel_t);
        }
        if cruise_t > 0.0 {
            let seg = TrapSegment {
                print_time: cur_time,
                move_t: cruise_t,
                start_v: cruise_v,
                half_accel: 0.0,
                start_pos: cur_pos,
                axes_r,
            };
            self.add_segment(seg);
            cur_time += cruise_t;
            cur_pos = seg.position_at(cruise_t);
        }
        if decel_t > 0.0 {
            let seg = TrapSegment {
                print_time: cur_time,
                move_t: decel_t,
                start_v: cruise_v,
                half_accel: -0.5 * accel,
                start_pos: cur_pos,
                axes_r,
            };
            self.add_segment(seg);
        }
    }

    /// Expire segments that end at or before `free_time`, retiring them to
    /// history. Null segments are dropped outright.
    pub fn finalize_moves(&mut self, free_time: f64) {
        while self.segments.len() > 2 {
            let seg = self.segments[1];
            if seg.end_time() > free_time {
                break;
            }
            self.segments.remove(1);
            if !seg.is_null() {
                self.history.push_front(seg);
            }
        }
        if self.segments.len() == 2 {
            let at = self.tail_index();
            let tail = &mut self.segments[at];
            tail.print_time = NEVER_TIME;
            tail.move_t = NEVER_TIME;
        }
        while self.history.len() > HISTORY_LIMIT {
            self.history.pop_back();
        }
    }

    /// Note an externally-imposed position at `print_time`. Flushes all
    /// pending segments and records a marker in the history.
    pub fn set_position(&mut self, print_time: f64, pos: Vec3) {
        self.finalize_moves(NEVER_TIME);
        while let Some(first) = self.history.front_mut() {
            if first.print_time < print_time {
                if first.end_time() > print_time {
                    first.move_t = print_time - first.print_time;
                }
                break;
            }
            self.history.pop_front();
        }
        self.history.push_front(TrapSegment {
            print_time,
            start_pos: pos,
            ..TrapSegment::default()
        });
    }

    /// Position at `print_time`, consulting active segments first and then
    /// the history. Returns `None` before any known motion.
    pub fn position_at(&self, print_time: f64) -> Option<Vec3> {
        for seg in self.segments.range(1..self.tail_index()).rev() {
            if print_time >= seg.print_time {
                let t = (print_time - seg.print_time).min(seg.move_t);
                return Some(seg.position_at(t));
            }
        }
        for seg in self.history.iter() {
            if print_time >= seg.print_time {
                let t = (print_time - seg.print_time).min(seg.move_t);
                return Some(seg.position_at(t));
            }
        }
        None
    }

    /// Active segments, sentinels excluded.
    pub fn active(&self) -> impl Iterator<Item = &TrapSegment> {
        self.segments.range(1..self.segments.len() - 1)
    }

    pub fn active_len(&self) -> usize {
        self.segments.len().saturating_sub(2)
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_splits_phases() {
        let mut tq = TrapQueue::new();
        tq.append(
            0.0,
            1.0,
            2.0,
            1.0,
            Vec3::ZERO,
            Vec3::X,
            0.0,
            1.0,
            1.0,
        );
        // initial gap null + accel + cruise + decel
        assert_eq!(tq.active_len(), 4);
        // cruise picks up where accel left off: d = 0.5*1*1^2 = 0.5
        let segs: Vec<_> = tq.active().collect();
        assert!((segs[2].start_pos.x - 0.5).abs() < 1e-12);
        assert!((segs[3].start_pos.x - 2.5).abs() < 1e-12);
    }

    #[test]
    fn gap_gets_null_segment() {
        let mut tq = TrapQueue::new();
        tq.add_segment(TrapSegment {
            print_time: 0.0,
            move_t: 0.5,
            ..TrapSegment::default()
        });
        tq.add_segment(TrapSegment {
            print_time: 2.0,
            move_t: 0.5,
            ..TrapSegment::default()
        });
        // leading null + m1 + gap null + m2
        assert_eq!(tq.active_len(), 4);
    }

    #[test]
    fn finalize_retires_to_history() {
        let mut tq = TrapQueue::new();
        tq.append(0.0, 1.0, 0.0, 0.0, Vec3::ZERO, Vec3::X, 0.5, 0.0, 1.0);
        tq.finalize_moves(2.0);
        assert_eq!(tq.active_len(), 0);
        assert_eq!(tq.history_len(), 1);
    }

    #[test]
    fn finalize_never_drains_everything() {
        let mut tq = TrapQueue::new();
        tq.append(0.0, 0.1, 0.5, 0.1, Vec3::ZERO, Vec3::Y, 0.0, 10.0, 100.0);
        tq.finalize_moves(NEVER_TIME);
        assert_eq!(tq.active_len(), 0);
    }

    #[test]
    fn set_position_truncates_history() {
        let mut tq = TrapQueue::new();
        tq.append(0.0, 0.5, 0.0, 0.0, Vec3::ZERO, Vec3::X, 1.0, 0.0, 1.0);
        tq.finalize_moves(2.0);
        tq.set_position(0.25, Vec3::new(1.0, 2.0, 3.0));
        let marker = tq.history.front().unwrap();
        assert_eq!(marker.print_time, 0.25);
        assert_eq!(marker.start_pos, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn position_lookup_spans_active_and_history() {
        let mut tq = TrapQueue::new();
        // 1 mm/s cruise along X for 2 s starting at t=0
        tq.append(0.0, 0.0, 2.0, 0.0, Vec3::ZERO, Vec3::X, 1.0, 1.0, 0.0);
        let p = tq.position_at(1.0).unwrap();
        assert!((p.x - 1.0).abs() < 1e-12);
        tq.finalize_moves(5.0);
        let p = tq.position_at(1.5).unwrap();
        assert!((p.x - 1.5).abs() < 1e-12);
    }
}
