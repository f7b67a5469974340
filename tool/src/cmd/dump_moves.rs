use std::fs::File;
use std::io::BufReader;

use clap::Parser;

use lib_toolhead::extruder::{Extruder, PrinterExtruder};
use lib_toolhead::gcode::{GCodeOp, GCodeReader};
use lib_toolhead::glam::DVec4 as Vec4;
use lib_toolhead::planner::{Move, MoveQueue};

use crate::Opts;

/// Run only the lookahead planner over a G-code file and print every planned
/// trapezoid.
#[derive(Parser, Debug)]
pub struct DumpMovesCmd {
    /// G-code file, or `-` for stdin
    input: String,
}

impl DumpMovesCmd {
    pub fn run(&self, opts: &Opts) {
        let src: Box<dyn std::io::Read> = match self.input.as_str() {
            "-" => Box::new(std::io::stdin()),
            filename => Box::new(File::open(filename).expect("opening gcode file failed")),
        };
        let rdr = GCodeReader::new(BufReader::new(src));

        let config = opts.host_config();
        let mut limits = config.toolhead.limits.clone();
        limits.recalculate();
        let extruder = PrinterExtruder::new("extruder", config.extruder.clone());
        let mut queue = MoveQueue::new();

        let mut pos = Vec4::ZERO;
        let mut speed = 25.0;
        let mut index = 0usize;
        let dump = |moves: Vec<Move>, index: &mut usize| {
            for m in moves {
                println!(
                    "{:5} d={:8.3} t={:7.4} v={:8.3} / {:8.3} / {:8.3} accel={:9.1}{}",
                    index,
                    m.move_d,
                    m.total_time(),
                    m.start_v,
                    m.cruise_v,
                    m.end_v,
                    m.accel,
                    if m.is_kinematic_move { "" } else { " [E]" },
                );
                *index += 1;
            }
        };

        for cmd in rdr {
            let cmd = cmd.expect("gcode read");
            if let GCodeOp::Move { x, y, z, e, f } = cmd.op {
                if let Some(f) = f {
                    if f > 0.0 {
                        speed = f / 60.0;
                    }
                }
                let target = Vec4::new(
                    x.unwrap_or(pos.x),
                    y.unwrap_or(pos.y),
                    z.unwrap_or(pos.z),
                    pos.w + e.unwrap_or(0.0),
                );
                let mut m = Move::new(&limits, pos, target, speed);
                if m.move_d == 0.0 {
                    continue;
                }
                if m.axes_d.w != 0.0 && extruder.check_move(&mut m).is_err() {
                    continue;
                }
                pos = m.end_pos;
                if queue.add_move(m, &extruder) {
                    let moves = queue.flush(true);
                    dump(moves, &mut index);
                }
            }
        }
        let moves = queue.flush(false);
        dump(moves, &mut index);
        println!("total: {} moves", index);
    }
}
