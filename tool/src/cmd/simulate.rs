use std::fs::File;
use std::io::BufReader;

use clap::Parser;

use lib_toolhead::commands::CommandDispatch;
use lib_toolhead::gcode::GCodeReader;
use lib_toolhead::glam::DVec4 as Vec4;
use lib_toolhead::reactor::Reactor;

use crate::Opts;

fn format_time(mut seconds: f64) -> String {
    let mut parts = Vec::new();
    if seconds > 86400.0 {
        parts.push(format!("{}d", (seconds / 86400.0).floor()));
        seconds %= 86400.0;
    }
    if seconds > 3600.0 {
        parts.push(format!("{}h", (seconds / 3600.0).floor()));
        seconds %= 3600.0;
    }
    if seconds > 60.0 {
        parts.push(format!("{}m", (seconds / 60.0).floor()));
        seconds %= 60.0;
    }
    if seconds > 0.0 {
        parts.push(format!("{:.3}s", seconds));
    }
    if parts.is_empty() {
        return "0s".into();
    }
    parts.join("")
}

/// Stream a G-code file through a fully wired toolhead against a simulated
/// MCU clock, reporting how the pipeline behaved.
#[derive(Parser, Debug)]
pub struct SimulateCmd {
    /// G-code file, or `-` for stdin
    input: String,
    /// Print command responses (SET_VELOCITY_LIMIT reports etc.)
    #[clap(long = "show_responses")]
    show_responses: bool,
}

impl SimulateCmd {
    pub fn run(&self, opts: &Opts) {
        let src: Box<dyn std::io::Read> = match self.input.as_str() {
            "-" => Box::new(std::io::stdin()),
            filename => Box::new(File::open(filename).expect("opening gcode file failed")),
        };
        let rdr = GCodeReader::new(BufReader::new(src));

        let reactor = Reactor::new_manual();
        let mut toolhead = opts
            .make_toolhead(&reactor)
            .expect("building toolhead failed");
        // A real host homes before printing; the simulation starts homed at
        // the origin.
        toolhead.set_position(Vec4::ZERO, &[0, 1, 2]);
        let mut dispatch = CommandDispatch::new();

        let sync_start = toolhead.get_last_move_time();
        let mut commands = 0u64;
        let mut errors = 0u64;
        for cmd in rdr {
            let cmd = cmd.expect("gcode read");
            commands += 1;
            match dispatch.execute(&mut toolhead, &cmd) {
                Ok(Some(response)) => {
                    if self.show_responses {
                        println!("// {}", response.replace('\n', "\n// "));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    errors += 1;
                    eprintln!("!! command {} rejected: {}", commands, e);
                }
            }
        }
        toolhead.wait_moves();

        let eventtime = reactor.monotonic();
        let (_, stats) = toolhead.stats(eventtime);
        let total = toolhead.print_time() - sync_start;
        println!("Simulation:");
        println!("  Commands:        {}", commands);
        println!("  Rejected:        {}", errors);
        println!("  Print time:      {} ({:.3}s)", format_time(total), total);
        println!("  Host wall time:  {}", format_time(eventtime));
        println!("  Stalls:          {}", toolhead.print_stall_count());
        println!("  Final position:  {:?}", toolhead.get_position());
        println!("  Stats:           {}", stats);
        let status = toolhead.get_status(eventtime);
        println!(
            "  Status:          {}",
            serde_json::to_string(&status).unwrap_or_default()
        );
    }
}
