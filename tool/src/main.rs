use std::cell::RefCell;
use std::rc::Rc;

use anyhow::Context;
use clap::Parser;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

use lib_toolhead::extruder::{ExtruderConfig, PrinterExtruder};
use lib_toolhead::kinematics::{CartesianConfig, CartesianKinematics};
use lib_toolhead::mcu::{McuClock, SimulatedMcu};
use lib_toolhead::reactor::Reactor;
use lib_toolhead::toolhead::{ToolHead, ToolheadConfig};

mod cmd;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub toolhead: ToolheadConfig,
    pub cartesian: CartesianConfig,
    pub extruder: ExtruderConfig,
}

#[derive(Parser, Debug)]
#[clap(version = env!("CARGO_PKG_VERSION"))]
pub struct Opts {
    /// Printer configuration in hjson format
    #[clap(long = "config_file")]
    config_filename: Option<String>,

    /// Override single config values, e.g. -c max_velocity=250
    #[clap(short = 'c')]
    config_override: Vec<String>,

    #[clap(subcommand)]
    cmd: SubCommand,

    #[clap(skip)]
    config: OnceCell<HostConfig>,
}

impl Opts {
    fn host_config(&self) -> &HostConfig {
        match self.config.get() {
            Some(config) => config,
            None => match self.load_config() {
                Ok(config) => {
                    let _ = self.config.set(config);
                    self.config.get().unwrap()
                }
                Err(e) => {
                    eprintln!("Failed to load printer configuration: {:#}", e);
                    std::process::exit(1);
                }
            },
        }
    }

    fn load_config(&self) -> anyhow::Result<HostConfig> {
        let mut config: HostConfig = match &self.config_filename {
            Some(filename) => {
                let text = std::fs::read_to_string(filename)
                    .with_context(|| format!("reading config file '{filename}'"))?;
                deser_hjson::from_str(&text)
                    .with_context(|| format!("parsing config file '{filename}'"))?
            }
            None => HostConfig::default(),
        };
        for entry in &self.config_override {
            let (key, value) = entry
                .split_once('=')
                .context("invalid config override, format key=value")?;
            apply_override(&mut config, key, value)
                .with_context(|| format!("failed to apply config override '{key}'"))?;
        }
        config.toolhead.limits.recalculate();
        config.toolhead.validate()?;
        Ok(config)
    }

    fn make_toolhead(&self, reactor: &Reactor) -> anyhow::Result<ToolHead> {
        let config = self.host_config();
        if config.toolhead.kinematics != "cartesian" {
            anyhow::bail!(
                "unsupported kinematics '{}' (only cartesian is available)",
                config.toolhead.kinematics
            );
        }
        let mcu: Rc<RefCell<dyn McuClock>> =
            Rc::new(RefCell::new(SimulatedMcu::new("mcu")));
        let kin = Box::new(CartesianKinematics::new(config.cartesian.clone()));
        let extruder = Box::new(PrinterExtruder::new("extruder", config.extruder.clone()));
        let toolhead = ToolHead::new(
            config.toolhead.clone(),
            reactor.clone(),
            vec![mcu],
            kin,
            extruder,
        )?;
        Ok(toolhead)
    }
}

fn apply_override(config: &mut HostConfig, key: &str, value: &str) -> anyhow::Result<()> {
    let limits = &mut config.toolhead.limits;
    match key {
        "max_velocity" => limits.max_velocity = value.parse()?,
        "max_accel" => limits.max_accel = value.parse()?,
        "max_accel_to_decel" => limits.requested_accel_to_decel = Some(value.parse()?),
        "square_corner_velocity" => limits.square_corner_velocity = value.parse()?,
        "instant_corner_velocity" => {
            config.extruder.instant_corner_velocity = value.parse()?
        }
        "buffer_time_low" => config.toolhead.buffer_time_low = value.parse()?,
        "buffer_time_high" => config.toolhead.buffer_time_high = value.parse()?,
        "buffer_time_start" => config.toolhead.buffer_time_start = value.parse()?,
        "move_flush_time" => config.toolhead.move_flush_time = value.parse()?,
        _ => anyhow::bail!("unknown config option '{key}'"),
    }
    Ok(())
}

#[derive(Parser, Debug)]
enum SubCommand {
    Simulate(cmd::simulate::SimulateCmd),
    DumpMoves(cmd::dump_moves::DumpMovesCmd),
    DumpConfig(cmd::dump_config::DumpConfigCmd),
}

impl SubCommand {
    fn run(&self, opts: &Opts) {
        match self {
            Self::Simulate(c) => c.run(opts),
            Self::DumpMoves(c) => c.run(opts),
            Self::DumpConfig(c) => c.run(opts),
        }
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let opts = Opts::parse();
    opts.cmd.run(&opts);
}
