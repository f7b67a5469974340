pub mod dump_config;
pub mod dump_moves;
pub mod simulate;
