use std::path::PathBuf;

use clap::{Parser, ValueHint};

use overlay_map::config::Mode;

/// Terminal map with dynamically loaded GeoJSON overlays
#[derive(Parser, Debug)]
#[command(name = "overlay-map", version, about)]
pub struct Cli {
    /// Overlay configuration (JSON); the built-in India layers when omitted
    #[arg(short, long, value_hint = ValueHint::FilePath)]
    pub config: Option<PathBuf>,

    /// Root directory for relative overlay locators
    #[arg(short, long, default_value = "data", value_hint = ValueHint::DirPath)]
    pub data_dir: PathBuf,

    /// Override the configured selection mode
    #[arg(short, long, value_enum)]
    pub mode: Option<Mode>,

    /// Log destination; the terminal belongs to the UI
    #[arg(long, default_value = "overlay-map.log", value_hint = ValueHint::FilePath)]
    pub log_file: PathBuf,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Log filter used when RUST_LOG is unset
    pub fn log_filter(&self) -> &'static str {
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}
