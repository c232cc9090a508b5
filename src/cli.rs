use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::AppConfig;
use crate::error::Result;
use crate::exchange::parse_exchange_kind;

#[derive(Parser)]
#[command(name = "posguard")]
#[command(version = "0.1.0")]
#[command(about = "Position reconciliation and shutdown liquidation for exchange bots", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config directory (default.toml, <POSGUARD_ENV>.toml)
    #[arg(short, long, default_value = "config", env = "POSGUARD_CONFIG_DIR")]
    pub config_dir: PathBuf,

    /// Override venue.exchange (bitflyer|gmo)
    #[arg(long)]
    pub exchange: Option<String>,

    /// Override venue.instrument
    #[arg(long)]
    pub instrument: Option<String>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commands {
    /// Track the position until Ctrl-C / SIGTERM, then liquidate
    Run,
    /// Cancel everything and flatten the position once
    Flatten,
    /// Print the REST position
    Position,
}

impl Cli {
    /// Apply command-line overrides on top of the loaded configuration
    pub fn apply_overrides(&self, config: &mut AppConfig) -> Result<()> {
        if let Some(exchange) = &self.exchange {
            config.venue.exchange = parse_exchange_kind(exchange)?;
        }
        if let Some(instrument) = &self.instrument {
            config.venue.instrument = instrument.clone();
        }
        Ok(())
    }
}
