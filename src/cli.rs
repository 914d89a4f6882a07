use std::path::PathBuf;

use clap::Parser;
use procwatch::config::{CliOverrides, DEFAULT_CONFIG_PATH};

/// Options given here supersede those in the config file.
#[derive(Parser, Debug)]
#[command(version, about = "procwatch process watch daemon")]
pub struct Args {
    /// Put the program into the background
    #[arg(short = 'D', long)]
    pub daemonize: bool,

    /// Seconds between process checks
    #[arg(short = 't', long, value_name = "SECONDS")]
    pub time_lapse: Option<u64>,

    /// Send mail alerts to one or more comma-separated addresses
    #[arg(short = 'm', long, value_name = "CSV")]
    pub mail_addresses: Option<String>,

    /// Read configuration from FILE
    #[arg(short = 'c', long, value_name = "FILE", default_value = DEFAULT_CONFIG_PATH)]
    pub config_file: PathBuf,

    /// Validate the configuration, print the resolved applications and exit
    #[arg(long)]
    pub check_config: bool,

    /// More logging (-v debug, -vv trace). RUST_LOG wins if set.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Args {
    pub fn overrides(&self) -> CliOverrides {
        CliOverrides {
            daemonize: self.daemonize,
            time_lapse: self.time_lapse,
            mail_addresses: self.mail_addresses.clone(),
        }
    }

    pub fn log_level(&self) -> log::LevelFilter {
        match self.verbose {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}
