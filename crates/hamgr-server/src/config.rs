//! Configuration for the example server
//!
//! Values come from the file given on the command line, overridden by
//! `HAMGR__`-prefixed environment variables (`HAMGR__SERVICE__PORT=9090`).

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use config::{Config, Environment, File};
use hamgr_core::{ConsulConfig, HaManagerConfig, ServiceIdentity};
use serde::Deserialize;

pub const DEFAULT_CONFIG_PATH: &str = "conf/hamgr.yml";

/// Matches Consul's default session lock-delay
pub const DEFAULT_SHUTDOWN_GRACE_SECONDS: u64 = 15;

/// Command line arguments for the server
#[derive(Debug, Parser)]
#[command(name = "hamgr-server", version, about = "Example service behind the HA failover proxy")]
pub struct Cli {
    /// Configuration file, any format the config crate understands
    #[arg(short = 'f', long = "config", env = "HAMGR_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    pub config: String,
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AppConfig {
    pub service: ServiceIdentity,
    pub consul_config: ConsulConfig,
    pub ha_manager_config: HaManagerConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Step down after this many seconds; 0 waits for a signal
    #[serde(default)]
    pub release_delay_seconds: u64,
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
    #[serde(default)]
    pub log_dir: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_shutdown_grace_seconds() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_SECONDS
}

impl AppConfig {
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name(&cli.config))
            .add_source(
                Environment::with_prefix("HAMGR")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Some(ref level) = cli.log_level {
            builder = builder.set_override("log_level", level.as_str())?;
        }

        builder
            .build()
            .with_context(|| format!("fail to load configuration from {}", cli.config))?
            .try_deserialize()
            .context("invalid configuration")
    }

    pub fn release_delay(&self) -> Option<Duration> {
        (self.release_delay_seconds > 0).then(|| Duration::from_secs(self.release_delay_seconds))
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}
