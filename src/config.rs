//! Configuration management for postwatch
//!
//! This module defines the main `Config` struct, responsible for holding all
//! application settings. It uses the `figment` crate to layer defaults, a
//! `postwatch.toml` file, environment variables, and command-line arguments.

use anyhow::Result;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::cli::Cli;

/// The main configuration struct for the application.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    /// The logging level for the application.
    pub log_level: String,
    /// Log every line that could not be classified, verbatim.
    #[serde(default)]
    pub log_unsupported: bool,
    /// Address the metrics endpoint listens on.
    pub listen_address: SocketAddr,
    /// Path under which metrics are exposed.
    pub telemetry_path: String,
    /// Base directory containing one spool directory per Postfix instance.
    pub spool_directory: PathBuf,
    /// The Postfix instances to monitor.
    #[serde(default)]
    pub instances: Vec<InstanceConfig>,
}

/// One monitored Postfix instance.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct InstanceConfig {
    /// Instance name; also the syslog process token (`postfix`,
    /// `postfix-out`, ...) and the spool subdirectory name.
    pub name: String,
    /// Log file to tail. Without it the instance is queue-metrics only.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

impl Config {
    /// Loads the application configuration by layering sources: defaults,
    /// file, environment, and CLI arguments.
    pub fn load(cli: &Cli) -> Result<Self> {
        let config_path = cli
            .config
            .clone()
            .unwrap_or_else(|| PathBuf::from("postwatch.toml"));

        let mut config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_path))
            // Allow overriding with environment variables, e.g.
            // POSTWATCH_LOG_LEVEL=debug
            .merge(Env::prefixed("POSTWATCH_"))
            .merge(cli.clone())
            .extract()?;

        // `--instance` replaces the configured instance list wholesale; a
        // nested list is awkward to express through the figment provider, so
        // the override happens here.
        if !cli.instances.is_empty() {
            config.instances = cli
                .instances
                .iter()
                .map(|entry| match entry.split_once(':') {
                    Some((name, log_path)) => InstanceConfig {
                        name: name.to_string(),
                        log_path: Some(PathBuf::from(log_path)),
                    },
                    None => InstanceConfig {
                        name: entry.clone(),
                        log_path: None,
                    },
                })
                .collect();
        }

        Ok(config)
    }
}

// Provide a default implementation for tests and easy setup.
impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_unsupported: false,
            listen_address: "0.0.0.0:9154".parse().expect("default listen address"),
            telemetry_path: "/metrics".to_string(),
            spool_directory: PathBuf::from("/var/spool"),
            instances: vec![InstanceConfig {
                name: "postfix".to_string(),
                log_path: None,
            }],
        }
    }
}
