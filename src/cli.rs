//! Command-Line Interface (CLI) argument parsing.
//!
//! This module defines the command-line arguments for the application using
//! the `clap` crate. These arguments are parsed at startup and then merged
//! with the configuration from the `postwatch.toml` file and environment
//! variables.

use clap::Parser;
use figment::{
    value::{Dict, Map, Value},
    Error, Metadata, Profile, Provider,
};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Prometheus metrics exporter for Postfix logs and mail queues.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Address to listen on for the metrics endpoint.
    #[arg(long, value_name = "ADDR")]
    pub listen_address: Option<SocketAddr>,

    /// Path under which to expose metrics.
    #[arg(long, value_name = "PATH")]
    pub telemetry_path: Option<String>,

    /// Postfix instance to monitor, optionally with a log file to tail
    /// (repeatable). Replaces the configured instance list.
    #[arg(long = "instance", value_name = "NAME[:LOG_FILE]")]
    pub instances: Vec<String>,

    /// Log all lines that could not be classified.
    #[arg(long)]
    pub log_unsupported: bool,
}

impl Provider for Cli {
    fn metadata(&self) -> Metadata {
        Metadata::named("Command-Line Arguments")
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        let mut dict = Dict::new();

        if let Some(addr) = self.listen_address {
            dict.insert("listen_address".into(), Value::from(addr.to_string()));
        }

        if let Some(path) = &self.telemetry_path {
            dict.insert("telemetry_path".into(), Value::from(path.clone()));
        }

        // The `log_unsupported` flag is only merged when present so that it
        // cannot shadow a `true` coming from the file or environment.
        if self.log_unsupported {
            dict.insert("log_unsupported".into(), Value::from(true));
        }

        // The repeatable `--instance` flag is applied in `Config::load`
        // rather than here; a list of tables doesn't fit this flat dict.

        let mut map = Map::new();
        map.insert(Profile::Default, dict);
        Ok(map)
    }
}
