//! CLI surface and runtime configuration (§6, SPEC_FULL.md §7).

use std::path::PathBuf;

use clap::Parser;
use serde::Deserialize;

pub const DEFAULT_COLLECTOR_SOCKET: &str = "/tmp/ndpid-collector.sock";
pub const DEFAULT_WORKER_COUNT: u32 = 4;

/// `nDPId [-i pcap-file-or-interface] [-l] [-c path-to-unix-sock]` (§6).
#[derive(Debug, Parser)]
#[command(name = "netsentinel-probe", about = "Passive DPI-backed traffic analyzer")]
pub struct Args {
    /// Offline capture file (if it exists and is readable) or a live
    /// interface name; default is the system's first capturable device.
    #[arg(short = 'i', long = "interface")]
    pub interface: Option<String>,

    /// Also log to standard error in addition to the default subscriber.
    #[arg(short = 'l', long = "log-stderr")]
    pub log_stderr: bool,

    /// Collector socket path.
    #[arg(short = 'c', long = "collector-socket", default_value = DEFAULT_COLLECTOR_SOCKET)]
    pub collector_socket: PathBuf,

    /// Optional TOML config file layered under CLI flags.
    #[arg(long = "config")]
    pub config: Option<PathBuf>,
}

/// Tunables that may be overridden from a config file, matching the
/// teacher's `Config::from_file`/serde-defaults pattern.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub worker_count: u32,
    pub collector_socket: PathBuf,
    pub snaplen: i32,
    pub promiscuous: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            worker_count: DEFAULT_WORKER_COUNT,
            collector_socket: PathBuf::from(DEFAULT_COLLECTOR_SOCKET),
            snaplen: 65535,
            promiscuous: true,
        }
    }
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.worker_count > 0, "worker_count must be >= 1");
        anyhow::ensure!(
            (64..=65535).contains(&self.snaplen),
            "snaplen must be between 64 and 65535"
        );
        Ok(())
    }

    pub fn apply_args(mut self, args: &Args) -> Self {
        if args.collector_socket != PathBuf::from(DEFAULT_COLLECTOR_SOCKET) {
            self.collector_socket = args.collector_socket.clone();
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_workers() {
        let mut config = Config::default();
        config.worker_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_snaplen() {
        let mut config = Config::default();
        config.snaplen = 32;
        assert!(config.validate().is_err());
    }
}
