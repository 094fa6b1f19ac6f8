//! Command line arguments. Anything given here wins over the config file.

use crate::config::RangerConfig;
use crate::session_config::Role;

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser, Clone)]
#[clap(version, about)]
/// Host side driver for a UWB ranging radio
pub struct RangerArgs {
    #[command(subcommand)]
    /// What to do
    pub command: RangerCommand,

    /// RON config file; built-in defaults are used when absent
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
}

/// The subcommands.
#[derive(Debug, Subcommand, Clone)]
pub enum RangerCommand {
    /// List the serial ports on this machine
    Ports,

    /// Range against a real radio on a serial port
    Range(RangeArgs),

    /// Range against a simulated radio, no hardware needed
    Simulate(SimulateArgs),
}

/// Session overrides shared by `range` and `simulate`.
#[derive(Debug, Args, Clone, Default)]
pub struct SessionArgs {
    /// Which side of the exchange this board plays
    #[arg(short, long, value_enum)]
    pub role: Option<Role>,

    /// Numeric id of the responder board
    #[arg(short, long)]
    pub node_id: Option<u32>,

    /// UWB channel
    #[arg(long)]
    pub channel: Option<u8>,

    /// Stop and tear the session down after this many valid measurements,
    /// 0 for no limit
    #[arg(long)]
    pub count: Option<u64>,

    /// Log measurements instead of showing the terminal UI
    #[arg(long)]
    pub headless: bool,
}

impl SessionArgs {
    /// Write the overrides into `config`.
    pub fn apply(&self, config: &mut RangerConfig) {
        if let Some(role) = self.role {
            config.role = role;
        }
        if let Some(node_id) = self.node_id {
            config.node_id = node_id;
        }
        if let Some(channel) = self.channel {
            config.channel = channel;
        }
        if let Some(count) = self.count {
            config.target_count = Some(count);
        }
    }
}

/// Arguments for `range`.
#[derive(Debug, Args, Clone)]
pub struct RangeArgs {
    /// Serial device; picked interactively when neither this nor the config
    /// names one
    #[arg(short, long)]
    pub port: Option<String>,

    /// Serial baud rate
    #[arg(short, long)]
    pub baud: Option<u32>,

    #[command(flatten)]
    #[allow(missing_docs)]
    pub session: SessionArgs,
}

impl RangeArgs {
    /// Write the overrides into `config`.
    pub fn apply(&self, config: &mut RangerConfig) {
        if let Some(port) = &self.port {
            config.port = Some(port.clone());
        }
        if let Some(baud) = self.baud {
            config.baud_rate = baud;
        }
        self.session.apply(config);
    }
}

/// Arguments for `simulate`.
#[derive(Debug, Args, Clone)]
pub struct SimulateArgs {
    /// True distance to the simulated tag, in centimeters
    #[arg(long, default_value_t = 250.0)]
    pub distance: f64,

    /// True azimuth of the simulated tag, in degrees
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    pub azimuth: f64,

    /// True elevation of the simulated tag, in degrees
    #[arg(long, default_value_t = 0.0, allow_negative_numbers = true)]
    pub elevation: f64,

    /// Uniform noise amplitude
    #[arg(long, default_value_t = 3.0)]
    pub noise: f64,

    /// Milliseconds between ranging rounds
    #[arg(long, default_value_t = 100)]
    pub interval_ms: u64,

    #[command(flatten)]
    #[allow(missing_docs)]
    pub session: SessionArgs,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_overrides() {
        let args = RangerArgs::parse_from([
            "uwb-ranger",
            "range",
            "--port",
            "/dev/ttyUSB0",
            "--role",
            "responder",
            "--node-id",
            "3",
            "--count",
            "100",
            "--headless",
        ]);

        let RangerCommand::Range(range) = args.command else {
            panic!("expected range");
        };
        assert!(range.session.headless);

        let mut config = RangerConfig::default();
        range.apply(&mut config);
        assert_eq!(config.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(config.role, Role::Responder);
        assert_eq!(config.node_id, 3);
        assert_eq!(config.target_count, Some(100));
        assert_eq!(config.baud_rate, 115200);
    }

    #[test]
    fn config_flag_is_global() {
        let args = RangerArgs::parse_from(["uwb-ranger", "simulate", "-c", "ranger.ron"]);
        assert_eq!(args.config, Some(PathBuf::from("ranger.ron")));

        let RangerCommand::Simulate(sim) = args.command else {
            panic!("expected simulate");
        };
        assert_eq!(sim.distance, 250.0);
        assert_eq!(sim.session.count, None);
    }

    #[test]
    fn no_overrides_leave_config_alone() {
        let mut config = RangerConfig {
            channel: 5,
            ..Default::default()
        };
        SessionArgs::default().apply(&mut config);
        assert_eq!(config.channel, 5);
    }
}
