//! CLI argument parsing.

use std::path::PathBuf;

use clap::Parser;

/// Command-line arguments for the bridge.
#[derive(Parser, Debug, Clone)]
#[command(about = "SNMP/serial to MQTT bridge for CyberPower PDUs")]
pub struct BridgeArgs {
    /// Path to the configuration file.
    #[arg(short, long)]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,
}

impl BridgeArgs {
    /// Parse CLI arguments with a default config path.
    pub fn parse_with_default(default_config: &'static str) -> Self {
        let matches = <Self as clap::CommandFactory>::command()
            .mut_arg("config", |arg| arg.default_value(default_config))
            .get_matches();

        <Self as clap::FromArgMatches>::from_arg_matches(&matches)
            .expect("Failed to parse arguments")
    }
}
