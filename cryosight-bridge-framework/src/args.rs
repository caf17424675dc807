//! CLI argument parsing for bridges.

use std::path::PathBuf;

use clap::Parser;

/// Common CLI arguments for all bridges.
#[derive(Parser, Debug, Clone)]
#[command(about = "CryoSight telemetry bridge")]
pub struct BridgeArgs {
    /// Path to configuration file.
    #[arg(short, long)]
    pub config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Validate the configuration and exit.
    #[arg(long)]
    pub check_config: bool,

    /// Poll a built-in simulated device instead of real hardware.
    #[arg(long)]
    pub simulate: bool,
}

impl BridgeArgs {
    /// Parse CLI arguments with a default config path.
    ///
    /// If no `--config` argument is provided, uses the default. Exits the
    /// process with clap's usage message on invalid arguments.
    pub fn parse_with_default(default_config: &'static str) -> Self {
        let matches = <Self as clap::CommandFactory>::command()
            .mut_arg("config", |arg| arg.default_value(default_config))
            .get_matches();

        <Self as clap::FromArgMatches>::from_arg_matches(&matches).unwrap_or_else(|e| e.exit())
    }

    /// Parse CLI arguments (requires --config to be specified).
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flags() {
        let args = BridgeArgs::try_parse_from([
            "bridge",
            "--config",
            "cryo.json5",
            "--log-level",
            "debug",
            "--simulate",
        ])
        .unwrap();

        assert_eq!(args.config, PathBuf::from("cryo.json5"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.simulate);
        assert!(!args.check_config);
    }

    #[test]
    fn test_config_required_without_default() {
        assert!(BridgeArgs::try_parse_from(["bridge"]).is_err());
    }
}
