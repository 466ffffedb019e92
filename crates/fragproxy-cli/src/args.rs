//! Command-line argument parsing.

use clap::{Parser, Subcommand, ValueEnum};

use crate::commands::run::RunArgs;

/// fragproxy - local forwarding proxy that fragments the first TLS record
/// of tunnelled connections to evade stateless SNI inspection.
#[derive(Parser, Debug)]
#[command(name = "fragproxy")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Args {
    /// Subcommand to execute. Defaults to `run` with no overrides.
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Configuration file path
    #[arg(short = 'c', long, value_name = "FILE", global = true)]
    pub config: Option<String>,

    /// Blacklist file path, overriding the config file's value
    #[arg(short = 'b', long, value_name = "FILE", global = true)]
    pub blacklist: Option<String>,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Output format for console logs
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Run in quiet mode (suppress periodic stats lines)
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

/// CLI subcommands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the proxy (default if no subcommand is given)
    Run(RunArgs),
}

/// Console log output format.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text
    Text,
    /// JSON format
    Json,
    /// Compact format
    Compact,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_global_flags_without_subcommand() {
        let args = Args::parse_from(["fragproxy", "-vv", "--quiet"]);
        assert_eq!(args.verbose, 2);
        assert!(args.quiet);
        assert!(args.command.is_none());
    }

    #[test]
    fn parses_run_subcommand_with_config_override() {
        let args = Args::parse_from(["fragproxy", "-c", "fragproxy.toml", "run"]);
        assert_eq!(args.config.as_deref(), Some("fragproxy.toml"));
        assert!(matches!(args.command, Some(Command::Run(_))));
    }
}
