//! Run command: load configuration and drive the proxy until interrupted.

use anyhow::{Context, Result};
use clap::Args;
use fragproxy_core::{Config, Supervisor};
use tracing::info;

/// Arguments for the `run` subcommand (also used as the implicit default).
#[derive(Args, Debug, Default, Clone)]
pub struct RunArgs {
    /// Listener bind port, overriding the config file's value
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Path to a JSON rules file, overriding the config file's value
    #[arg(long)]
    pub rules: Option<String>,

    /// Path to write a periodic JSON stats snapshot
    #[arg(long)]
    pub stats_file: Option<String>,
}

/// Load configuration and apply CLI overrides. Split out from [`execute`] so
/// `main` can initialize logging (which itself depends on the config's log
/// file paths) before the supervisor starts.
pub fn prepare_config(
    run_args: &RunArgs,
    config_path: Option<&str>,
    blacklist_override: Option<&str>,
) -> Result<Config> {
    let mut config = load_config(config_path)?;

    if let Some(path) = blacklist_override {
        config.blacklist_file = path.into();
    }
    if let Some(port) = run_args.port {
        config.port = port;
    }
    if let Some(path) = &run_args.rules {
        config.rules_file = Some(path.into());
    }
    if let Some(path) = &run_args.stats_file {
        config.stats_file = Some(path.into());
    }

    config
        .validate()
        .context("configuration failed validation")?;

    Ok(config)
}

/// Build the supervisor and run it to completion, returning once the
/// process receives Ctrl+C (after in-flight connections drain) or the
/// listener itself fails.
pub async fn execute(config: Config) -> Result<()> {
    let supervisor = Supervisor::new(config).context("failed to build proxy supervisor")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    ctrlc::set_handler(move || {
        info!("received interrupt signal, shutting down");
        let _ = shutdown_tx.send(true);
    })
    .context("failed to install Ctrl+C handler")?;

    supervisor
        .run(shutdown_rx)
        .await
        .context("proxy exited with an error")
}

fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => {
            Config::load(path).with_context(|| format!("failed to load config from {path}"))
        }
        None => Ok(Config::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_used_without_a_path() {
        let config = load_config(None).unwrap();
        assert_eq!(config.port, 8881);
    }

    #[test]
    fn missing_config_path_is_an_error() {
        let result = load_config(Some("/nonexistent/fragproxy.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn loads_config_from_a_real_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fragproxy.toml");
        std::fs::write(&path, "port = 9999\n").unwrap();

        let config = load_config(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(config.port, 9999);
    }

    #[test]
    fn cli_port_override_wins_over_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fragproxy.toml");
        std::fs::write(&path, "port = 9999\nblacklist_mode = \"none\"\n").unwrap();

        let run_args = RunArgs {
            port: Some(7777),
            rules: None,
            stats_file: None,
        };
        let config = prepare_config(&run_args, Some(path.to_str().unwrap()), None).unwrap();
        assert_eq!(config.port, 7777);
    }

    #[test]
    fn invalid_config_fails_validation() {
        let run_args = RunArgs::default();
        let result = prepare_config(&run_args, None, None);
        // default Config::default() uses BlacklistMode::File with a blacklist
        // file that doesn't exist on disk in a test environment.
        assert!(result.is_err());
    }
}
