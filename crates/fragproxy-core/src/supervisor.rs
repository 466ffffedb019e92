//! Top-level orchestration: bind the listener, accept connections, drive
//! the periodic statistics tick, and shut both down gracefully on signal.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::blacklist::BlacklistOracle;
use crate::config::Config;
use crate::connection::ConnectionCore;
use crate::dns::DnsCache;
use crate::error::{Error, Result};
use crate::rules::RuleSet;
use crate::stats::StatsSink;

/// Owns the listener and background tasks for one running proxy instance.
pub struct Supervisor {
    config: Arc<Config>,
    core: ConnectionCore,
    stats: Arc<StatsSink>,
}

impl Supervisor {
    /// Validate `config` and build every capability (blacklist oracle, rule
    /// set, DNS cache, statistics) it needs to start accepting connections.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let blacklist = Arc::new(BlacklistOracle::load(&config)?);
        let rules = Arc::new(match &config.rules_file {
            Some(path) => RuleSet::load(path),
            None => RuleSet::empty(),
        });
        let stats = Arc::new(StatsSink::new());
        let dns = Arc::new(DnsCache::new());

        let core = ConnectionCore::new(config.clone(), blacklist, rules, stats.clone(), dns);

        Ok(Self { config, core, stats })
    }

    /// Bind the listener and accept connections until `shutdown` fires.
    ///
    /// On shutdown this stops accepting, drops the listener, cancels the
    /// stats ticker, and waits for every in-flight connection task to finish
    /// its own cleanup path (bookkeeping decrement, access/error log line)
    /// before returning.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port))
            .await
            .map_err(|e| Error::BindFailed {
                host: self.config.host.clone(),
                port: self.config.port,
                reason: e.to_string(),
            })?;

        info!(
            host = %self.config.host,
            port = self.config.port,
            method = %self.config.fragment_method,
            "proxy listening"
        );

        let stats_task = tokio::spawn(stats_tick_loop(
            self.stats.clone(),
            self.config.clone(),
            shutdown.clone(),
        ));

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    info!("shutdown signal received, closing listener");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(target: "error", "accept failed: {e}");
                            continue;
                        }
                    };

                    if let Err(e) = stream.set_nodelay(true) {
                        error!(target: "error", "failed to set TCP_NODELAY: {e}");
                    }

                    let core = self.core.clone();
                    connections.spawn(async move {
                        core.handle(stream, peer).await;
                    });
                }
            }
        }

        drop(listener);

        let in_flight = connections.len();
        if in_flight > 0 {
            info!(in_flight, "draining in-flight connections");
        }
        while connections.join_next().await.is_some() {}

        let _ = stats_task.await;

        Ok(())
    }
}

/// Runs at 1Hz until `shutdown` fires: refreshes throughput averages,
/// optionally prints a one-line summary, and optionally writes a JSON
/// snapshot to `config.stats_file`.
async fn stats_tick_loop(
    stats: Arc<StatsSink>,
    config: Arc<Config>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => return,
            _ = tick.tick() => {}
        }

        stats.update_speeds();

        let snapshot = stats.snapshot(config.fragment_method, &config.host, config.port);

        if !config.quiet {
            info!(
                total = snapshot.total_connections,
                allowed = snapshot.allowed_connections,
                blocked = snapshot.blocked_connections,
                errors = snapshot.error_connections,
                "stats tick"
            );
        }

        if let Some(path) = &config.stats_file {
            match serde_json::to_string(&snapshot) {
                Ok(payload) => {
                    if let Err(e) = tokio::fs::write(path, payload).await {
                        error!(target: "error", path = %path.display(), error = %e, "failed to write stats snapshot");
                    }
                }
                Err(e) => {
                    error!(target: "error", error = %e, "failed to serialize stats snapshot");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_fails_fast_on_invalid_config() {
        let mut config = Config::default();
        config.port = 0;
        config.blacklist_mode = crate::config::BlacklistMode::None;
        assert!(Supervisor::new(config).is_err());
    }

    #[tokio::test]
    async fn new_succeeds_with_none_blacklist_mode() {
        let mut config = Config::default();
        config.blacklist_mode = crate::config::BlacklistMode::None;
        config.port = 18881;
        assert!(Supervisor::new(config).is_ok());
    }

    #[tokio::test]
    async fn run_returns_promptly_after_shutdown_signal() {
        let mut config = Config::default();
        config.blacklist_mode = crate::config::BlacklistMode::None;
        config.port = 18882;
        let supervisor = Supervisor::new(config).unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { supervisor.run(rx).await });

        // give the accept loop a moment to actually start listening
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("run() did not return after shutdown signal")
            .unwrap();
        assert!(result.is_ok());
    }
}
