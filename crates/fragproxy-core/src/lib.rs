//! # fragproxy-core
//!
//! Transport-independent core for a local forwarding proxy that fragments the
//! first TLS record of a tunnelled connection to evade stateless SNI-based
//! traffic inspection.
//!
//! ## Architecture
//!
//! This crate provides:
//! - **Connection handling** - `CONNECT`/plain-HTTP parsing and relay
//! - **Fragmentation** - first-record splitting strategies
//! - **Blacklist/rule decisions** - which domains get fragmented
//! - **DNS caching** - bounded, TTL-based address cache
//! - **Statistics** - counters and periodic speed tracking
//! - **Configuration** - TOML-backed `Config`
//!
//! ## Example
//!
//! ```rust,ignore
//! use fragproxy_core::{Config, Supervisor};
//!
//! let config = Config::load("fragproxy.toml").expect("failed to load config");
//! let supervisor = Supervisor::new(config).expect("failed to build supervisor");
//! let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! supervisor.run(shutdown_rx).await.expect("proxy exited with an error");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod blacklist;
pub mod config;
pub mod connection;
pub mod dns;
pub mod error;
pub mod fragment;
pub mod rules;
pub mod stats;
pub mod supervisor;

pub use blacklist::BlacklistOracle;
pub use config::{BlacklistMode, Config};
pub use connection::{ConnectionCore, ConnectionInfo};
pub use dns::DnsCache;
pub use error::{Error, Result};
pub use fragment::FragmentMethod;
pub use rules::{Rule, RuleSet};
pub use stats::StatsSink;
pub use supervisor::Supervisor;
