//! Decision oracles that answer "should this domain's first TLS record be
//! fragmented?"
//!
//! Three variants, closed over the one trait-like interface each
//! [`ConnectionCore`](crate::connection::ConnectionCore) cares about:
//! [`BlacklistOracle::is_blocked`] for a synchronous yes/no, and
//! [`BlacklistOracle::check`] for the adaptive variant's out-of-band probe.

use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::config::{BlacklistMode, Config, MatchMode};
use crate::error::{Error, Result};

const PROBE_TOTAL_BUDGET: Duration = Duration::from_secs(4);
const PROBE_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

fn normalize(domain: &str) -> String {
    domain.to_ascii_lowercase().replace("www.", "")
}

/// A static, file-backed domain list.
pub struct FileOracle {
    blocked: HashSet<String>,
    matching: MatchMode,
}

impl FileOracle {
    /// Load a newline-delimited domain list, skipping blank lines and `#` comments.
    pub fn load(path: &Path, matching: MatchMode) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|_| Error::BlacklistLoadMissing {
            path: path.display().to_string(),
        })?;

        let blocked = content
            .lines()
            .map(str::trim)
            .filter(|line| line.len() >= 2 && !line.starts_with('#'))
            .map(normalize)
            .collect();

        Ok(Self { blocked, matching })
    }

    fn is_blocked(&self, domain: &str) -> bool {
        let d = normalize(domain);

        if self.matching == MatchMode::Loose && self.blocked.iter().any(|bd| d.contains(bd)) {
            return true;
        }

        if self.blocked.contains(&d) {
            return true;
        }

        let parts: Vec<&str> = d.split('.').collect();
        for i in 1..parts.len() {
            if self.blocked.contains(&parts[i..].join(".")) {
                return true;
            }
        }
        false
    }
}

/// Outcome of one adaptive out-of-band TLS probe.
#[derive(Debug, PartialEq, Eq)]
enum ProbeOutcome {
    /// Handshake completed: the domain is reachable over TLS as-is.
    Allowed,
    /// The handshake stage itself timed out — treated as DPI interference.
    Blocked,
    /// Connect failed, or some other non-handshake-timeout error occurred.
    /// Treated the same as `Allowed` so a flaky probe doesn't get re-run on
    /// every connection attempt.
    Undetermined,
}

struct InsecureCertVerifier(Arc<rustls::crypto::CryptoProvider>);

impl std::fmt::Debug for InsecureCertVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InsecureCertVerifier").finish()
    }
}

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

fn insecure_tls_connector() -> tokio_rustls::TlsConnector {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier(provider)))
        .with_no_client_auth();
    tokio_rustls::TlsConnector::from(Arc::new(config))
}

/// Budget left in the probe's overall 4-second window, given how long has
/// elapsed since it started. Never returns zero so a later `timeout()` call
/// still gets a chance to poll once rather than firing immediately.
fn remaining_budget(started: tokio::time::Instant) -> Duration {
    PROBE_TOTAL_BUDGET
        .saturating_sub(started.elapsed())
        .max(Duration::from_millis(1))
}

async fn probe_domain(domain: &str) -> ProbeOutcome {
    let started = tokio::time::Instant::now();

    let tcp_stream = match tokio::time::timeout(
        PROBE_CONNECT_TIMEOUT,
        TcpStream::connect((domain, 443)),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(_)) | Err(_) => return ProbeOutcome::Undetermined,
    };

    let server_name = match rustls::pki_types::ServerName::try_from(domain.to_string()) {
        Ok(name) => name,
        Err(_) => return ProbeOutcome::Undetermined,
    };

    let connector = insecure_tls_connector();
    let mut tls_stream = match tokio::time::timeout(
        remaining_budget(started),
        connector.connect(server_name, tcp_stream),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(_)) => return ProbeOutcome::Undetermined,
        Err(_) => return ProbeOutcome::Blocked,
    };

    let request = format!(
        "GET / HTTP/1.1\r\nHost: {domain}\r\nUser-Agent: Mozilla/5.0\r\nConnection: close\r\n\r\n"
    );
    match tokio::time::timeout(
        remaining_budget(started),
        tls_stream.write_all(request.as_bytes()),
    )
    .await
    {
        Ok(Ok(())) => {}
        Ok(Err(_)) => return ProbeOutcome::Undetermined,
        Err(_) => return ProbeOutcome::Blocked,
    }

    let mut buf = [0u8; 1];
    match tokio::time::timeout(remaining_budget(started), tls_stream.read(&mut buf)).await {
        Ok(Ok(_)) => ProbeOutcome::Allowed,
        Ok(Err(e)) if e.kind() == ErrorKind::TimedOut => ProbeOutcome::Blocked,
        Ok(Err(_)) => ProbeOutcome::Undetermined,
        Err(_) => ProbeOutcome::Blocked,
    }
}

/// Starts empty and learns which domains are DPI-blocked by probing them.
pub struct AdaptiveOracle {
    blocked: DashMap<String, ()>,
    allowed: DashMap<String, ()>,
    blacklist_file: PathBuf,
}

impl AdaptiveOracle {
    fn new(blacklist_file: PathBuf) -> Self {
        Self {
            blocked: DashMap::new(),
            allowed: DashMap::new(),
            blacklist_file,
        }
    }

    fn is_blocked(&self, domain: &str) -> bool {
        self.blocked.contains_key(domain)
    }

    async fn check(&self, domain: &str) {
        if self.blocked.contains_key(domain) || self.allowed.contains_key(domain) {
            return;
        }

        match probe_domain(domain).await {
            ProbeOutcome::Allowed => {
                self.allowed.insert(domain.to_string(), ());
            }
            ProbeOutcome::Blocked => {
                self.blocked.insert(domain.to_string(), ());
                if let Err(e) = Self::persist(&self.blacklist_file, domain) {
                    warn!(domain, error = %e, "failed to persist learned blocked domain");
                }
            }
            ProbeOutcome::Undetermined => {
                debug!(domain, "adaptive probe inconclusive, treating as allowed");
                self.allowed.insert(domain.to_string(), ());
            }
        }
    }

    fn persist(path: &Path, domain: &str) -> std::io::Result<()> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new().append(true).create(true).open(path)?;
        writeln!(file, "{domain}")
    }
}

/// Closed set of domain-decision strategies.
pub enum BlacklistOracle {
    /// Decisions come from a static file loaded once at startup.
    File(FileOracle),
    /// Decisions are learned at runtime via out-of-band TLS probes.
    Adaptive(AdaptiveOracle),
    /// Every domain is unconditionally treated as blocked.
    None,
}

impl BlacklistOracle {
    /// Build the oracle variant selected by `config.blacklist_mode`.
    pub fn load(config: &Config) -> Result<Self> {
        match config.blacklist_mode {
            BlacklistMode::File => Ok(Self::File(FileOracle::load(
                &config.blacklist_file,
                config.domain_matching,
            )?)),
            BlacklistMode::Auto => Ok(Self::Adaptive(AdaptiveOracle::new(
                config.blacklist_file.clone(),
            ))),
            BlacklistMode::None => Ok(Self::None),
        }
    }

    /// Synchronous yes/no: should this domain's first TLS record be fragmented?
    pub fn is_blocked(&self, domain: &str) -> bool {
        match self {
            Self::File(oracle) => oracle.is_blocked(domain),
            Self::Adaptive(oracle) => oracle.is_blocked(domain),
            Self::None => true,
        }
    }

    /// Run the out-of-band probe, if this variant has one. No-op otherwise.
    pub async fn check(&self, domain: &str) {
        if let Self::Adaptive(oracle) = self {
            oracle.check(domain).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_list(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        file.flush().unwrap();
        file
    }

    #[test]
    fn file_oracle_matches_exact_domain() {
        let file = write_list(&["blocked.test", "# a comment", "other.test"]);
        let oracle = FileOracle::load(file.path(), MatchMode::Strict).unwrap();
        assert!(oracle.is_blocked("blocked.test"));
        assert!(!oracle.is_blocked("notblocked.test"));
    }

    #[test]
    fn file_oracle_matches_subdomain_by_suffix() {
        let file = write_list(&["blocked.test"]);
        let oracle = FileOracle::load(file.path(), MatchMode::Strict).unwrap();
        assert!(oracle.is_blocked("www.blocked.test"));
        assert!(oracle.is_blocked("sub.blocked.test"));
    }

    #[test]
    fn file_oracle_strips_www_prefix_from_queries() {
        let file = write_list(&["www.blocked.test"]);
        let oracle = FileOracle::load(file.path(), MatchMode::Strict).unwrap();
        assert!(oracle.is_blocked("blocked.test"));
    }

    #[test]
    fn file_oracle_loose_mode_matches_substring() {
        let file = write_list(&["ads"]);
        let strict = FileOracle::load(file.path(), MatchMode::Strict).unwrap();
        assert!(!strict.is_blocked("adserver.example.com"));

        let loose = FileOracle::load(file.path(), MatchMode::Loose).unwrap();
        assert!(loose.is_blocked("adserver.example.com"));
    }

    #[test]
    fn file_oracle_missing_file_is_an_error() {
        let result = FileOracle::load(Path::new("/nonexistent/blacklist.txt"), MatchMode::Strict);
        assert!(matches!(result, Err(Error::BlacklistLoadMissing { .. })));
    }

    #[test]
    fn none_oracle_blocks_everything() {
        let oracle = BlacklistOracle::None;
        assert!(oracle.is_blocked("anything.example.com"));
    }

    #[test]
    fn adaptive_oracle_is_unblocked_until_learned() {
        let oracle = AdaptiveOracle::new(PathBuf::from("/tmp/fragproxy-test-blacklist.txt"));
        assert!(!oracle.is_blocked("unprobed.example.com"));
    }
}
