//! Per-connection handling: HTTP/CONNECT parsing, origin dialing, first-record
//! fragmentation and the full-duplex relay loop.
//!
//! One [`ConnectionCore`] is shared (via `Arc`) across every accepted
//! connection; state specific to a single connection lives in the owned
//! [`ConnectionInfo`] each call to [`ConnectionCore::handle`] creates.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tracing::{error, instrument};

use crate::blacklist::BlacklistOracle;
use crate::config::Config;
use crate::dns::DnsCache;
use crate::error::{Error, Result};
use crate::fragment::{self, FragmentMethod};
use crate::rules::RuleSet;
use crate::stats::StatsSink;

const BUF_SIZE: usize = 65536;
const INITIAL_TLS_READ_CAP: usize = 2048;

/// Per-connection bookkeeping, kept only for the life of one accepted socket.
pub struct ConnectionInfo {
    pub src_ip: String,
    pub dst_domain: String,
    pub method: String,
    pub start_time: String,
    pub traffic_in: u64,
    pub traffic_out: u64,
}

impl ConnectionInfo {
    fn new(src_ip: String, dst_domain: String, method: String) -> Self {
        Self {
            src_ip,
            dst_domain,
            method,
            start_time: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            traffic_in: 0,
            traffic_out: 0,
        }
    }
}

enum HttpMethod {
    Connect,
    Other(String),
}

struct ParsedRequest {
    method: HttpMethod,
    host: String,
    port: u16,
}

impl ParsedRequest {
    fn method_str(&self) -> String {
        match &self.method {
            HttpMethod::Connect => "CONNECT".to_string(),
            HttpMethod::Other(m) => m.clone(),
        }
    }
}

fn parse_http_request(data: &[u8]) -> Result<ParsedRequest> {
    let first_crlf = find(data, b"\r\n").ok_or_else(|| Error::http_parse("missing CRLF"))?;
    let first_line = &data[..first_crlf];
    let mut parts = first_line.splitn(3, |&b| b == b' ');
    let method_bytes = parts.next().ok_or_else(|| Error::http_parse("empty request line"))?;
    let url_bytes = parts
        .next()
        .ok_or_else(|| Error::http_parse("missing request target"))?;

    if method_bytes == b"CONNECT" {
        let url = String::from_utf8_lossy(url_bytes);
        let (host, port) = match url.split_once(':') {
            Some((h, p)) => (h.to_string(), p.parse().unwrap_or(443)),
            None => (url.to_string(), 443),
        };
        return Ok(ParsedRequest {
            method: HttpMethod::Connect,
            host,
            port,
        });
    }

    let method = String::from_utf8_lossy(method_bytes).to_string();

    if let Some(host_pos) = find(data, b"\r\nHost: ") {
        let start = host_pos + 8;
        let end = find(&data[start..], b"\r\n")
            .map(|rel| start + rel)
            .unwrap_or(data.len());
        let host_line = String::from_utf8_lossy(&data[start..end]);
        let (host, port) = match host_line.split_once(':') {
            Some((h, p)) => (h.to_string(), p.parse().unwrap_or(80)),
            None => (host_line.to_string(), 80),
        };
        return Ok(ParsedRequest {
            method: HttpMethod::Other(method),
            host,
            port,
        });
    }

    for header in data.split(|&b| b == b'\n') {
        let header = header.strip_suffix(b"\r").unwrap_or(header);
        if let Some(rest) = strip_prefix_ignore_ascii_case(header, b"Host: ") {
            let host_line = String::from_utf8_lossy(rest);
            let (host, port) = match host_line.split_once(':') {
                Some((h, p)) => (h.to_string(), p.parse().unwrap_or(80)),
                None => (host_line.to_string(), 80),
            };
            return Ok(ParsedRequest {
                method: HttpMethod::Other(method),
                host,
                port,
            });
        }
    }

    Err(Error::http_parse("missing Host header"))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn strip_prefix_ignore_ascii_case<'a>(data: &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
    if data.len() < prefix.len() {
        return None;
    }
    if data[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&data[prefix.len()..])
    } else {
        None
    }
}

/// Shared, transport-independent connection handler.
///
/// Cheap to clone (everything inside is an `Arc`); one instance is built
/// once in the supervisor and handed to every spawned connection task.
#[derive(Clone)]
pub struct ConnectionCore {
    config: Arc<Config>,
    blacklist: Arc<BlacklistOracle>,
    rules: Arc<RuleSet>,
    stats: Arc<StatsSink>,
    dns: Arc<DnsCache>,
    domain_failures: Arc<DashMap<String, u32>>,
}

impl ConnectionCore {
    /// Build a handler sharing the given capabilities.
    pub fn new(
        config: Arc<Config>,
        blacklist: Arc<BlacklistOracle>,
        rules: Arc<RuleSet>,
        stats: Arc<StatsSink>,
        dns: Arc<DnsCache>,
    ) -> Self {
        Self {
            config,
            blacklist,
            rules,
            stats,
            dns,
            domain_failures: Arc::new(DashMap::new()),
        }
    }

    /// Drive one accepted connection end to end. Never panics or propagates
    /// an error — every failure path ends in a response, a log line, or a
    /// silent close.
    #[instrument(skip(self, stream), fields(peer = %peer))]
    pub async fn handle(&self, mut stream: TcpStream, peer: SocketAddr) {
        let client_ip = peer.ip().to_string();

        let mut buf = vec![0u8; BUF_SIZE];
        let n = match tokio::time::timeout(
            self.config.initial_read_timeout(),
            stream.read(&mut buf),
        )
        .await
        {
            Ok(Ok(n)) if n > 0 => n,
            _ => {
                let _ = stream.shutdown().await;
                return;
            }
        };
        let http_data = buf[..n].to_vec();

        let parsed = match parse_http_request(&http_data) {
            Ok(p) => p,
            Err(e) => {
                self.handle_connection_error(&mut stream, None, &e).await;
                return;
            }
        };

        let mut conn_info = ConnectionInfo::new(client_ip, parsed.host.clone(), parsed.method_str());

        if matches!(parsed.method, HttpMethod::Connect) {
            self.blacklist.check(&parsed.host).await;
        }

        self.stats.record_traffic(0, http_data.len() as u64);
        conn_info.traffic_out += http_data.len() as u64;

        let result = match parsed.method {
            HttpMethod::Connect => {
                self.handle_https(&mut stream, parsed.host, parsed.port, &mut conn_info)
                    .await
            }
            HttpMethod::Other(_) => {
                self.handle_http(&mut stream, &http_data, parsed.host, parsed.port, &mut conn_info)
                    .await
            }
        };

        if let Err(e) = result {
            self.handle_connection_error(&mut stream, Some(&conn_info), &e).await;
        }
    }

    async fn handle_https(
        &self,
        stream: &mut TcpStream,
        host: String,
        port: u16,
        conn_info: &mut ConnectionInfo,
    ) -> Result<()> {
        const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
        self.stats.record_traffic(ESTABLISHED.len() as u64, 0);
        conn_info.traffic_in += ESTABLISHED.len() as u64;

        let mut remote = self.dial(&host, port).await?;

        stream.write_all(ESTABLISHED).await?;

        self.handle_initial_tls_data(stream, &mut remote, &host, conn_info).await;
        self.run_pipes(stream, &mut remote, conn_info).await;
        Ok(())
    }

    async fn handle_http(
        &self,
        stream: &mut TcpStream,
        http_data: &[u8],
        host: String,
        port: u16,
        conn_info: &mut ConnectionInfo,
    ) -> Result<()> {
        let mut remote = self.dial(&host, port).await?;
        remote.write_all(http_data).await?;

        self.stats.record_connection();
        self.stats.record_allowed();

        self.run_pipes(stream, &mut remote, conn_info).await;
        Ok(())
    }

    async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
        tokio::time::timeout(self.config.connect_timeout(), self.open_connection(host, port))
            .await
            .map_err(|_| Error::ConnectFailed {
                host: host.to_string(),
                port,
                reason: "connect timed out".to_string(),
            })?
    }

    async fn open_connection(&self, host: &str, port: u16) -> Result<TcpStream> {
        let addrs = self.dns.resolve(host, port).await?;
        let mut last_reason = "no addresses resolved".to_string();

        for addr in addrs {
            let socket = match addr {
                SocketAddr::V4(_) => TcpSocket::new_v4(),
                SocketAddr::V6(_) => TcpSocket::new_v6(),
            };
            let socket = match socket {
                Ok(s) => s,
                Err(e) => {
                    last_reason = e.to_string();
                    continue;
                }
            };

            if let (Some(out_host), SocketAddr::V4(_)) = (&self.config.out_host, &addr) {
                if let Ok(bind_ip) = out_host.parse::<std::net::IpAddr>() {
                    let _ = socket.bind(SocketAddr::new(bind_ip, 0));
                }
            }

            match socket.connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    last_reason = e.to_string();
                    continue;
                }
            }
        }

        Err(Error::ConnectFailed {
            host: host.to_string(),
            port,
            reason: last_reason,
        })
    }

    async fn handle_initial_tls_data(
        &self,
        client: &mut TcpStream,
        remote: &mut TcpStream,
        host: &str,
        conn_info: &mut ConnectionInfo,
    ) {
        let mut head_buf = [0u8; 5];
        let head_n = match tokio::time::timeout(
            self.config.initial_read_timeout(),
            client.read(&mut head_buf),
        )
        .await
        {
            Ok(Ok(n)) => n,
            _ => {
                error!(target: "error", "{host} : initial TLS read timed out");
                return;
            }
        };

        let mut data_buf = vec![0u8; INITIAL_TLS_READ_CAP];
        let data_n = match tokio::time::timeout(
            self.config.initial_read_timeout(),
            client.read(&mut data_buf),
        )
        .await
        {
            Ok(Ok(n)) => n,
            _ => {
                error!(target: "error", "{host} : initial TLS read timed out");
                return;
            }
        };

        let head = &head_buf[..head_n];
        let data = &data_buf[..data_n];

        let mut should_fragment = self.blacklist.is_blocked(host);
        let (rule_decision, rule_method) = self.rules.decide(host);
        if let Some(decision) = rule_decision {
            should_fragment = decision;
        }

        if !should_fragment {
            self.stats.record_connection();
            self.stats.record_allowed();
            self.forward_unmodified(remote, head, data, conn_info).await;
            return;
        }

        self.stats.record_connection();
        self.stats.record_blocked();

        let mut method = rule_method.unwrap_or(self.config.fragment_method);
        let failures = self
            .domain_failures
            .get(host)
            .map(|f| *f)
            .unwrap_or(0);
        if failures >= 2 && method == FragmentMethod::Random {
            method = FragmentMethod::Sni;
        }

        let parts = fragment::fragment(data, method);
        if parts.is_empty() {
            self.forward_unmodified(remote, head, data, conn_info).await;
            return;
        }

        let total = if method == FragmentMethod::SplitJitter {
            self.write_fragments_with_jitter(remote, &parts).await
        } else {
            let combined: Vec<u8> = parts.concat();
            match remote.write_all(&combined).await {
                Ok(()) => combined.len(),
                Err(_) => 0,
            }
        };

        self.stats.record_traffic(0, total as u64);
        conn_info.traffic_out += total as u64;
    }

    async fn forward_unmodified(
        &self,
        remote: &mut TcpStream,
        head: &[u8],
        data: &[u8],
        conn_info: &mut ConnectionInfo,
    ) {
        let mut combined = Vec::with_capacity(head.len() + data.len());
        combined.extend_from_slice(head);
        combined.extend_from_slice(data);
        if remote.write_all(&combined).await.is_ok() {
            self.stats.record_traffic(0, combined.len() as u64);
            conn_info.traffic_out += combined.len() as u64;
        }
    }

    async fn write_fragments_with_jitter(&self, remote: &mut TcpStream, parts: &[Vec<u8>]) -> usize {
        let mut total = 0;
        for part in parts {
            if remote.write_all(part).await.is_err() {
                break;
            }
            total += part.len();
            let jitter_ms = rand::Rng::gen_range(
                &mut rand::thread_rng(),
                fragment::JITTER_MIN_MS..fragment::JITTER_MAX_MS_EXCLUSIVE,
            );
            tokio::time::sleep(std::time::Duration::from_millis(jitter_ms)).await;
        }
        total
    }

    async fn run_pipes(&self, client: &mut TcpStream, remote: &mut TcpStream, conn_info: &mut ConnectionInfo) {
        let (client_read, client_write) = client.split();
        let (remote_read, remote_write) = remote.split();

        let in_counter = Arc::new(AtomicU64::new(0));
        let out_counter = Arc::new(AtomicU64::new(0));

        let to_remote = pipe(client_read, remote_write, self.stats.clone(), true, out_counter.clone());
        let to_client = pipe(remote_read, client_write, self.stats.clone(), false, in_counter.clone());
        tokio::join!(to_remote, to_client);

        let _ = client.shutdown().await;
        let _ = remote.shutdown().await;

        conn_info.traffic_out += out_counter.load(Ordering::Relaxed);
        conn_info.traffic_in += in_counter.load(Ordering::Relaxed);

        if let Some(mut failures) = self.domain_failures.get_mut(&conn_info.dst_domain) {
            *failures = failures.saturating_sub(1);
        }

        tracing::info!(
            target: "access",
            "{} {} {} {} {} {}",
            conn_info.start_time,
            conn_info.src_ip,
            conn_info.method,
            conn_info.dst_domain,
            conn_info.traffic_in,
            conn_info.traffic_out,
        );
    }

    async fn handle_connection_error(
        &self,
        stream: &mut TcpStream,
        conn_info: Option<&ConnectionInfo>,
        err: &Error,
    ) {
        const ERROR_RESPONSE: &[u8] = b"HTTP/1.1 500 Internal Server Error\r\n\r\n";
        if stream.write_all(ERROR_RESPONSE).await.is_ok() {
            self.stats.record_traffic(ERROR_RESPONSE.len() as u64, 0);
        }

        self.stats.record_connection();
        self.stats.record_error();

        let domain = conn_info.map(|c| c.dst_domain.as_str()).unwrap_or("unknown");
        if let Some(info) = conn_info {
            *self.domain_failures.entry(info.dst_domain.clone()).or_insert(0) += 1;
        }
        error!(target: "error", "{domain} : {err}");

        let _ = stream.shutdown().await;
    }
}

async fn pipe(
    mut reader: tokio::net::tcp::ReadHalf<'_>,
    mut writer: tokio::net::tcp::WriteHalf<'_>,
    stats: Arc<StatsSink>,
    is_out: bool,
    traffic_counter: Arc<AtomicU64>,
) {
    let mut buf = vec![0u8; BUF_SIZE];
    let mut local_vol: u64 = 0;

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if writer.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                local_vol += n as u64;
            }
            Err(_) => break,
        }
    }

    let _ = writer.shutdown().await;
    if is_out {
        stats.record_traffic(0, local_vol);
    } else {
        stats.record_traffic(local_vol, 0);
    }
    traffic_counter.fetch_add(local_vol, Ordering::Relaxed);
}
