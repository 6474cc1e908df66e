//! Seed lists and connectivity pre-flight checks.

use crate::error::{NetworkError, NetworkResult};
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Seconds between the NTP era (1900) and the unix epoch.
const NTP_UNIX_OFFSET: u64 = 2_208_988_800;

/// SNTP packet size.
const NTP_PACKET_SIZE: usize = 48;

/// Default DNS hosts used to check name resolution.
pub const DEFAULT_DNS_HOSTS: &[&str] = &["1.1.1.1", "8.8.8.8", "9.9.9.9"];

/// Default NTP servers used to check clock drift.
pub const DEFAULT_NTP_HOSTS: &[&str] = &["pool.ntp.org", "time.google.com"];

/// Parse `ip:port` seed entries, skipping malformed ones.
pub fn parse_seed_peers(entries: &[String]) -> Vec<SocketAddr> {
    entries
        .iter()
        .filter_map(|entry| match parse_peer_address(entry) {
            Some(addr) => Some(addr),
            None => {
                warn!(entry = %entry, "Ignoring malformed seed peer");
                None
            }
        })
        .collect()
}

/// Parse an `ip:port` peer address.
pub fn parse_peer_address(s: &str) -> Option<SocketAddr> {
    s.trim().parse().ok()
}

/// Resolve `host` off the async runtime.
async fn resolve(host: &str, dns_timeout: Duration) -> Result<Vec<SocketAddr>, std::io::Error> {
    let host = host.to_string();
    let result = timeout(
        dns_timeout,
        tokio::task::spawn_blocking(move || {
            (host.as_str(), 0u16)
                .to_socket_addrs()
                .map(|iter| iter.collect::<Vec<_>>())
        }),
    )
    .await;

    match result {
        Ok(Ok(Ok(addrs))) => Ok(addrs),
        Ok(Ok(Err(e))) => Err(e),
        Ok(Err(e)) => Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("Task join error: {}", e),
        )),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "DNS resolution timed out",
        )),
    }
}

/// Check that at least one of `hosts` resolves. Returns the first that does.
pub async fn check_dns(hosts: &[String], dns_timeout: Duration) -> NetworkResult<String> {
    for host in hosts {
        match resolve(host, dns_timeout).await {
            Ok(addrs) if !addrs.is_empty() => {
                debug!(host = %host, "DNS check passed");
                return Ok(host.clone());
            }
            Ok(_) => debug!(host = %host, "DNS host resolved to nothing"),
            Err(e) => debug!(host = %host, error = %e, "DNS host unreachable"),
        }
    }
    Err(NetworkError::Connectivity(format!(
        "none of {} DNS hosts resolved",
        hosts.len()
    )))
}

/// Query one SNTP server and return our clock offset in milliseconds
/// (positive when the server is ahead).
pub async fn query_ntp(host: &str, ntp_timeout: Duration) -> NetworkResult<i64> {
    let server = resolve(host, ntp_timeout)
        .await?
        .into_iter()
        .next()
        .map(|mut addr| {
            addr.set_port(123);
            addr
        })
        .ok_or_else(|| NetworkError::Connectivity(format!("{} did not resolve", host)))?;
    query_ntp_addr(server, ntp_timeout).await
}

/// [`query_ntp`] against a resolved server address.
pub async fn query_ntp_addr(server: SocketAddr, ntp_timeout: Duration) -> NetworkResult<i64> {
    let bind: SocketAddr = if server.is_ipv4() {
        SocketAddr::from(([0, 0, 0, 0], 0))
    } else {
        SocketAddr::from(([0u16; 8], 0))
    };
    let socket = UdpSocket::bind(bind).await?;

    let mut request = [0u8; NTP_PACKET_SIZE];
    // LI = 0, VN = 3, Mode = 3 (client)
    request[0] = 0x1b;
    socket.send_to(&request, server).await?;

    let mut reply = [0u8; NTP_PACKET_SIZE];
    let (len, _) = timeout(ntp_timeout, socket.recv_from(&mut reply))
        .await
        .map_err(|_| NetworkError::Timeout(format!("NTP {}", server)))??;
    if len < NTP_PACKET_SIZE {
        return Err(NetworkError::Connectivity(format!("short NTP reply from {}", server)));
    }

    let seconds = u32::from_be_bytes([reply[40], reply[41], reply[42], reply[43]]) as u64;
    let fraction = u32::from_be_bytes([reply[44], reply[45], reply[46], reply[47]]) as u64;
    let server_ms = seconds
        .checked_sub(NTP_UNIX_OFFSET)
        .ok_or_else(|| NetworkError::Connectivity(format!("bad NTP time from {}", server)))?
        * 1000
        + (fraction * 1000 >> 32);
    let local_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);

    Ok(server_ms as i64 - local_ms as i64)
}

/// Check that at least one NTP server answers. Returns the host and offset.
pub async fn check_ntp(hosts: &[String], ntp_timeout: Duration) -> NetworkResult<(String, i64)> {
    for host in hosts {
        match query_ntp(host, ntp_timeout).await {
            Ok(offset_ms) => {
                info!(host = %host, offset_ms, "NTP check passed");
                return Ok((host.clone(), offset_ms));
            }
            Err(e) => debug!(host = %host, error = %e, "NTP host unreachable"),
        }
    }
    Err(NetworkError::Connectivity(format!(
        "none of {} NTP hosts answered",
        hosts.len()
    )))
}
