//! ASN enrichment (§4.5.2): resolves IPs to `{asn, org, country_cc}` via a
//! bulk WHOIS provider, with a TTL'd cache and a per-provider token bucket.

use std::collections::HashMap;
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use mesh_core::config::AsnConfig;

use crate::error::{EnrichError, Result};

const BATCH_SIZE: usize = 50;

#[derive(Debug, Clone)]
pub struct AsnInfo {
    pub asn: u32,
    pub org: String,
    pub country_cc: String,
}

struct CacheEntry {
    info: AsnInfo,
    cached_at: Instant,
}

pub struct AsnResolver {
    provider_addr: String,
    ttl: Duration,
    cache: DashMap<IpAddr, CacheEntry>,
    limiter: DefaultDirectRateLimiter,
}

impl AsnResolver {
    pub fn new(config: &AsnConfig) -> Self {
        let rate = NonZeroU32::new(config.asn_rate_limit.max(1)).unwrap();
        Self {
            provider_addr: config.asn_provider_addr.clone(),
            ttl: Duration::from_secs(config.asn_cache_ttl_secs),
            cache: DashMap::new(),
            limiter: RateLimiter::direct(Quota::per_minute(rate)),
        }
    }

    /// Resolve a batch of IPs, skipping private addresses and cache hits.
    /// Remote lookups are chunked at `BATCH_SIZE` IPs per token acquisition.
    pub async fn resolve_batch(
        &self,
        ips: &[IpAddr],
        cancel: &CancellationToken,
    ) -> Result<HashMap<IpAddr, AsnInfo>> {
        let mut resolved = HashMap::new();
        let mut misses = Vec::new();

        for ip in ips {
            if is_private(ip) {
                continue;
            }
            match self.cache.get(ip) {
                Some(entry) if entry.cached_at.elapsed() < self.ttl => {
                    resolved.insert(*ip, entry.info.clone());
                }
                _ => misses.push(*ip),
            }
        }

        for chunk in misses.chunks(BATCH_SIZE) {
            tokio::select! {
                _ = cancel.cancelled() => return Err(EnrichError::Whois("cancelled waiting for rate limit".into())),
                permit = self.limiter.until_ready() => permit,
            };

            let batch_result = self.whois_bulk_query(chunk).await?;
            let now = Instant::now();
            for (ip, info) in batch_result {
                self.cache.insert(ip, CacheEntry { info: info.clone(), cached_at: now });
                resolved.insert(ip, info);
            }
        }

        Ok(resolved)
    }

    async fn whois_bulk_query(&self, ips: &[IpAddr]) -> Result<HashMap<IpAddr, AsnInfo>> {
        let mut stream = TcpStream::connect(&self.provider_addr)
            .await
            .map_err(|e| EnrichError::Whois(format!("connect {}: {e}", self.provider_addr)))?;

        let mut request = String::from("begin\n");
        for ip in ips {
            request.push_str(&format!(" -v {ip}\n"));
        }
        request.push_str("end\n");

        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|e| EnrichError::Whois(format!("write: {e}")))?;

        let mut buf = String::new();
        stream
            .read_to_string(&mut buf)
            .await
            .map_err(|e| EnrichError::Whois(format!("read: {e}")))?;

        Ok(parse_bulk_response(&buf))
    }
}

fn parse_bulk_response(body: &str) -> HashMap<IpAddr, AsnInfo> {
    let mut out = HashMap::new();
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((ip, info)) = parse_whois_line(line) {
            out.insert(ip, info);
        }
    }
    out
}

/// Parses one `ASN | IP | prefix | CC | registry | allocated | AS_name` line.
fn parse_whois_line(line: &str) -> Option<(IpAddr, AsnInfo)> {
    let fields: Vec<&str> = line.split('|').map(str::trim).collect();
    if fields.len() < 7 {
        return None;
    }

    let asn: u32 = fields[0].parse().ok()?;
    let ip: IpAddr = fields[1].parse().ok()?;
    let country_cc = fields[3].to_string();
    let org = fields[6].to_string();

    Some((ip, AsnInfo { asn, org, country_cc }))
}

fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_multicast(),
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_multicast() || (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_whois_line() {
        let line = "15169   | 8.8.8.8          | 8.8.8.0/24          | US | arin     | 1992-12-01 | GOOGLE, US";
        let (ip, info) = parse_whois_line(line).unwrap();
        assert_eq!(ip, "8.8.8.8".parse::<IpAddr>().unwrap());
        assert_eq!(info.asn, 15169);
        assert_eq!(info.country_cc, "US");
        assert_eq!(info.org, "GOOGLE, US");
    }

    #[test]
    fn rejects_short_lines() {
        assert!(parse_whois_line("15169 | 8.8.8.8 | US").is_none());
    }

    #[test]
    fn skips_comment_and_blank_lines() {
        let body = "begin\n# a comment\n\n15169 | 8.8.8.8 | 8.8.8.0/24 | US | arin | 1992-12-01 | GOOGLE, US\nend\n";
        let parsed = parse_bulk_response(body);
        assert_eq!(parsed.len(), 1);
    }

    #[test]
    fn private_ips_are_skipped() {
        assert!(is_private(&"10.0.0.1".parse().unwrap()));
        assert!(is_private(&"192.168.1.1".parse().unwrap()));
        assert!(is_private(&"127.0.0.1".parse().unwrap()));
        assert!(!is_private(&"8.8.8.8".parse().unwrap()));
    }
}
