//! GeoIP enrichment (§4.5.3): MMDB-backed lookups with an HTTP fallback,
//! run over a bounded worker pool.

use std::net::IpAddr;
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use maxminddb::geoip2;

use mesh_core::config::GeoConfig;

use crate::error::{EnrichError, Result};

#[derive(Debug, Clone)]
pub struct GeoInfo {
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub country_cc: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

/// Implemented by an optional HTTP geolocation provider, consulted only
/// when the local MMDB is unavailable or misses (§4.5.3).
#[async_trait::async_trait]
pub trait GeoHttpFallback: Send + Sync {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoInfo>;
}

pub struct NoFallback;

#[async_trait::async_trait]
impl GeoHttpFallback for NoFallback {
    async fn lookup(&self, ip: IpAddr) -> Result<GeoInfo> {
        Err(EnrichError::Geo(format!("no HTTP fallback configured for {ip}")))
    }
}

pub struct GeoResolver {
    reader: Option<maxminddb::Reader<Vec<u8>>>,
    fallback: Arc<dyn GeoHttpFallback>,
    worker_pool_size: usize,
}

impl GeoResolver {
    pub fn open(config: &GeoConfig, fallback: Arc<dyn GeoHttpFallback>) -> Self {
        let reader = maxminddb::Reader::open_readfile(&config.geoip_mmdb_path)
            .map_err(|e| {
                tracing::warn!(path = %config.geoip_mmdb_path, error = %e, "MMDB unavailable, falling back to HTTP lookups");
                e
            })
            .ok();

        Self {
            reader,
            fallback,
            worker_pool_size: config.geo_worker_pool_size.max(1),
        }
    }

    /// Resolve a batch of IPs concurrently over a bounded worker pool.
    /// Private IPs and lookup misses are recorded as `None`, never as errors.
    pub async fn resolve_batch(&self, ips: &[IpAddr]) -> Vec<(IpAddr, Option<GeoInfo>)> {
        stream::iter(ips.iter().copied())
            .map(|ip| async move { (ip, self.resolve_one(ip).await) })
            .buffer_unordered(self.worker_pool_size)
            .collect()
            .await
    }

    async fn resolve_one(&self, ip: IpAddr) -> Option<GeoInfo> {
        if is_private(&ip) {
            return None;
        }

        if let Some(ref reader) = self.reader {
            if let Ok(Some(city)) = reader.lookup::<geoip2::City>(ip) {
                return Some(geo_info_from_mmdb(city));
            }
        }

        self.fallback.lookup(ip).await.ok()
    }
}

fn geo_info_from_mmdb(city: geoip2::City) -> GeoInfo {
    let city_name = city
        .city
        .as_ref()
        .and_then(|c| c.names.as_ref())
        .and_then(|n| n.get("en"))
        .map(|s| s.to_string());

    let region_name = city
        .subdivisions
        .as_ref()
        .and_then(|s| s.first())
        .and_then(|s| s.names.as_ref())
        .and_then(|n| n.get("en"))
        .map(|s| s.to_string());

    let country = city
        .country
        .as_ref()
        .and_then(|c| c.names.as_ref())
        .and_then(|n| n.get("en"))
        .map(|s| s.to_string());

    let country_cc = city.country.as_ref().and_then(|c| c.iso_code).map(|s| s.to_string());

    let (lat, lon) = city
        .location
        .as_ref()
        .map(|l| (l.latitude, l.longitude))
        .unwrap_or((None, None));

    GeoInfo {
        city: city_name,
        region: region_name,
        country,
        country_cc,
        lat,
        lon,
    }
}

fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_ips_are_skipped() {
        assert!(is_private(&"10.1.2.3".parse().unwrap()));
        assert!(!is_private(&"1.1.1.1".parse().unwrap()));
    }
}
