//! Configuration structs shared by every mesh binary.
//!
//! Loaded from (in priority order), matching the donor's layering:
//! 1. Environment variables (component-prefixed, `__` separator)
//! 2. A config file (`mesh.toml`), if present
//! 3. The defaults below

use serde::{Deserialize, Serialize};

fn default_store_url() -> String {
    "bolt://localhost:7687".to_string()
}

fn default_store_user() -> String {
    "neo4j".to_string()
}

fn default_store_pass() -> String {
    "mesh-dev".to_string()
}

fn default_store_namespace() -> String {
    "default".to_string()
}

fn default_store_database() -> String {
    "neo4j".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_url")]
    pub store_url: String,
    #[serde(default = "default_store_user")]
    pub store_user: String,
    #[serde(default = "default_store_pass")]
    pub store_pass: String,
    #[serde(default = "default_store_namespace")]
    pub store_namespace: String,
    #[serde(default = "default_store_database")]
    pub store_database: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            store_url: default_store_url(),
            store_user: default_store_user(),
            store_pass: default_store_pass(),
            store_namespace: default_store_namespace(),
            store_database: default_store_database(),
        }
    }
}

fn default_asn_rate_limit() -> u32 {
    100
}

fn default_asn_cache_ttl_secs() -> u64 {
    24 * 3600
}

fn default_asn_provider_addr() -> String {
    "whois.radb.net:43".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AsnConfig {
    #[serde(default = "default_asn_rate_limit")]
    pub asn_rate_limit: u32,
    #[serde(default = "default_asn_cache_ttl_secs")]
    pub asn_cache_ttl_secs: u64,
    #[serde(default = "default_asn_provider_addr")]
    pub asn_provider_addr: String,
}

impl Default for AsnConfig {
    fn default() -> Self {
        Self {
            asn_rate_limit: default_asn_rate_limit(),
            asn_cache_ttl_secs: default_asn_cache_ttl_secs(),
            asn_provider_addr: default_asn_provider_addr(),
        }
    }
}

fn default_mmdb_path() -> String {
    "/var/lib/GeoIP/GeoLite2-City.mmdb".to_string()
}

fn default_geo_worker_pool_size() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeoConfig {
    #[serde(default = "default_mmdb_path")]
    pub geoip_mmdb_path: String,
    pub geoip_api_key: Option<String>,
    #[serde(default = "default_geo_worker_pool_size")]
    pub geo_worker_pool_size: usize,
}

impl Default for GeoConfig {
    fn default() -> Self {
        Self {
            geoip_mmdb_path: default_mmdb_path(),
            geoip_api_key: None,
            geo_worker_pool_size: default_geo_worker_pool_size(),
        }
    }
}

fn default_nvd_base_url() -> String {
    "https://services.nvd.nist.gov/rest/json/cpes/2.0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NvdConfig {
    pub nvd_api_key: Option<String>,
    #[serde(default = "default_nvd_base_url")]
    pub nvd_base_url: String,
}

impl Default for NvdConfig {
    fn default() -> Self {
        Self {
            nvd_api_key: None,
            nvd_base_url: default_nvd_base_url(),
        }
    }
}

impl NvdConfig {
    /// §4.5.4: 5 req/30s without a key, 50 req/30s with one.
    pub fn rate_limit_per_30s(&self) -> u32 {
        if self.nvd_api_key.is_some() {
            50
        } else {
            5
        }
    }
}

fn default_admit_clock_skew_secs() -> i64 {
    300
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    #[serde(default = "default_admit_clock_skew_secs")]
    pub admit_clock_skew_secs: i64,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            admit_clock_skew_secs: default_admit_clock_skew_secs(),
            port: default_port(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_env_table() {
        let store = StoreConfig::default();
        assert_eq!(store.store_url, "bolt://localhost:7687");
        assert_eq!(store.store_namespace, "default");

        let asn = AsnConfig::default();
        assert_eq!(asn.asn_rate_limit, 100);
        assert_eq!(asn.asn_cache_ttl_secs, 86_400);

        let geo = GeoConfig::default();
        assert_eq!(geo.geoip_mmdb_path, "/var/lib/GeoIP/GeoLite2-City.mmdb");
        assert_eq!(geo.geo_worker_pool_size, 10);

        let ingest = IngestConfig::default();
        assert_eq!(ingest.admit_clock_skew_secs, 300);
    }

    #[test]
    fn nvd_rate_limit_scales_with_api_key() {
        let mut nvd = NvdConfig::default();
        assert_eq!(nvd.rate_limit_per_30s(), 5);
        nvd.nvd_api_key = Some("key".to_string());
        assert_eq!(nvd.rate_limit_per_30s(), 50);
    }
}
