//! NVD correlation (§4.5.4): queries the NVD REST API per distinct CPE,
//! caches responses for 24h, and derives `(cve_id, cvss, severity, kev_flag)`
//! tuples with a CVSS-version preference of v3.1 > v3.0 > v2.0.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use mesh_core::config::NvdConfig;
use mesh_core::types::Severity;

use crate::error::{EnrichError, Result};

const CACHE_TTL: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Clone)]
pub struct CveHit {
    pub cve_id: String,
    pub cvss: Option<f64>,
    pub severity: Severity,
    /// CPE criteria the NVD response marked `vulnerable=true` for this CVE.
    pub vulnerable_cpes: Vec<String>,
    /// English-language description, used verbatim as the `vuln_doc` body.
    pub description: String,
}

struct CacheEntry {
    hits: Vec<CveHit>,
    cached_at: Instant,
}

pub struct NvdClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    cache: DashMap<String, CacheEntry>,
    limiter: DefaultDirectRateLimiter,
}

impl NvdClient {
    pub fn new(config: &NvdConfig) -> Self {
        let rate = NonZeroU32::new(config.rate_limit_per_30s()).unwrap();
        Self {
            http: reqwest::Client::new(),
            base_url: config.nvd_base_url.clone(),
            api_key: config.nvd_api_key.clone(),
            cache: DashMap::new(),
            limiter: RateLimiter::direct(Quota::with_period(Duration::from_secs(30)).unwrap().allow_burst(rate)),
        }
    }

    /// Look up the CVEs associated with one CPE, consulting the cache first.
    pub async fn lookup_cpe(&self, cpe: &str, cancel: &CancellationToken) -> Result<Vec<CveHit>> {
        if let Some(entry) = self.cache.get(cpe) {
            if entry.cached_at.elapsed() < CACHE_TTL {
                return Ok(entry.hits.clone());
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(EnrichError::Nvd("cancelled waiting for rate limit".into())),
            permit = self.limiter.until_ready() => permit,
        };

        let mut request = self.http.get(&self.base_url).query(&[("cpeName", cpe)]);
        if let Some(ref key) = self.api_key {
            request = request.header("apiKey", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EnrichError::Nvd(format!("request failed: {e}")))?;

        if response.status().is_server_error() {
            return Err(EnrichError::Nvd(format!("nvd 5xx: {}", response.status())));
        }
        if response.status().is_client_error() {
            return Err(EnrichError::Nvd(format!("nvd 4xx: {}", response.status())));
        }

        let body: NvdResponse = response
            .json()
            .await
            .map_err(|e| EnrichError::Nvd(format!("decode failed: {e}")))?;

        let hits = parse_nvd_response(&body);
        self.cache.insert(
            cpe.to_string(),
            CacheEntry { hits: hits.clone(), cached_at: Instant::now() },
        );
        Ok(hits)
    }
}

#[derive(Debug, Deserialize)]
struct NvdResponse {
    #[serde(default)]
    vulnerabilities: Vec<NvdVulnerability>,
}

#[derive(Debug, Deserialize)]
struct NvdVulnerability {
    cve: NvdCve,
}

#[derive(Debug, Deserialize)]
struct NvdCve {
    id: String,
    #[serde(default)]
    metrics: NvdMetrics,
    #[serde(default)]
    configurations: Vec<NvdConfiguration>,
    #[serde(default)]
    descriptions: Vec<NvdDescription>,
}

#[derive(Debug, Deserialize)]
struct NvdDescription {
    lang: String,
    value: String,
}

#[derive(Debug, Deserialize, Default)]
struct NvdMetrics {
    #[serde(rename = "cvssMetricV31", default)]
    v31: Vec<NvdCvssMetric>,
    #[serde(rename = "cvssMetricV30", default)]
    v30: Vec<NvdCvssMetric>,
    #[serde(rename = "cvssMetricV2", default)]
    v2: Vec<NvdCvssMetric>,
}

#[derive(Debug, Deserialize)]
struct NvdCvssMetric {
    #[serde(rename = "cvssData")]
    cvss_data: NvdCvssData,
}

#[derive(Debug, Deserialize)]
struct NvdCvssData {
    #[serde(rename = "baseScore")]
    base_score: f64,
}

#[derive(Debug, Deserialize, Default)]
struct NvdConfiguration {
    #[serde(default)]
    nodes: Vec<NvdNode>,
}

#[derive(Debug, Deserialize, Default)]
struct NvdNode {
    #[serde(rename = "cpeMatch", default)]
    cpe_match: Vec<NvdCpeMatch>,
}

#[derive(Debug, Deserialize)]
struct NvdCpeMatch {
    vulnerable: bool,
    criteria: String,
}

fn parse_nvd_response(body: &NvdResponse) -> Vec<CveHit> {
    body.vulnerabilities
        .iter()
        .map(|entry| {
            let cve = &entry.cve;
            let cvss = preferred_cvss(&cve.metrics);
            let vulnerable_cpes = cve
                .configurations
                .iter()
                .flat_map(|c| c.nodes.iter())
                .flat_map(|n| n.cpe_match.iter())
                .filter(|m| m.vulnerable)
                .map(|m| m.criteria.clone())
                .collect();

            CveHit {
                cve_id: cve.id.clone(),
                cvss,
                severity: Severity::from_cvss(cvss),
                vulnerable_cpes,
                description: english_description(&cve.descriptions),
            }
        })
        .collect()
}

/// NVD ships one description per language; we only ever display English.
fn english_description(descriptions: &[NvdDescription]) -> String {
    descriptions
        .iter()
        .find(|d| d.lang == "en")
        .or_else(|| descriptions.first())
        .map(|d| d.value.clone())
        .unwrap_or_default()
}

/// Short label for a CVE, derived from its description since NVD has no
/// dedicated title field. Falls back to the CVE id when there's no text.
pub fn derive_title(cve_id: &str, description: &str) -> String {
    let first_sentence = description.split(". ").next().unwrap_or(description).trim();
    if first_sentence.is_empty() {
        cve_id.to_string()
    } else if first_sentence.chars().count() > 120 {
        let truncated: String = first_sentence.chars().take(120).collect();
        format!("{truncated}…")
    } else {
        first_sentence.to_string()
    }
}

/// CVSS v3.1 > v3.0 > v2.0, first entry in each bucket.
fn preferred_cvss(metrics: &NvdMetrics) -> Option<f64> {
    metrics
        .v31
        .first()
        .or_else(|| metrics.v30.first())
        .or_else(|| metrics.v2.first())
        .map(|m| m.cvss_data.base_score)
}

/// Confidence per §4.5.4: 1.0 for exact version match, 0.8 for wildcard.
pub fn correlation_confidence(service_cpe: &str, nvd_cpe_criteria: &str) -> Option<f64> {
    let service_parts: Vec<&str> = service_cpe.split(':').collect();
    let nvd_parts: Vec<&str> = nvd_cpe_criteria.split(':').collect();
    if service_parts.len() < 6 || nvd_parts.len() < 6 {
        return None;
    }

    // vendor + product must match exactly; version may be wildcarded on either side.
    if service_parts[3] != nvd_parts[3] || service_parts[4] != nvd_parts[4] {
        return None;
    }

    if service_parts[5] == nvd_parts[5] && service_parts[5] != "*" {
        Some(1.0)
    } else if service_parts[5] == "*" || nvd_parts[5] == "*" {
        Some(0.8)
    } else {
        None
    }
}

/// Deduplicates `(service_id, cve_id)` correlation pairs, keeping the
/// highest confidence seen for each.
pub fn dedupe_correlations(pairs: Vec<(String, String, f64)>) -> HashMap<(String, String), f64> {
    let mut out: HashMap<(String, String), f64> = HashMap::new();
    for (service_id, cve_id, confidence) in pairs {
        out.entry((service_id, cve_id))
            .and_modify(|existing| {
                if confidence > *existing {
                    *existing = confidence;
                }
            })
            .or_insert(confidence);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_version_match_is_full_confidence() {
        let service = "cpe:2.3:a:nginx:nginx:1.24.0:*:*:*:*:*:*:*";
        let nvd = "cpe:2.3:a:nginx:nginx:1.24.0:*:*:*:*:*:*:*";
        assert_eq!(correlation_confidence(service, nvd), Some(1.0));
    }

    #[test]
    fn wildcard_version_is_partial_confidence() {
        let service = "cpe:2.3:a:nginx:nginx:*:*:*:*:*:*:*:*";
        let nvd = "cpe:2.3:a:nginx:nginx:1.24.0:*:*:*:*:*:*:*";
        assert_eq!(correlation_confidence(service, nvd), Some(0.8));
    }

    #[test]
    fn mismatched_product_does_not_correlate() {
        let service = "cpe:2.3:a:nginx:nginx:1.24.0:*:*:*:*:*:*:*";
        let nvd = "cpe:2.3:a:apache:http_server:2.4.0:*:*:*:*:*:*:*";
        assert_eq!(correlation_confidence(service, nvd), None);
    }

    #[test]
    fn dedupe_keeps_highest_confidence() {
        let pairs = vec![
            ("svc1".to_string(), "CVE-1".to_string(), 0.8),
            ("svc1".to_string(), "CVE-1".to_string(), 1.0),
        ];
        let deduped = dedupe_correlations(pairs);
        assert_eq!(deduped[&("svc1".to_string(), "CVE-1".to_string())], 1.0);
        assert_eq!(deduped.len(), 1);
    }

    #[test]
    fn preferred_cvss_prefers_newest_version() {
        let metrics = NvdMetrics {
            v31: vec![NvdCvssMetric { cvss_data: NvdCvssData { base_score: 9.8 } }],
            v30: vec![NvdCvssMetric { cvss_data: NvdCvssData { base_score: 7.0 } }],
            v2: vec![],
        };
        assert_eq!(preferred_cvss(&metrics), Some(9.8));
    }

    #[test]
    fn english_description_prefers_en_over_other_languages() {
        let descriptions = vec![
            NvdDescription { lang: "es".to_string(), value: "en espanol".to_string() },
            NvdDescription { lang: "en".to_string(), value: "in english".to_string() },
        ];
        assert_eq!(english_description(&descriptions), "in english");
    }

    #[test]
    fn english_description_falls_back_to_first_when_no_en() {
        let descriptions = vec![NvdDescription { lang: "fr".to_string(), value: "en francais".to_string() }];
        assert_eq!(english_description(&descriptions), "en francais");
    }

    #[test]
    fn derive_title_takes_first_sentence() {
        let description = "A buffer overflow exists in libfoo. It allows remote code execution.";
        assert_eq!(derive_title("CVE-2024-1234", description), "A buffer overflow exists in libfoo");
    }

    #[test]
    fn derive_title_falls_back_to_cve_id_when_empty() {
        assert_eq!(derive_title("CVE-2024-1234", ""), "CVE-2024-1234");
    }
}
