//! Read operations for the observation graph: host expansion, selector
//! search, coverage statistics, vector k-NN, and the stale-target planner
//! (§4.2, §4.6).

use chrono::{DateTime, Utc};
use neo4rs::query;
use serde::{Deserialize, Serialize};

use crate::client::{GraphClient, GraphError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostRecord {
    pub ip: String,
    pub asn: Option<i64>,
    pub country_cc: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub cloud_region: Option<String>,
    pub first_seen: String,
    pub last_seen: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortRecord {
    pub number: i64,
    pub protocol: String,
    pub is_common: bool,
    pub first_seen: String,
    pub last_seen: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    pub product: String,
    pub version: String,
    pub cpe: Vec<String>,
    pub port_number: i64,
    pub protocol: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VulnRecord {
    pub cve_id: String,
    pub cvss: f64,
    pub severity: String,
    pub kev_flag: bool,
    pub confidence: f64,
}

/// Result of `queryHost`, shaped by the requested depth.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostGraph {
    pub host: Option<HostRecord>,
    pub ports: Vec<PortRecord>,
    pub services: Vec<ServiceRecord>,
    pub vulnerabilities: Vec<VulnRecord>,
}

/// Filters accepted by `querySelector`, `coverageStats`, and `planStale`.
#[derive(Debug, Clone, Default)]
pub struct Selectors {
    pub city: Option<String>,
    pub region: Option<String>,
    pub country_cc: Option<String>,
    pub asn: Option<u32>,
    pub cidr: Option<String>,
    pub cloud_region: Option<String>,
    pub service_name: Option<String>,
    pub common_port: Option<u16>,
    pub min_last_seen: Option<DateTime<Utc>>,
}

impl Selectors {
    fn where_clauses(&self) -> (Vec<String>, Vec<(&'static str, neo4rs::BoltType)>) {
        use neo4rs::BoltType;

        let mut clauses = Vec::new();
        let mut params: Vec<(&'static str, BoltType)> = Vec::new();

        if let Some(ref cc) = self.country_cc {
            clauses.push("h.country_cc = $country_cc".to_string());
            params.push(("country_cc", BoltType::from(cc.clone())));
        }
        if let Some(ref city) = self.city {
            clauses.push("h.city = $city".to_string());
            params.push(("city", BoltType::from(city.clone())));
        }
        if let Some(ref region) = self.region {
            clauses.push("h.region = $region".to_string());
            params.push(("region", BoltType::from(region.clone())));
        }
        if let Some(asn) = self.asn {
            clauses.push("h.asn = $asn".to_string());
            params.push(("asn", BoltType::from(asn as i64)));
        }
        if let Some(ref cloud_region) = self.cloud_region {
            clauses.push("h.cloud_region = $cloud_region".to_string());
            params.push(("cloud_region", BoltType::from(cloud_region.clone())));
        }
        if let Some(ref name) = self.service_name {
            clauses.push("svc.name = $service_name".to_string());
            params.push(("service_name", BoltType::from(name.clone())));
        }
        if let Some(port) = self.common_port {
            clauses.push("p.number = $common_port".to_string());
            params.push(("common_port", BoltType::from(port as i64)));
        }
        if let Some(since) = self.min_last_seen {
            clauses.push("p.last_seen >= $min_last_seen".to_string());
            params.push(("min_last_seen", BoltType::from(since.to_rfc3339())));
        }

        (clauses, params)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectorRow {
    pub ip: String,
    pub port: i64,
    pub protocol: String,
    pub service_name: Option<String>,
    pub region: Option<String>,
    pub last_seen: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoverageByGroup {
    pub key: String,
    pub count: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoverageStats {
    pub count: i64,
    pub p50_age_secs: f64,
    pub p95_age_secs: f64,
    pub p99_age_secs: f64,
    pub oldest_age_secs: f64,
    pub newest_age_secs: f64,
    pub by_service: Vec<CoverageByGroup>,
    pub by_region: Vec<CoverageByGroup>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaleTarget {
    pub ip: String,
    pub port: i64,
    pub protocol: String,
    pub service_name: Option<String>,
    pub last_seen: String,
    pub age_secs: f64,
}

#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    pub cidrs: Vec<ipnet::IpNet>,
    pub ports: Vec<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimilarityHit {
    pub cve_id: String,
    pub similarity: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VulnSummary {
    pub cve_id: String,
    pub cvss: Option<f64>,
    pub severity: String,
    pub kev_flag: bool,
}

impl GraphClient {
    /// Looks up CVSS/severity metadata for one CVE, used to enrich
    /// `vectorKNN` similarity hits before they reach the caller.
    pub async fn get_vuln_summary(&self, namespace: &str, cve_id: &str) -> Result<Option<VulnSummary>, GraphError> {
        let row = self
            .query_one(
                query(
                    "MATCH (v:Vuln {namespace: $namespace, cve_id: $cve_id})
                     RETURN v.cve_id AS cve_id, v.cvss AS cvss, v.severity AS severity, v.kev_flag AS kev_flag",
                )
                .param("namespace", namespace)
                .param("cve_id", cve_id),
            )
            .await?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(VulnSummary {
            cve_id: row.get("cve_id").unwrap_or_default(),
            cvss: row.get::<f64>("cvss").ok(),
            severity: row.get("severity").unwrap_or_default(),
            kev_flag: row.get("kev_flag").unwrap_or(false),
        }))
    }

    /// `queryHost(ip, depth) -> host graph`. `depth` has already been
    /// validated by the caller (`QUERY_DEPTH` is a C6 concern, not C2's).
    pub async fn query_host(
        &self,
        namespace: &str,
        ip: &str,
        depth: u8,
    ) -> Result<Option<HostGraph>, GraphError> {
        let host_row = self
            .query_one(
                query(
                    "MATCH (h:Host {namespace: $namespace, ip: $ip})
                     RETURN h.ip AS ip, h.asn AS asn, h.country_cc AS country_cc,
                            h.city AS city, h.region AS region, h.cloud_region AS cloud_region,
                            h.first_seen AS first_seen, h.last_seen AS last_seen",
                )
                .param("namespace", namespace)
                .param("ip", ip),
            )
            .await?;

        let Some(row) = host_row else {
            return Ok(None);
        };

        let host = HostRecord {
            ip: row.get("ip").unwrap_or_default(),
            asn: row.get::<i64>("asn").ok(),
            country_cc: row.get("country_cc").ok(),
            city: row.get("city").ok(),
            region: row.get("region").ok(),
            cloud_region: row.get("cloud_region").ok(),
            first_seen: row.get("first_seen").unwrap_or_default(),
            last_seen: row.get("last_seen").unwrap_or_default(),
        };

        let mut graph = HostGraph {
            host: Some(host),
            ..Default::default()
        };

        if depth == 0 {
            return Ok(Some(graph));
        }

        let port_rows = self
            .query_rows(
                query(
                    "MATCH (h:Host {namespace: $namespace, ip: $ip})-[:HAS]->(p:Port)
                     RETURN p.number AS number, p.protocol AS protocol, p.is_common AS is_common,
                            p.first_seen AS first_seen, p.last_seen AS last_seen",
                )
                .param("namespace", namespace)
                .param("ip", ip),
            )
            .await?;

        for row in &port_rows {
            graph.ports.push(PortRecord {
                number: row.get("number").unwrap_or_default(),
                protocol: row.get("protocol").unwrap_or_default(),
                is_common: row.get("is_common").unwrap_or(false),
                first_seen: row.get("first_seen").unwrap_or_default(),
                last_seen: row.get("last_seen").unwrap_or_default(),
            });
        }

        if depth >= 2 {
            let svc_rows = self
                .query_rows(
                    query(
                        "MATCH (h:Host {namespace: $namespace, ip: $ip})-[:HAS]->(p:Port)-[:RUNS]->(s:Service)
                         RETURN s.name AS name, s.product AS product, s.version AS version,
                                s.cpe AS cpe, p.number AS port_number, p.protocol AS protocol",
                    )
                    .param("namespace", namespace)
                    .param("ip", ip),
                )
                .await?;

            for row in &svc_rows {
                graph.services.push(ServiceRecord {
                    name: row.get("name").unwrap_or_default(),
                    product: row.get("product").unwrap_or_default(),
                    version: row.get("version").unwrap_or_default(),
                    cpe: row.get("cpe").unwrap_or_default(),
                    port_number: row.get("port_number").unwrap_or_default(),
                    protocol: row.get("protocol").unwrap_or_default(),
                });
            }
        }

        if depth >= 3 {
            let vuln_rows = self
                .query_rows(
                    query(
                        "MATCH (h:Host {namespace: $namespace, ip: $ip})-[:HAS]->(:Port)-[:RUNS]->(:Service)-[r:AFFECTED_BY]->(v:Vuln)
                         RETURN v.cve_id AS cve_id, v.cvss AS cvss, v.severity AS severity,
                                v.kev_flag AS kev_flag, r.confidence AS confidence",
                    )
                    .param("namespace", namespace)
                    .param("ip", ip),
                )
                .await?;

            for row in &vuln_rows {
                graph.vulnerabilities.push(VulnRecord {
                    cve_id: row.get("cve_id").unwrap_or_default(),
                    cvss: row.get("cvss").unwrap_or(0.0),
                    severity: row.get("severity").unwrap_or_default(),
                    kev_flag: row.get("kev_flag").unwrap_or(false),
                    confidence: row.get("confidence").unwrap_or(1.0),
                });
            }
        }

        Ok(Some(graph))
    }

    /// `querySelector(filters, limit, offset, since?) -> tuples`, ordered by
    /// `last_seen DESC, host.ip ASC, port.number ASC` for determinism.
    pub async fn query_selector(
        &self,
        namespace: &str,
        selectors: &Selectors,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<SelectorRow>, GraphError> {
        let (clauses, params) = selectors.where_clauses();

        let mut cypher = String::from(
            "MATCH (h:Host {namespace: $namespace})-[:HAS]->(p:Port)
             OPTIONAL MATCH (p)-[:RUNS]->(svc:Service)",
        );
        if !clauses.is_empty() {
            cypher.push_str(" WHERE ");
            cypher.push_str(&clauses.join(" AND "));
        }
        cypher.push_str(
            " RETURN h.ip AS ip, p.number AS port, p.protocol AS protocol, svc.name AS service_name,
                    h.region AS region, p.last_seen AS last_seen
             ORDER BY p.last_seen DESC, h.ip ASC, p.number ASC
             SKIP $offset LIMIT $limit",
        );

        let mut q = query(&cypher)
            .param("namespace", namespace)
            .param("offset", offset as i64)
            .param("limit", limit as i64);
        for (name, value) in params {
            q = q.param(name, value);
        }

        let rows = self.query_rows(q).await?;
        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            results.push(SelectorRow {
                ip: row.get("ip").unwrap_or_default(),
                port: row.get("port").unwrap_or_default(),
                protocol: row.get("protocol").unwrap_or_default(),
                service_name: row.get("service_name").ok(),
                region: row.get("region").ok(),
                last_seen: row.get("last_seen").unwrap_or_default(),
            });
        }
        Ok(results)
    }

    /// `coverageStats(filters, since?)`, computed on demand (MVP does not materialize).
    pub async fn coverage_stats(
        &self,
        namespace: &str,
        selectors: &Selectors,
    ) -> Result<CoverageStats, GraphError> {
        let rows = self.query_selector(namespace, selectors, 50_000, 0).await?;
        let now = Utc::now();

        if rows.is_empty() {
            return Ok(CoverageStats::default());
        }

        let mut ages: Vec<f64> = rows
            .iter()
            .map(|r| {
                let last_seen = DateTime::parse_from_rfc3339(&r.last_seen)
                    .map(|d| d.with_timezone(&Utc))
                    .unwrap_or(now);
                (now - last_seen).num_milliseconds() as f64 / 1000.0
            })
            .collect();
        ages.sort_by(|a, b| a.partial_cmp(b).unwrap());

        let percentile = |p: f64| -> f64 {
            let idx = ((ages.len() as f64 - 1.0) * p).round() as usize;
            ages[idx.min(ages.len() - 1)]
        };

        let mut by_service: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
        let mut by_region: std::collections::HashMap<String, i64> = std::collections::HashMap::new();
        for r in &rows {
            if let Some(ref name) = r.service_name {
                *by_service.entry(name.clone()).or_insert(0) += 1;
            }
            if let Some(ref region) = r.region {
                *by_region.entry(region.clone()).or_insert(0) += 1;
            }
        }

        Ok(CoverageStats {
            count: rows.len() as i64,
            p50_age_secs: percentile(0.50),
            p95_age_secs: percentile(0.95),
            p99_age_secs: percentile(0.99),
            oldest_age_secs: *ages.last().unwrap_or(&0.0),
            newest_age_secs: *ages.first().unwrap_or(&0.0),
            by_service: by_service
                .into_iter()
                .map(|(key, count)| CoverageByGroup { key, count })
                .collect(),
            by_region: by_region
                .into_iter()
                .map(|(key, count)| CoverageByGroup { key, count })
                .collect(),
        })
    }

    /// `vectorKNN(query_vector, k, filters) -> [(cve_id, similarity)]` using
    /// cosine similarity. Pulled into the application layer rather than a
    /// native vector index call, since the donor's store driver exposes no
    /// vector index primitive; every `vuln_doc` embedding sharing the
    /// caller's embedder is scored in-process.
    pub async fn vector_knn(
        &self,
        namespace: &str,
        query_vector: &[f32],
        k: usize,
        embedder: &str,
    ) -> Result<Vec<SimilarityHit>, GraphError> {
        let rows = self
            .query_rows(
                query(
                    "MATCH (d:VulnDoc {namespace: $namespace, embedder: $embedder})
                     WHERE d.embedding IS NOT NULL
                     RETURN d.cve_id AS cve_id, d.embedding AS embedding",
                )
                .param("namespace", namespace)
                .param("embedder", embedder),
            )
            .await?;

        let mut scored: Vec<SimilarityHit> = rows
            .iter()
            .filter_map(|row| {
                let cve_id: String = row.get("cve_id").ok()?;
                let embedding: Vec<f64> = row.get("embedding").ok()?;
                let vec32: Vec<f32> = embedding.iter().map(|v| *v as f32).collect();
                Some(SimilarityHit {
                    cve_id,
                    similarity: cosine_similarity(query_vector, &vec32),
                })
            })
            .collect();

        scored.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap());
        scored.truncate(k);
        Ok(scored)
    }

    /// Reads back `(product, version, banner_sample)` for the service
    /// running on one port, for use by the CPE-generation fan-out. Returns
    /// `None` if the port has no `RUNS` service.
    pub async fn query_service_for_port(
        &self,
        namespace: &str,
        port_key: &crate::mutations::PortKey,
    ) -> Result<Option<(String, String, Option<String>)>, GraphError> {
        let protocol_str = port_key.protocol.to_string();
        let row = self
            .query_one(
                query(
                    "MATCH (p:Port {namespace: $namespace, host_ip: $host_ip, number: $number, protocol: $protocol})-[:RUNS]->(s:Service)
                     OPTIONAL MATCH (s)-[:EVIDENCED_BY]->(b:Banner)
                     RETURN s.product AS product, s.version AS version, b.sample AS banner_sample
                     LIMIT 1",
                )
                .param("namespace", namespace)
                .param("host_ip", port_key.host_ip.clone())
                .param("number", port_key.number as i64)
                .param("protocol", protocol_str),
            )
            .await?;

        let Some(row) = row else { return Ok(None) };
        let product: String = row.get("product").unwrap_or_default();
        let version: String = row.get("version").unwrap_or_default();
        let banner_sample: Option<String> = row.get("banner_sample").ok();
        Ok(Some((product, version, banner_sample)))
    }

    /// `planStale(filters, min_age, exclusions, limit, cursor)`.
    ///
    /// The cursor is an opaque offset, stable for a given filter set: paging
    /// through the same selectors with an increasing cursor never skips or
    /// repeats a row because the underlying `ORDER BY` is deterministic.
    pub async fn plan_stale(
        &self,
        namespace: &str,
        selectors: &Selectors,
        min_age: chrono::Duration,
        exclusions: &Exclusions,
        limit: u32,
        cursor: u32,
    ) -> Result<(Vec<StaleTarget>, Option<u32>), GraphError> {
        let (clauses, params) = selectors.where_clauses();
        let now = Utc::now();
        let cutoff = now - min_age;

        let mut cypher = String::from(
            "MATCH (h:Host {namespace: $namespace})-[:HAS]->(p:Port)
             OPTIONAL MATCH (p)-[:RUNS]->(svc:Service)
             WHERE p.last_seen <= $cutoff",
        );
        if !clauses.is_empty() {
            cypher.push_str(" AND ");
            cypher.push_str(&clauses.join(" AND "));
        }
        cypher.push_str(
            " RETURN h.ip AS ip, p.number AS port, p.protocol AS protocol, svc.name AS service_name, p.last_seen AS last_seen
             ORDER BY p.last_seen ASC, h.ip ASC, p.number ASC
             SKIP $skip LIMIT $take",
        );

        // over-fetch by one to detect whether a next page exists
        let take = limit + 1;
        let mut q = query(&cypher)
            .param("namespace", namespace)
            .param("cutoff", cutoff.to_rfc3339())
            .param("skip", cursor as i64)
            .param("take", take as i64);
        for (name, value) in params {
            q = q.param(name, value);
        }

        let rows = self.query_rows(q).await?;

        let mut targets = Vec::new();
        for row in rows.iter().take(limit as usize) {
            let ip: String = row.get("ip").unwrap_or_default();
            let port: i64 = row.get("port").unwrap_or_default();
            let protocol: String = row.get("protocol").unwrap_or_default();
            let last_seen_str: String = row.get("last_seen").unwrap_or_default();

            if excluded(&ip, port as u16, exclusions) {
                continue;
            }

            let last_seen = DateTime::parse_from_rfc3339(&last_seen_str)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or(now);
            let age_secs = (now - last_seen).num_milliseconds() as f64 / 1000.0;

            targets.push(StaleTarget {
                ip,
                port,
                protocol,
                service_name: row.get("service_name").ok(),
                last_seen: last_seen_str,
                age_secs,
            });
        }

        let next_cursor = if rows.len() as u32 > limit {
            Some(cursor + limit)
        } else {
            None
        };

        Ok((targets, next_cursor))
    }
}

fn excluded(ip: &str, port: u16, exclusions: &Exclusions) -> bool {
    if exclusions.ports.contains(&port) {
        return true;
    }
    if let Ok(addr) = ip.parse::<std::net::IpAddr>() {
        if exclusions.cidrs.iter().any(|net| net.contains(&addr)) {
            return true;
        }
    }
    false
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f64 = a.iter().zip(b.iter()).map(|(x, y)| (*x as f64) * (*y as f64)).sum();
    let norm_a: f64 = a.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    let norm_b: f64 = b.iter().map(|x| (*x as f64).powi(2)).sum::<f64>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_identical_vectors_is_one() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn cosine_similarity_orthogonal_is_zero() {
        let a = vec![1.0, 0.0];
        let b = vec![0.0, 1.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-9);
    }

    #[test]
    fn cosine_similarity_empty_is_zero() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
    }

    #[test]
    fn exclusions_match_cidr_and_port() {
        let excl = Exclusions {
            cidrs: vec!["10.0.0.0/8".parse().unwrap()],
            ports: vec![22],
        };
        assert!(excluded("10.1.2.3", 80, &excl));
        assert!(excluded("1.2.3.4", 22, &excl));
        assert!(!excluded("1.2.3.4", 80, &excl));
    }
}
