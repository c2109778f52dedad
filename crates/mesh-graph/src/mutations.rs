//! Write operations for the observation graph (§4.2 of the design).
//!
//! All mutations use MERGE (upsert) semantics keyed by a natural identity —
//! never a surrogate id — so that repeated ingest of the same observation
//! never creates a duplicate node. `first_seen` is set only in `ON CREATE`;
//! `last_seen` is set in both branches, so it always moves forward.

use chrono::{DateTime, Utc};
use neo4rs::query;

use mesh_core::types::{EdgeProperties, EdgeType, Protocol};

use crate::client::{GraphClient, GraphError};

/// The composite natural key identifying one `(host, port)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PortKey {
    pub host_ip: String,
    pub number: u16,
    pub protocol: Protocol,
}

impl GraphClient {
    // ── Host / Port / Service ────────────────────────────────────

    /// `upsertHost(ip, observation_time) -> host_id`.
    pub async fn upsert_host(
        &self,
        namespace: &str,
        ip: &str,
        observation_time: DateTime<Utc>,
    ) -> Result<String, GraphError> {
        let q = query(
            "MERGE (n:Host {namespace: $namespace, ip: $ip})
             ON CREATE SET n.first_seen = $now, n.last_seen = $now, n.last_scanned_at = $now
             ON MATCH SET
               n.last_seen = CASE WHEN $now > n.last_seen THEN $now ELSE n.last_seen END,
               n.last_scanned_at = $now",
        )
        .param("namespace", namespace)
        .param("ip", ip)
        .param("now", observation_time.to_rfc3339());

        self.run(q).await?;
        Ok(ip.to_string())
    }

    /// `upsertPort(host_id, number, protocol, observation_time) -> port_id`.
    pub async fn upsert_port(
        &self,
        namespace: &str,
        host_ip: &str,
        number: u16,
        protocol: Protocol,
        is_common: bool,
        observation_time: DateTime<Utc>,
    ) -> Result<String, GraphError> {
        let protocol_str = protocol.to_string();

        let q = query(
            "MATCH (h:Host {namespace: $namespace, ip: $host_ip})
             MERGE (p:Port {namespace: $namespace, host_ip: $host_ip, number: $number, protocol: $protocol})
             ON CREATE SET p.is_common = $is_common, p.first_seen = $now, p.last_seen = $now
             ON MATCH SET
               p.last_seen = CASE WHEN $now > p.last_seen THEN $now ELSE p.last_seen END
             MERGE (h)-[r:HAS]->(p)
             ON CREATE SET r.first_seen = $now, r.last_seen = $now
             ON MATCH SET r.last_seen = CASE WHEN $now > r.last_seen THEN $now ELSE r.last_seen END",
        )
        .param("namespace", namespace)
        .param("host_ip", host_ip)
        .param("number", number as i64)
        .param("protocol", protocol_str.clone())
        .param("is_common", is_common)
        .param("now", observation_time.to_rfc3339());

        self.run(q).await?;
        Ok(format!("{host_ip}:{number}:{protocol_str}"))
    }

    /// `upsertService(port_id, name, product, version, ..., observation_time) -> service_id`.
    ///
    /// Identity is keyed by the owning port, which is what makes "every
    /// service has exactly one owning port" hold by construction; `fp`
    /// (§4.2's `SHA-256(name|product|version)`) is stored as an attribute for
    /// fingerprint comparisons, not as the graph key. Scalar fields follow
    /// last-write-wins (§9's resolved open question): `ON MATCH SET`
    /// unconditionally overwrites `name`/`product`/`version`/`fp` with the
    /// newest observation.
    pub async fn upsert_service(
        &self,
        namespace: &str,
        port_key: &PortKey,
        name: &str,
        product: &str,
        version: &str,
        fp: &str,
        observation_time: DateTime<Utc>,
    ) -> Result<String, GraphError> {
        let protocol_str = port_key.protocol.to_string();

        let q = query(
            "MATCH (p:Port {namespace: $namespace, host_ip: $host_ip, number: $number, protocol: $protocol})
             MERGE (s:Service {namespace: $namespace, host_ip: $host_ip, number: $number, protocol: $protocol})
             ON CREATE SET
               s.name = $name, s.product = $product, s.version = $version, s.fp = $fp,
               s.cpe = [], s.first_seen = $now, s.last_seen = $now
             ON MATCH SET
               s.name = $name, s.product = $product, s.version = $version, s.fp = $fp,
               s.last_seen = CASE WHEN $now > s.last_seen THEN $now ELSE s.last_seen END
             MERGE (p)-[r:RUNS]->(s)
             ON CREATE SET r.first_seen = $now, r.last_seen = $now
             ON MATCH SET r.last_seen = CASE WHEN $now > r.last_seen THEN $now ELSE r.last_seen END",
        )
        .param("namespace", namespace)
        .param("host_ip", port_key.host_ip.clone())
        .param("number", port_key.number as i64)
        .param("protocol", protocol_str.clone())
        .param("name", name)
        .param("product", product)
        .param("version", version)
        .param("fp", fp)
        .param("now", observation_time.to_rfc3339());

        self.run(q).await?;
        Ok(format!("{}:{}:{}", port_key.host_ip, port_key.number, protocol_str))
    }

    /// `attachCPE(service_id, cpe_list)` — union-merge into the CPE set.
    pub async fn attach_cpe(
        &self,
        namespace: &str,
        port_key: &PortKey,
        cpe_list: &[String],
    ) -> Result<(), GraphError> {
        let protocol_str = port_key.protocol.to_string();

        let q = query(
            "MATCH (s:Service {namespace: $namespace, host_ip: $host_ip, number: $number, protocol: $protocol})
             SET s.cpe = apoc.coll.toSet(coalesce(s.cpe, []) + $cpe_list)",
        )
        .param("namespace", namespace)
        .param("host_ip", port_key.host_ip.clone())
        .param("number", port_key.number as i64)
        .param("protocol", protocol_str)
        .param("cpe_list", cpe_list.to_vec());

        self.run(q).await
    }

    /// Attach a banner sample to a service via `EVIDENCED_BY`.
    pub async fn upsert_banner(
        &self,
        namespace: &str,
        port_key: &PortKey,
        sha256: &str,
        sample: &str,
        observation_time: DateTime<Utc>,
    ) -> Result<(), GraphError> {
        let protocol_str = port_key.protocol.to_string();

        let q = query(
            "MATCH (s:Service {namespace: $namespace, host_ip: $host_ip, number: $number, protocol: $protocol})
             MERGE (b:Banner {namespace: $namespace, sha256: $sha256})
             ON CREATE SET b.sample = $sample, b.first_seen = $now, b.last_seen = $now
             ON MATCH SET b.last_seen = CASE WHEN $now > b.last_seen THEN $now ELSE b.last_seen END
             MERGE (s)-[r:EVIDENCED_BY]->(b)
             ON CREATE SET r.first_seen = $now, r.last_seen = $now
             ON MATCH SET r.last_seen = CASE WHEN $now > r.last_seen THEN $now ELSE r.last_seen END",
        )
        .param("namespace", namespace)
        .param("host_ip", port_key.host_ip.clone())
        .param("number", port_key.number as i64)
        .param("protocol", protocol_str)
        .param("sha256", sha256)
        .param("sample", sample)
        .param("now", observation_time.to_rfc3339());

        self.run(q).await
    }

    /// Attach a TLS certificate to a service via `EVIDENCED_BY`.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_tls_cert(
        &self,
        namespace: &str,
        port_key: &PortKey,
        sha256: &str,
        cn: Option<&str>,
        sans: &[String],
        issuer: Option<&str>,
        observation_time: DateTime<Utc>,
    ) -> Result<(), GraphError> {
        let protocol_str = port_key.protocol.to_string();

        let q = query(
            "MATCH (s:Service {namespace: $namespace, host_ip: $host_ip, number: $number, protocol: $protocol})
             MERGE (t:TlsCert {namespace: $namespace, sha256: $sha256})
             ON CREATE SET t.cn = $cn, t.sans = $sans, t.issuer = $issuer
             ON MATCH SET t.cn = $cn, t.sans = $sans, t.issuer = $issuer
             MERGE (s)-[r:EVIDENCED_BY]->(t)
             ON CREATE SET r.first_seen = $now, r.last_seen = $now
             ON MATCH SET r.last_seen = CASE WHEN $now > r.last_seen THEN $now ELSE r.last_seen END",
        )
        .param("namespace", namespace)
        .param("host_ip", port_key.host_ip.clone())
        .param("number", port_key.number as i64)
        .param("protocol", protocol_str)
        .param("sha256", sha256)
        .param("cn", cn.unwrap_or_default())
        .param("sans", sans.to_vec())
        .param("issuer", issuer.unwrap_or_default())
        .param("now", observation_time.to_rfc3339());

        self.run(q).await
    }

    // ── Geo / ASN ────────────────────────────────────────────────

    /// `upsertGeo(host_id, city, region, country_cc, cloud_region?)`.
    ///
    /// Creates/merges the `city -> region -> country` chain and links the
    /// host with `IN_CITY`. `IN_CITY` is deduplicated by the `MERGE` on the
    /// relationship itself, satisfying §4.5.3's idempotence requirement.
    pub async fn upsert_geo(
        &self,
        namespace: &str,
        host_ip: &str,
        city: &str,
        region: &str,
        country_cc: &str,
        cloud_region: Option<(&str, &str)>,
        observation_time: DateTime<Utc>,
    ) -> Result<(), GraphError> {
        let q = query(
            "MATCH (h:Host {namespace: $namespace, ip: $host_ip})
             MERGE (co:Country {namespace: $namespace, cc: $country_cc})
             ON CREATE SET co.name = $country_cc
             MERGE (r:Region {namespace: $namespace, name: $region, cc: $country_cc})
             MERGE (r)-[:IN_COUNTRY]->(co)
             MERGE (c:City {namespace: $namespace, name: $city, cc: $country_cc})
             MERGE (c)-[:IN_REGION]->(r)
             MERGE (h)-[hc:IN_CITY]->(c)
             ON CREATE SET hc.first_seen = $now, hc.last_seen = $now
             ON MATCH SET hc.last_seen = CASE WHEN $now > hc.last_seen THEN $now ELSE hc.last_seen END
             SET h.city = $city, h.region = $region, h.country_cc = $country_cc",
        )
        .param("namespace", namespace)
        .param("host_ip", host_ip)
        .param("city", city)
        .param("region", region)
        .param("country_cc", country_cc)
        .param("now", observation_time.to_rfc3339());

        self.run(q).await?;

        if let Some((provider, code)) = cloud_region {
            let q2 = query(
                "MATCH (h:Host {namespace: $namespace, ip: $host_ip})
                 MERGE (cr:CloudRegion {namespace: $namespace, provider: $provider, code: $code})
                 MERGE (h)-[r:IN_CLOUD]->(cr)
                 ON CREATE SET r.first_seen = $now, r.last_seen = $now
                 ON MATCH SET r.last_seen = CASE WHEN $now > r.last_seen THEN $now ELSE r.last_seen END
                 SET h.cloud_region = $code",
            )
            .param("namespace", namespace)
            .param("host_ip", host_ip)
            .param("provider", provider)
            .param("code", code)
            .param("now", observation_time.to_rfc3339());

            self.run(q2).await?;
        }

        Ok(())
    }

    /// `upsertASN(host_id, asn_number, org, country_cc)`.
    pub async fn upsert_asn(
        &self,
        namespace: &str,
        host_ip: &str,
        asn_number: u32,
        org: &str,
        country_cc: &str,
        observation_time: DateTime<Utc>,
    ) -> Result<(), GraphError> {
        let q = query(
            "MATCH (h:Host {namespace: $namespace, ip: $host_ip})
             MERGE (a:Asn {namespace: $namespace, number: $number})
             ON CREATE SET a.org = $org, a.country_cc = $country_cc
             ON MATCH SET a.org = $org, a.country_cc = $country_cc
             MERGE (h)-[r:IN_ASN]->(a)
             ON CREATE SET r.first_seen = $now, r.last_seen = $now
             ON MATCH SET r.last_seen = CASE WHEN $now > r.last_seen THEN $now ELSE r.last_seen END
             SET h.asn = $number",
        )
        .param("namespace", namespace)
        .param("host_ip", host_ip)
        .param("number", asn_number as i64)
        .param("org", org)
        .param("country_cc", country_cc)
        .param("now", observation_time.to_rfc3339());

        self.run(q).await
    }

    // ── Vulnerabilities ──────────────────────────────────────────

    /// `upsertVuln(cve_id, cvss, severity, kev_flag, published)`.
    pub async fn upsert_vuln(
        &self,
        namespace: &str,
        cve_id: &str,
        cvss: Option<f64>,
        severity: &str,
        kev_flag: bool,
        published: Option<DateTime<Utc>>,
        observation_time: DateTime<Utc>,
    ) -> Result<(), GraphError> {
        let q = query(
            "MERGE (v:Vuln {namespace: $namespace, cve_id: $cve_id})
             ON CREATE SET
               v.cvss = $cvss, v.severity = $severity, v.kev_flag = $kev_flag,
               v.published = $published, v.first_seen = $now, v.last_seen = $now
             ON MATCH SET
               v.cvss = $cvss, v.severity = $severity, v.kev_flag = $kev_flag,
               v.published = $published,
               v.last_seen = CASE WHEN $now > v.last_seen THEN $now ELSE v.last_seen END",
        )
        .param("namespace", namespace)
        .param("cve_id", cve_id)
        .param("cvss", cvss.unwrap_or(0.0))
        .param("severity", severity)
        .param("kev_flag", kev_flag)
        .param("published", published.map(|d| d.to_rfc3339()).unwrap_or_default())
        .param("now", observation_time.to_rfc3339());

        self.run(q).await
    }

    /// `upsertVulnDoc(cve_id, title, description, cpe_list, embedding?)`.
    #[allow(clippy::too_many_arguments)]
    pub async fn upsert_vuln_doc(
        &self,
        namespace: &str,
        cve_id: &str,
        title: &str,
        description: &str,
        cpe_list: &[String],
        embedding: Option<&[f32]>,
        embedder: Option<&str>,
        observation_time: DateTime<Utc>,
    ) -> Result<(), GraphError> {
        let embedding_vec: Vec<f64> = embedding
            .map(|e| e.iter().map(|f| *f as f64).collect())
            .unwrap_or_default();

        let q = query(
            "MERGE (d:VulnDoc {namespace: $namespace, cve_id: $cve_id})
             ON CREATE SET
               d.title = $title, d.description = $description, d.cpe = $cpe,
               d.embedding = $embedding, d.embedder = $embedder,
               d.first_seen = $now, d.last_seen = $now
             ON MATCH SET
               d.title = $title, d.description = $description,
               d.cpe = apoc.coll.toSet(coalesce(d.cpe, []) + $cpe),
               d.embedding = CASE WHEN size($embedding) > 0 THEN $embedding ELSE d.embedding END,
               d.embedder = CASE WHEN $embedder <> '' THEN $embedder ELSE d.embedder END,
               d.last_seen = CASE WHEN $now > d.last_seen THEN $now ELSE d.last_seen END",
        )
        .param("namespace", namespace)
        .param("cve_id", cve_id)
        .param("title", title)
        .param("description", description)
        .param("cpe", cpe_list.to_vec())
        .param("embedding", embedding_vec)
        .param("embedder", embedder.unwrap_or_default())
        .param("now", observation_time.to_rfc3339());

        self.run(q).await
    }

    /// `relateAffectedBy(service_id, cve_id, confidence)`.
    pub async fn relate_affected_by(
        &self,
        namespace: &str,
        port_key: &PortKey,
        cve_id: &str,
        confidence: f64,
        observation_time: DateTime<Utc>,
    ) -> Result<(), GraphError> {
        let protocol_str = port_key.protocol.to_string();

        let q = query(
            "MATCH (s:Service {namespace: $namespace, host_ip: $host_ip, number: $number, protocol: $protocol})
             MATCH (v:Vuln {namespace: $namespace, cve_id: $cve_id})
             MERGE (s)-[r:AFFECTED_BY]->(v)
             ON CREATE SET r.confidence = $confidence, r.first_seen = $now, r.last_seen = $now
             ON MATCH SET
               r.confidence = $confidence,
               r.last_seen = CASE WHEN $now > r.last_seen THEN $now ELSE r.last_seen END",
        )
        .param("namespace", namespace)
        .param("host_ip", port_key.host_ip.clone())
        .param("number", port_key.number as i64)
        .param("protocol", protocol_str)
        .param("cve_id", cve_id)
        .param("confidence", confidence)
        .param("now", observation_time.to_rfc3339());

        self.run(q).await
    }

    /// Ensure a `common_port` reference node exists and link a port to it via `IS_COMMON`.
    pub async fn upsert_common_port(
        &self,
        namespace: &str,
        port_key: &PortKey,
        label: &str,
        observation_time: DateTime<Utc>,
    ) -> Result<(), GraphError> {
        let protocol_str = port_key.protocol.to_string();

        let q = query(
            "MATCH (p:Port {namespace: $namespace, host_ip: $host_ip, number: $number, protocol: $protocol})
             MERGE (cp:CommonPort {namespace: $namespace, number: $number})
             ON CREATE SET cp.label = $label
             MERGE (p)-[r:IS_COMMON]->(cp)
             ON CREATE SET r.first_seen = $now, r.last_seen = $now
             ON MATCH SET r.last_seen = CASE WHEN $now > r.last_seen THEN $now ELSE r.last_seen END",
        )
        .param("namespace", namespace)
        .param("host_ip", port_key.host_ip.clone())
        .param("number", port_key.number as i64)
        .param("protocol", protocol_str)
        .param("label", label)
        .param("now", observation_time.to_rfc3339());

        self.run(q).await
    }

    /// Record provenance metadata for one observation via `OBSERVED_AT`.
    ///
    /// §3 names the edge's target only as "metadata (scan id, contributor
    /// key, trust bool, timestamp)" without giving it a node kind of its own;
    /// this repository materializes that target as a per-scan `Observation`
    /// node so the edge has somewhere real to point.
    pub async fn record_observed_at(
        &self,
        namespace: &str,
        port_key: &PortKey,
        scan_id: &str,
        properties: &EdgeProperties,
        observation_time: DateTime<Utc>,
    ) -> Result<(), GraphError> {
        let protocol_str = port_key.protocol.to_string();
        let _ = EdgeType::ObservedAt; // documents which edge kind this writes

        let q = query(
            "MATCH (s:Service {namespace: $namespace, host_ip: $host_ip, number: $number, protocol: $protocol})
             MERGE (o:Observation {namespace: $namespace, scan_id: $scan_id, host_ip: $host_ip, number: $number, protocol: $protocol})
             ON CREATE SET
               o.contributor_key = $contributor_key, o.trust = $trust, o.timestamp = $now
             MERGE (s)-[r:OBSERVED_AT]->(o)
             ON CREATE SET r.first_seen = $now, r.last_seen = $now
             ON MATCH SET r.last_seen = CASE WHEN $now > r.last_seen THEN $now ELSE r.last_seen END",
        )
        .param("namespace", namespace)
        .param("host_ip", port_key.host_ip.clone())
        .param("number", port_key.number as i64)
        .param("protocol", protocol_str)
        .param("scan_id", scan_id)
        .param("contributor_key", properties.contributor_key.clone().unwrap_or_default())
        .param("trust", properties.trust.unwrap_or(false))
        .param("now", observation_time.to_rfc3339());

        self.run(q).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_key_formats_stable() {
        let key = PortKey {
            host_ip: "8.8.8.8".to_string(),
            number: 53,
            protocol: Protocol::Udp,
        };
        assert_eq!(key.protocol.to_string(), "udp");
    }
}
