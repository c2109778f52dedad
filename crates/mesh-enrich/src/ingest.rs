//! Ingest pipeline (§4.5.1): mark processing, parse NDJSON, persist in
//! host → port → service order, fan out enrichment workflows, mark
//! completed. Every step runs behind the journal so a restart mid-job
//! resumes instead of repeating already-applied writes.

use std::collections::HashSet;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use uuid::Uuid;

use mesh_core::types::{EdgeProperties, JobState, Protocol};
use mesh_graph::mutations::PortKey;
use mesh_graph::GraphClient;

use crate::asn::AsnResolver;
use crate::cpe::generate_cpes;
use crate::error::{EnrichError, Result};
use crate::geo::GeoResolver;
use crate::journal::JournaledRun;
use crate::nvd::NvdClient;

#[derive(Debug, Deserialize)]
struct ScanServiceRecord {
    name: String,
    #[serde(default)]
    product: String,
    #[serde(default)]
    version: String,
}

#[derive(Debug, Deserialize)]
struct ScanBannerRecord {
    sample: String,
}

#[derive(Debug, Deserialize)]
struct ScanTlsRecord {
    #[serde(default)]
    cn: Option<String>,
    #[serde(default)]
    sans: Vec<String>,
    #[serde(default)]
    issuer: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScanRecord {
    ip: String,
    port: u16,
    #[serde(default = "default_protocol")]
    protocol: String,
    service: Option<ScanServiceRecord>,
    banner: Option<ScanBannerRecord>,
    tls: Option<ScanTlsRecord>,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

pub struct IngestInput {
    pub job_id: Uuid,
    pub namespace: String,
    pub scanner_key: String,
    pub scan_data_bytes: Vec<u8>,
    pub observation_time: DateTime<Utc>,
}

pub struct IngestOutcome {
    pub host_count: i64,
    pub port_count: i64,
}

/// Everything the ingest pipeline fans out into, bundled so the pipeline
/// function doesn't need a dozen separate arguments.
#[derive(Clone)]
pub struct EnrichmentServices {
    pub graph: GraphClient,
    pub asn: Arc<AsnResolver>,
    pub geo: Arc<GeoResolver>,
    pub nvd: Arc<NvdClient>,
}

/// Run the full ingest pipeline for one accepted envelope. On any failure
/// after the `pending -> processing` transition, the job is marked `failed`
/// with a short machine-readable tag.
pub async fn run_ingest(services: &EnrichmentServices, input: IngestInput) -> Result<()> {
    let workflow_id = input.job_id.to_string();
    let journal = JournaledRun::load(services.graph.clone(), input.namespace.clone(), workflow_id.clone()).await?;

    services
        .graph
        .transition_job(&input.namespace, input.job_id, JobState::Processing, None, None, None)
        .await?;

    match run_steps(services, &journal, &input).await {
        Ok(outcome) => {
            services
                .graph
                .transition_job(
                    &input.namespace,
                    input.job_id,
                    JobState::Completed,
                    None,
                    Some(outcome.host_count),
                    Some(outcome.port_count),
                )
                .await?;
            Ok(())
        }
        Err(err) => {
            let tag = error_tag(&err);
            services
                .graph
                .transition_job(&input.namespace, input.job_id, JobState::Failed, Some(&tag), None, None)
                .await?;
            Err(err)
        }
    }
}

async fn run_steps(
    services: &EnrichmentServices,
    journal: &JournaledRun,
    input: &IngestInput,
) -> Result<IngestOutcome> {
    let lines: Vec<&str> = std::str::from_utf8(&input.scan_data_bytes)
        .map_err(|e| EnrichError::Mesh(mesh_core::MeshError::IngestBadJsonLine(e.to_string())))?
        .lines()
        .filter(|l| !l.trim().is_empty())
        .collect();

    if lines.is_empty() {
        return Err(EnrichError::Mesh(mesh_core::MeshError::IngestEmpty));
    }

    let mut records = Vec::new();
    for line in &lines {
        match serde_json::from_str::<ScanRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) => tracing::warn!(error = %e, line = %line, "skipping malformed scan record"),
        }
    }

    if records.is_empty() {
        return Err(EnrichError::Mesh(mesh_core::MeshError::IngestEmpty));
    }

    let mut unique_ips: HashSet<IpAddr> = HashSet::new();
    let mut unique_host_ips: HashSet<String> = HashSet::new();
    let mut unique_port_keys: HashSet<PortKey> = HashSet::new();
    let mut new_port_keys: Vec<PortKey> = Vec::new();

    for record in &records {
        let step_name = format!("persist:{}:{}:{}", record.ip, record.port, record.protocol);
        let ip = record.ip.clone();
        let observation_time = input.observation_time;
        let namespace = input.namespace.clone();
        let graph = services.graph.clone();
        let record_json = serde_json::to_string(record).unwrap_or_default();

        journal
            .step::<(), _, _>(&step_name, move || async move {
                persist_one(&graph, &namespace, &record_json, observation_time).await
            })
            .await?;

        unique_host_ips.insert(ip.clone());
        if let Ok(parsed) = IpAddr::from_str(&ip) {
            unique_ips.insert(parsed);
        }
        let port_key = PortKey {
            host_ip: ip,
            number: record.port,
            protocol: Protocol::from_str(&record.protocol).unwrap_or(Protocol::Tcp),
        };
        if unique_port_keys.insert(port_key.clone()) {
            new_port_keys.push(port_key);
        }
    }

    fan_out(services, journal, input, &unique_ips, &new_port_keys).await?;

    Ok(IngestOutcome {
        host_count: unique_host_ips.len() as i64,
        port_count: unique_port_keys.len() as i64,
    })
}

async fn persist_one(graph: &GraphClient, namespace: &str, record_json: &str, observation_time: DateTime<Utc>) -> Result<()> {
    let record: ScanRecord = serde_json::from_str(record_json)
        .map_err(|e| EnrichError::Mesh(mesh_core::MeshError::IngestBadJsonLine(e.to_string())))?;

    let protocol = Protocol::from_str(&record.protocol).unwrap_or(Protocol::Tcp);

    graph.upsert_host(namespace, &record.ip, observation_time).await?;
    graph
        .upsert_port(namespace, &record.ip, record.port, protocol, false, observation_time)
        .await?;

    let port_key = PortKey { host_ip: record.ip.clone(), number: record.port, protocol };

    if let Some(ref service) = record.service {
        let fp = mesh_core::fingerprint::service_fingerprint(&service.name, &service.product, &service.version);
        graph
            .upsert_service(namespace, &port_key, &service.name, &service.product, &service.version, &fp, observation_time)
            .await?;
    }

    if let Some(ref banner) = record.banner {
        let sha = mesh_core::fingerprint::banner_hash(&banner.sample);
        graph
            .upsert_banner(namespace, &port_key, &sha, &banner.sample, observation_time)
            .await?;
    }

    if let Some(ref tls) = record.tls {
        let der_like = tls.cn.clone().unwrap_or_default();
        let sha = mesh_core::fingerprint::cert_hash(der_like.as_bytes());
        graph
            .upsert_tls_cert(
                namespace,
                &port_key,
                &sha,
                tls.cn.as_deref(),
                &tls.sans,
                tls.issuer.as_deref(),
                observation_time,
            )
            .await?;
    }

    graph
        .record_observed_at(
            namespace,
            &port_key,
            &Uuid::new_v4().to_string(),
            &EdgeProperties::default(),
            observation_time,
        )
        .await?;

    Ok(())
}

async fn fan_out(
    services: &EnrichmentServices,
    journal: &JournaledRun,
    input: &IngestInput,
    unique_ips: &HashSet<IpAddr>,
    new_port_keys: &[PortKey],
) -> Result<()> {
    let ips: Vec<IpAddr> = unique_ips.iter().copied().collect();
    let cancel = tokio_util::sync::CancellationToken::new();

    let asn_graph = services.graph.clone();
    let asn = services.asn.clone();
    let namespace = input.namespace.clone();
    let asn_observation_time = input.observation_time;
    let asn_ips = ips.clone();
    journal
        .step::<(), _, _>(&format!("{}:asn", input.job_id), move || {
            let asn = asn.clone();
            let graph = asn_graph.clone();
            let namespace = namespace.clone();
            let cancel = cancel.clone();
            async move {
                let resolved = asn
                    .resolve_batch(&asn_ips, &cancel)
                    .await
                    .map_err(|e| EnrichError::Whois(e.to_string()))?;
                for (ip, info) in resolved {
                    graph
                        .upsert_asn(&namespace, &ip.to_string(), info.asn, &info.org, &info.country_cc, asn_observation_time)
                        .await?;
                }
                Ok(())
            }
        })
        .await?;

    let geo = services.geo.clone();
    let geo_graph = services.graph.clone();
    let namespace = input.namespace.clone();
    let geo_observation_time = input.observation_time;
    let geo_ips = ips.clone();
    journal
        .step::<(), _, _>(&format!("{}:geo", input.job_id), move || async move {
            let results = geo.resolve_batch(&geo_ips).await;
            for (ip, maybe_info) in results {
                if let Some(info) = maybe_info {
                    let city = info.city.unwrap_or_default();
                    let region = info.region.unwrap_or_default();
                    let cc = info.country_cc.unwrap_or_default();
                    geo_graph
                        .upsert_geo(&namespace, &ip.to_string(), &city, &region, &cc, None, geo_observation_time)
                        .await?;
                }
            }
            Ok(())
        })
        .await?;

    let nvd = services.nvd.clone();
    let cpe_graph = services.graph.clone();
    let namespace = input.namespace.clone();
    let cpe_observation_time = input.observation_time;
    let cpe_port_keys = new_port_keys.to_vec();
    let cpe_cancel = tokio_util::sync::CancellationToken::new();
    journal
        .step::<(), _, _>(&format!("{}:cpe", input.job_id), move || async move {
            for port_key in &cpe_port_keys {
                let row = cpe_graph
                    .query_service_for_port(&namespace, port_key)
                    .await
                    .map_err(EnrichError::Graph)?;
                let Some((product, version, banner_sample)) = row else { continue };
                let cpes = generate_cpes(&product, &version, banner_sample.as_deref());
                if cpes.is_empty() {
                    continue;
                }
                cpe_graph.attach_cpe(&namespace, port_key, &cpes).await?;

                for cpe in &cpes {
                    let hits = nvd.lookup_cpe(cpe, &cpe_cancel).await.map_err(|e| EnrichError::Nvd(e.to_string()))?;
                    for hit in hits {
                        let confidence = hit
                            .vulnerable_cpes
                            .iter()
                            .filter_map(|c| crate::nvd::correlation_confidence(cpe, c))
                            .fold(0.0_f64, f64::max);
                        if confidence <= 0.0 {
                            continue;
                        }
                        cpe_graph
                            .upsert_vuln(
                                &namespace,
                                &hit.cve_id,
                                hit.cvss,
                                &format!("{:?}", hit.severity).to_lowercase(),
                                false,
                                None,
                                cpe_observation_time,
                            )
                            .await?;
                        let title = crate::nvd::derive_title(&hit.cve_id, &hit.description);
                        cpe_graph
                            .upsert_vuln_doc(
                                &namespace,
                                &hit.cve_id,
                                &title,
                                &hit.description,
                                std::slice::from_ref(cpe),
                                None,
                                None,
                                cpe_observation_time,
                            )
                            .await?;
                        cpe_graph
                            .relate_affected_by(&namespace, port_key, &hit.cve_id, confidence, cpe_observation_time)
                            .await?;
                    }
                }
            }
            Ok(())
        })
        .await?;

    Ok(())
}

fn error_tag(err: &EnrichError) -> String {
    match err {
        EnrichError::Mesh(inner) => inner.code().to_string(),
        other => other.to_string(),
    }
}
