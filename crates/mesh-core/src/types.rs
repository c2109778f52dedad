//! Shared data model for the intelligence mesh.
//!
//! Every node kind here mirrors a row in §3 of the data model: identity is a
//! natural key (an IP, a fingerprint, a CVE id), never an opaque surrogate,
//! so that repeated observations merge instead of duplicating.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Namespace scoping all graph operations; the MVP's only tenancy boundary.
pub type Namespace = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Unknown,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Derived from a CVSS base score per the common NVD bands.
    pub fn from_cvss(score: Option<f64>) -> Self {
        match score {
            None => Severity::Unknown,
            Some(s) if s >= 9.0 => Severity::Critical,
            Some(s) if s >= 7.0 => Severity::High,
            Some(s) if s >= 4.0 => Severity::Medium,
            Some(_) => Severity::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for JobState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    pub ip: IpAddr,
    pub asn: Option<u32>,
    pub country_cc: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub cloud_region: Option<String>,
    pub last_scanned_at: Option<DateTime<Utc>>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Port {
    pub host_ip: IpAddr,
    pub number: u16,
    pub protocol: Protocol,
    pub is_common: bool,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    /// Hex SHA-256 of `lowercase(name) || '|' || lowercase(product) || '|' || lowercase(version)`.
    pub fingerprint: String,
    pub name: String,
    pub product: String,
    pub version: String,
    pub cpe: Vec<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Banner {
    /// Hex SHA-256 of the canonical sample.
    pub sha256: String,
    pub sample: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsCert {
    pub sha256: String,
    pub cn: Option<String>,
    pub sans: Vec<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    pub issuer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asn {
    pub number: u32,
    pub org: String,
    pub country_cc: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct City {
    pub name: String,
    pub cc: String,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Region {
    pub name: String,
    pub cc: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Country {
    pub cc: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudRegion {
    pub provider: String,
    pub code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommonPort {
    pub number: u16,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vuln {
    pub cve_id: String,
    pub cvss: Option<f64>,
    pub severity: Severity,
    pub kev_flag: bool,
    pub published: Option<DateTime<Utc>>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VulnDoc {
    pub cve_id: String,
    pub title: String,
    pub description: String,
    pub cpe: Vec<String>,
    pub embedding: Option<Vec<f32>>,
    pub embedder: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub uuid::Uuid);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl JobId {
    pub fn new() -> Self {
        JobId(uuid::Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub namespace: Namespace,
    pub state: JobState,
    pub scanner_key: String,
    pub error_message: Option<String>,
    pub host_count: Option<u64>,
    pub port_count: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// All relationship kinds in the graph. Serialized SCREAMING_SNAKE_CASE to
/// match the Cypher relationship-type convention used by `as_cypher`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeType {
    Has,
    Runs,
    EvidencedBy,
    AffectedBy,
    InCity,
    InRegion,
    InCountry,
    InAsn,
    InCloud,
    IsCommon,
    ObservedAt,
}

impl EdgeType {
    pub fn as_cypher(&self) -> &'static str {
        match self {
            EdgeType::Has => "HAS",
            EdgeType::Runs => "RUNS",
            EdgeType::EvidencedBy => "EVIDENCED_BY",
            EdgeType::AffectedBy => "AFFECTED_BY",
            EdgeType::InCity => "IN_CITY",
            EdgeType::InRegion => "IN_REGION",
            EdgeType::InCountry => "IN_COUNTRY",
            EdgeType::InAsn => "IN_ASN",
            EdgeType::InCloud => "IN_CLOUD",
            EdgeType::IsCommon => "IS_COMMON",
            EdgeType::ObservedAt => "OBSERVED_AT",
        }
    }
}

/// Properties carried on edges; only the fields relevant to the edge kind are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeProperties {
    pub confidence: Option<f64>,
    pub scan_id: Option<String>,
    pub contributor_key: Option<String>,
    pub trust: Option<bool>,
    #[serde(default)]
    pub extra: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_bands() {
        assert_eq!(Severity::from_cvss(Some(9.8)), Severity::Critical);
        assert_eq!(Severity::from_cvss(Some(7.5)), Severity::High);
        assert_eq!(Severity::from_cvss(Some(5.0)), Severity::Medium);
        assert_eq!(Severity::from_cvss(Some(1.0)), Severity::Low);
        assert_eq!(Severity::from_cvss(None), Severity::Unknown);
    }

    #[test]
    fn protocol_roundtrip() {
        assert_eq!("tcp".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("UDP".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert!("sctp".parse::<Protocol>().is_err());
    }

    #[test]
    fn edge_type_serializes_screaming_snake_case() {
        let s = serde_json::to_string(&EdgeType::AffectedBy).unwrap();
        assert_eq!(s, "\"AFFECTED_BY\"");
        assert_eq!(EdgeType::IsCommon.as_cypher(), "IS_COMMON");
    }

    #[test]
    fn job_state_display() {
        assert_eq!(JobState::Processing.to_string(), "processing");
    }
}
