//! Graph storage for the intelligence mesh — the single read/write path to
//! Neo4j for hosts, ports, services, vulnerabilities, and the provenance and
//! job-tracking metadata around them.

pub mod client;
pub mod jobs;
pub mod mutations;
pub mod queries;

pub use client::{GraphClient, GraphConfig, GraphError};
