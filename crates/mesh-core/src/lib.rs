//! mesh-core: Shared types, configuration, and error handling for the intelligence mesh.
//!
//! This crate provides the foundational types used across all mesh components:
//! - Node types (Host, Service, Vuln, etc.) for the observation graph
//! - Edge types (Has, Runs, AffectedBy, etc.) for graph relationships
//! - Configuration structs shared by every binary
//! - The stable error-kind taxonomy from the error handling design

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod types;

pub use error::MeshError;
