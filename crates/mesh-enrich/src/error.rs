//! Error types for the enrichment pipelines.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnrichError {
    #[error("graph error: {0}")]
    Graph(#[from] mesh_graph::GraphError),

    #[error(transparent)]
    Mesh(#[from] mesh_core::MeshError),

    #[error("whois provider error: {0}")]
    Whois(String),

    #[error("geoip lookup error: {0}")]
    Geo(String),

    #[error("nvd provider error: {0}")]
    Nvd(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, EnrichError>;
