//! CLI entry point for running the enrichment pipelines standalone, useful
//! for replaying a scan submission outside the HTTP ingest surface.

use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use mesh_core::config::{AsnConfig, GeoConfig, NvdConfig, StoreConfig};
use mesh_graph::{GraphClient, GraphConfig};

use mesh_enrich::asn::AsnResolver;
use mesh_enrich::geo::{GeoResolver, NoFallback};
use mesh_enrich::ingest::{EnrichmentServices, IngestInput};
use mesh_enrich::nvd::NvdClient;

#[derive(Parser)]
#[command(name = "mesh-enrich")]
#[command(about = "Run the ingest/enrichment pipeline for one scan submission")]
struct Cli {
    /// Namespace to ingest into.
    #[arg(long, default_value = "default")]
    namespace: String,

    /// The contributor's public key, for job attribution.
    #[arg(long)]
    scanner_key: String,

    /// Path to a newline-delimited JSON scan data file.
    #[arg(long)]
    file: String,

    /// Config file prefix (default: mesh).
    #[arg(short, long, default_value = "mesh")]
    config: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let cli = Cli::parse();

    let store_config = load_config::<StoreConfig>(&cli.config, "store")?;
    let graph_config = GraphConfig {
        uri: store_config.store_url.clone(),
        user: store_config.store_user.clone(),
        password: store_config.store_pass.clone(),
        ..Default::default()
    };
    let graph = GraphClient::connect(&graph_config).await?;
    tracing::info!("connected to graph store");

    let asn_config = load_config::<AsnConfig>(&cli.config, "asn")?;
    let geo_config = load_config::<GeoConfig>(&cli.config, "geo")?;
    let nvd_config = load_config::<NvdConfig>(&cli.config, "nvd")?;

    let services = EnrichmentServices {
        graph: graph.clone(),
        asn: Arc::new(AsnResolver::new(&asn_config)),
        geo: Arc::new(GeoResolver::open(&geo_config, Arc::new(NoFallback))),
        nvd: Arc::new(NvdClient::new(&nvd_config)),
    };

    let scan_data_bytes = std::fs::read(&cli.file)?;
    let job_id = graph.create_job(&cli.namespace, &cli.scanner_key).await?;
    tracing::info!(job_id = %job_id, "job created");

    let input = IngestInput {
        job_id,
        namespace: cli.namespace,
        scanner_key: cli.scanner_key,
        scan_data_bytes,
        observation_time: chrono::Utc::now(),
    };

    mesh_enrich::ingest::run_ingest(&services, input).await?;
    tracing::info!(job_id = %job_id, "ingest complete");

    Ok(())
}

fn load_config<T: serde::de::DeserializeOwned + Default>(file_prefix: &str, section: &str) -> anyhow::Result<T> {
    let cfg = config::Config::builder()
        .add_source(config::File::with_name(file_prefix).required(false))
        .add_source(
            config::Environment::with_prefix("MESH")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;

    match cfg.get::<T>(section) {
        Ok(c) => Ok(c),
        Err(_) => Ok(T::default()),
    }
}
