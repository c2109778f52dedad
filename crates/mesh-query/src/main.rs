//! HTTP entry point for the intelligence mesh: the signed-envelope ingest
//! endpoint and the freshness planner / query surface, behind one Axum
//! router (§6).

use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{fmt, EnvFilter};
use uuid::Uuid;

use mesh_core::config::{AsnConfig, GeoConfig, IngestConfig, NvdConfig, StoreConfig};
use mesh_core::types::JobState;
use mesh_core::MeshError;
use mesh_graph::jobs::JobFilter;
use mesh_graph::queries::{Exclusions, Selectors};
use mesh_graph::{GraphClient, GraphConfig};

use mesh_enrich::asn::AsnResolver;
use mesh_enrich::geo::{GeoResolver, NoFallback};
use mesh_enrich::ingest::{EnrichmentServices, IngestInput};
use mesh_enrich::nvd::NvdClient;

use mesh_query::embedder::NoEmbedder;
use mesh_query::{planner, ApiError, Embedder};

/// Bounded depth of the ingest worker queue; saturation is surfaced as
/// `429 RATE_LIMIT` rather than an unbounded backlog.
const INGEST_QUEUE_CAPACITY: usize = 1_000;
const INGEST_WORKER_COUNT: usize = 8;

#[derive(Parser)]
#[command(name = "mesh-query")]
#[command(about = "Ingest and query HTTP surface for the intelligence mesh")]
struct Cli {
    /// Config file prefix (default: mesh).
    #[arg(short, long, default_value = "mesh")]
    config: String,
}

struct IngestTask {
    services: EnrichmentServices,
    input: IngestInput,
}

#[derive(Clone)]
struct AppState {
    graph: GraphClient,
    namespace: String,
    admit_clock_skew_secs: i64,
    ingest_tx: mpsc::Sender<IngestTask>,
    enrichment: EnrichmentServices,
    embedder: Arc<dyn Embedder>,
    embedder_id: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    let cli = Cli::parse();

    let store_config = load_config::<StoreConfig>(&cli.config, "store")?;
    let ingest_config = load_config::<IngestConfig>(&cli.config, "ingest")?;
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

    let enrichment = EnrichmentServices {
        graph: graph.clone(),
        asn: Arc::new(AsnResolver::new(&asn_config)),
        geo: Arc::new(GeoResolver::open(&geo_config, Arc::new(NoFallback))),
        nvd: Arc::new(NvdClient::new(&nvd_config)),
    };

    let (ingest_tx, ingest_rx) = mpsc::channel(INGEST_QUEUE_CAPACITY);
    spawn_ingest_workers(ingest_rx, INGEST_WORKER_COUNT);

    let state = AppState {
        graph,
        namespace: store_config.store_namespace,
        admit_clock_skew_secs: ingest_config.admit_clock_skew_secs,
        ingest_tx,
        enrichment,
        embedder: Arc::new(NoEmbedder),
        embedder_id: "none".to_string(),
    };

    let app = Router::new()
        .route("/v1/ingest", post(ingest))
        .route("/v1/host/:ip", get(get_host))
        .route("/v1/plan", post(post_plan))
        .route("/v1/coverage", get(get_coverage))
        .route("/v1/search", get(get_search))
        .route("/v1/similar", post(post_similar))
        .route("/v1/jobs", get(list_jobs))
        .route("/v1/jobs/:id", get(get_job))
        .route("/health", get(health))
        .route("/ready", get(ready))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let port = ingest_config.port;
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown");
        })
        .await?;

    Ok(())
}

fn spawn_ingest_workers(rx: mpsc::Receiver<IngestTask>, count: usize) {
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    for _ in 0..count {
        let rx = rx.clone();
        tokio::spawn(async move {
            loop {
                let task = { rx.lock().await.recv().await };
                let Some(task) = task else { break };
                let job_id = task.input.job_id;
                if let Err(e) = mesh_enrich::ingest::run_ingest(&task.services, task.input).await {
                    tracing::error!(job_id = %job_id, error = %e, "ingest job failed");
                }
            }
        });
    }
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn ready(State(s): State<AppState>) -> StatusCode {
    if s.ingest_tx.capacity() > 0 {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

#[derive(Debug, Deserialize)]
struct IngestBody {
    data: String,
    public_key: String,
    signature: String,
    timestamp: i64,
}

#[derive(Debug, Serialize)]
struct IngestResponse {
    job_id: String,
    status: &'static str,
}

async fn ingest(State(s): State<AppState>, Json(body): Json<IngestBody>) -> Result<impl IntoResponse, ApiError> {
    let envelope = mesh_verify::Envelope {
        data: body.data,
        public_key: body.public_key.clone(),
        signature: body.signature,
        timestamp: body.timestamp,
    };

    let verified = mesh_verify::verify_with_skew(&envelope, Utc::now(), s.admit_clock_skew_secs, &())?;

    let permit = s
        .ingest_tx
        .try_reserve()
        .map_err(|_| ApiError(MeshError::IngestQueueFull))?;

    let job_id = s.graph.create_job(&s.namespace, &body.public_key).await?;

    let input = IngestInput {
        job_id,
        namespace: s.namespace.clone(),
        scanner_key: body.public_key,
        scan_data_bytes: verified.data,
        observation_time: verified.observation_time,
    };

    permit.send(IngestTask {
        services: s.enrichment.clone(),
        input,
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            job_id: job_id.to_string(),
            status: "accepted",
        }),
    ))
}

#[derive(Debug, Deserialize, Default)]
struct SelectorParams {
    city: Option<String>,
    region: Option<String>,
    country_cc: Option<String>,
    asn: Option<u32>,
    cidr: Option<String>,
    cloud_region: Option<String>,
    service_name: Option<String>,
    common_port: Option<u16>,
    since: Option<String>,
}

impl SelectorParams {
    fn into_selectors(self) -> Result<Selectors, MeshError> {
        let min_last_seen = match self.since {
            Some(ref raw) => Some(Utc::now() - planner::parse_duration(raw)?),
            None => None,
        };
        Ok(Selectors {
            city: self.city,
            region: self.region,
            country_cc: self.country_cc,
            asn: self.asn,
            cidr: self.cidr,
            cloud_region: self.cloud_region,
            service_name: self.service_name,
            common_port: self.common_port,
            min_last_seen,
        })
    }
}

#[derive(Debug, Deserialize)]
struct HostParams {
    depth: Option<u8>,
    since: Option<String>,
}

async fn get_host(
    State(s): State<AppState>,
    Path(ip): Path<String>,
    Query(params): Query<HostParams>,
) -> Result<impl IntoResponse, ApiError> {
    let depth = params.depth.unwrap_or(2);
    let since = match params.since {
        Some(ref raw) => Some(planner::parse_duration(raw)?),
        None => None,
    };

    match planner::host_query(&s.graph, &s.namespace, &ip, depth, since).await? {
        Some(graph) => Ok((StatusCode::OK, Json(graph)).into_response()),
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
}

#[derive(Debug, Deserialize)]
struct PlanExclude {
    #[serde(default)]
    ip_ranges: Vec<String>,
    #[serde(default)]
    ports: Vec<u16>,
}

#[derive(Debug, Deserialize)]
struct PlanBody {
    #[serde(default)]
    selectors: SelectorParams,
    min_age: String,
    #[serde(default)]
    exclude: PlanExclude,
    limit: Option<u32>,
    cursor: Option<u32>,
}

#[derive(Debug, Serialize)]
struct Pagination {
    has_more: bool,
    next_cursor: Option<u32>,
}

async fn post_plan(State(s): State<AppState>, Json(body): Json<PlanBody>) -> Result<impl IntoResponse, ApiError> {
    let selectors = body.selectors.into_selectors()?;
    let min_age = planner::parse_duration(&body.min_age)?;

    let mut cidrs = Vec::with_capacity(body.exclude.ip_ranges.len());
    for raw in &body.exclude.ip_ranges {
        let net = raw
            .parse::<ipnet::IpNet>()
            .map_err(|_| MeshError::QueryBadInput(format!("invalid exclude CIDR: {raw}")))?;
        cidrs.push(net);
    }
    let exclusions = Exclusions {
        cidrs,
        ports: body.exclude.ports,
    };

    let (targets, next_cursor, _limit) = planner::plan_query(
        &s.graph,
        &s.namespace,
        &selectors,
        min_age,
        &exclusions,
        body.limit,
        body.cursor.unwrap_or(0),
    )
    .await?;

    Ok(Json(serde_json::json!({
        "plan_id": Uuid::new_v4().to_string(),
        "targets": targets,
        "pagination": Pagination { has_more: next_cursor.is_some(), next_cursor },
        "stats": { "count": targets.len() },
    })))
}

async fn get_coverage(State(s): State<AppState>, Query(params): Query<SelectorParams>) -> Result<impl IntoResponse, ApiError> {
    let selectors = params.into_selectors()?;
    let stats = planner::coverage_query(&s.graph, &s.namespace, &selectors).await?;
    Ok(Json(stats))
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(flatten)]
    selectors: SelectorParams,
    limit: Option<u32>,
    cursor: Option<u32>,
}

async fn get_search(State(s): State<AppState>, Query(params): Query<SearchParams>) -> Result<impl IntoResponse, ApiError> {
    let offset = params.cursor.unwrap_or(0);
    let selectors = params.selectors.into_selectors()?;
    let (rows, limit) = planner::selector_query(&s.graph, &s.namespace, &selectors, params.limit, offset).await?;

    let has_more = rows.len() as u32 == limit;
    let next_cursor = if has_more { Some(offset + limit) } else { None };

    Ok(Json(serde_json::json!({
        "results": rows,
        "pagination": Pagination { has_more, next_cursor },
    })))
}

#[derive(Debug, Deserialize)]
struct SimilarBody {
    query: String,
    #[serde(default = "default_k")]
    k: usize,
}

fn default_k() -> usize {
    10
}

#[derive(Debug, Serialize)]
struct SimilarHitResponse {
    cve_id: String,
    similarity: f64,
    cvss: Option<f64>,
    severity: Option<String>,
}

async fn post_similar(State(s): State<AppState>, Json(body): Json<SimilarBody>) -> Result<impl IntoResponse, ApiError> {
    let result = planner::similarity_query(
        &s.graph,
        s.embedder.as_ref(),
        &s.namespace,
        &body.query,
        body.k,
        &s.embedder_id,
    )
    .await?;

    if result.degraded {
        return Ok(Json(serde_json::json!({ "degraded": true, "results": [] })));
    }

    let mut results = Vec::with_capacity(result.hits.len());
    for hit in result.hits {
        let summary = s.graph.get_vuln_summary(&s.namespace, &hit.cve_id).await?;
        results.push(SimilarHitResponse {
            cve_id: hit.cve_id,
            similarity: hit.similarity,
            cvss: summary.as_ref().and_then(|v| v.cvss),
            severity: summary.map(|v| v.severity),
        });
    }

    Ok(Json(serde_json::json!({ "degraded": false, "results": results })))
}

#[derive(Debug, Deserialize)]
struct JobsQuery {
    state: Option<String>,
    scanner: Option<String>,
    limit: Option<u32>,
    offset: Option<u32>,
}

async fn list_jobs(State(s): State<AppState>, Query(params): Query<JobsQuery>) -> Result<impl IntoResponse, ApiError> {
    let state = match params.state {
        Some(raw) => Some(
            JobState::from_str(&raw).map_err(|_| MeshError::QueryBadInput(format!("unknown job state: {raw}")))?,
        ),
        None => None,
    };
    let filter = JobFilter {
        state,
        scanner_key: params.scanner,
    };
    let limit = planner::clamp_limit(params.limit)?;
    let jobs = s
        .graph
        .list_jobs(&s.namespace, &filter, limit, params.offset.unwrap_or(0))
        .await?;
    Ok(Json(jobs))
}

async fn get_job(State(s): State<AppState>, Path(id): Path<String>) -> Result<impl IntoResponse, ApiError> {
    let uuid = Uuid::parse_str(&id).map_err(|_| MeshError::QueryBadInput(format!("invalid job id: {id}")))?;
    match s.graph.get_job(&s.namespace, uuid).await? {
        Some(job) => Ok((StatusCode::OK, Json(job)).into_response()),
        None => Ok(StatusCode::NOT_FOUND.into_response()),
    }
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
