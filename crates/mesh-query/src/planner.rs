//! Freshness planner and query surface (§4.6): validates caller input,
//! delegates to the graph store, and shapes the depth-gated host lookup,
//! selector search, on-demand coverage stats, stale-target plan, and
//! embedding similarity search.

use chrono::{DateTime, Duration, Utc};
use mesh_core::MeshError;
use mesh_graph::queries::{CoverageStats, Exclusions, HostGraph, Selectors, SelectorRow, SimilarityHit, StaleTarget};
use mesh_graph::GraphClient;

use crate::embedder::Embedder;

/// `depth>5` fails with `QUERY_DEPTH`.
pub const MAX_DEPTH: u8 = 5;
pub const DEFAULT_PAGE_LIMIT: u32 = 5_000;
pub const HARD_PAGE_LIMIT: u32 = 50_000;

pub fn validate_depth(depth: u8) -> Result<u8, MeshError> {
    if depth > MAX_DEPTH {
        return Err(MeshError::QueryDepth(depth));
    }
    Ok(depth)
}

/// `limit=0` is rejected; anything above the hard cap is clamped rather
/// than rejected.
pub fn clamp_limit(limit: Option<u32>) -> Result<u32, MeshError> {
    match limit {
        Some(0) => Err(MeshError::QueryBadInput("limit must be >= 1".to_string())),
        Some(n) if n > HARD_PAGE_LIMIT => Ok(HARD_PAGE_LIMIT),
        Some(n) => Ok(n),
        None => Ok(DEFAULT_PAGE_LIMIT),
    }
}

/// Parses the `since=<duration>` query parameter shape used across the
/// query surface: an integer followed by one of `s`, `m`, `h`, `d`.
pub fn parse_duration(raw: &str) -> Result<Duration, MeshError> {
    let raw = raw.trim();
    if raw.len() < 2 {
        return Err(MeshError::QueryBadInput(format!("invalid duration: {raw}")));
    }
    let (num, unit) = raw.split_at(raw.len() - 1);
    let n: i64 = num
        .parse()
        .map_err(|_| MeshError::QueryBadInput(format!("invalid duration: {raw}")))?;
    match unit {
        "s" => Ok(Duration::seconds(n)),
        "m" => Ok(Duration::minutes(n)),
        "h" => Ok(Duration::hours(n)),
        "d" => Ok(Duration::days(n)),
        other => Err(MeshError::QueryBadInput(format!("unknown duration unit: {other}"))),
    }
}

pub async fn host_query(
    graph: &GraphClient,
    namespace: &str,
    ip: &str,
    depth: u8,
    since: Option<Duration>,
) -> Result<Option<HostGraph>, MeshError> {
    let depth = validate_depth(depth)?;
    let mut result = graph.query_host(namespace, ip, depth).await.map_err(store_err)?;
    if let (Some(graph), Some(since)) = (result.as_mut(), since) {
        let cutoff = Utc::now() - since;
        retain_fresh_ports(graph, cutoff);
    }
    Ok(result)
}

fn retain_fresh_ports(graph: &mut HostGraph, cutoff: DateTime<Utc>) {
    graph.ports.retain(|p| {
        DateTime::parse_from_rfc3339(&p.last_seen)
            .map(|d| d.with_timezone(&Utc) >= cutoff)
            .unwrap_or(true)
    });
}

pub async fn selector_query(
    graph: &GraphClient,
    namespace: &str,
    selectors: &Selectors,
    limit: Option<u32>,
    offset: u32,
) -> Result<(Vec<SelectorRow>, u32), MeshError> {
    let limit = clamp_limit(limit)?;
    let rows = graph
        .query_selector(namespace, selectors, limit, offset)
        .await
        .map_err(store_err)?;
    Ok((rows, limit))
}

pub async fn coverage_query(
    graph: &GraphClient,
    namespace: &str,
    selectors: &Selectors,
) -> Result<CoverageStats, MeshError> {
    graph.coverage_stats(namespace, selectors).await.map_err(store_err)
}

pub async fn plan_query(
    graph: &GraphClient,
    namespace: &str,
    selectors: &Selectors,
    min_age: Duration,
    exclusions: &Exclusions,
    limit: Option<u32>,
    cursor: u32,
) -> Result<(Vec<StaleTarget>, Option<u32>, u32), MeshError> {
    let limit = clamp_limit(limit)?;
    let (targets, next_cursor) = graph
        .plan_stale(namespace, selectors, min_age, exclusions, limit, cursor)
        .await
        .map_err(store_err)?;
    Ok((targets, next_cursor, limit))
}

pub struct SimilarityResult {
    pub hits: Vec<SimilarityHit>,
    pub degraded: bool,
}

/// Embeds `query_text` through the opaque external embedder, then runs
/// `C2.vectorKNN`. An unreachable embedder degrades the response instead
/// of failing the request.
pub async fn similarity_query(
    graph: &GraphClient,
    embedder: &dyn Embedder,
    namespace: &str,
    query_text: &str,
    k: usize,
    embedder_id: &str,
) -> Result<SimilarityResult, MeshError> {
    if query_text.trim().is_empty() {
        return Err(MeshError::QueryBadInput("query text must not be empty".to_string()));
    }

    match embedder.embed(query_text).await {
        Ok(vector) => {
            let hits = graph
                .vector_knn(namespace, &vector, k, embedder_id)
                .await
                .map_err(store_err)?;
            Ok(SimilarityResult { hits, degraded: false })
        }
        Err(e) => {
            tracing::warn!(error = %e, "embedder unavailable, returning degraded similarity response");
            Ok(SimilarityResult { hits: Vec::new(), degraded: true })
        }
    }
}

fn store_err(e: mesh_graph::GraphError) -> MeshError {
    MeshError::QueryStoreError(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn depth_within_range_passes() {
        assert_eq!(validate_depth(0).unwrap(), 0);
        assert_eq!(validate_depth(5).unwrap(), 5);
    }

    #[test]
    fn depth_above_max_fails() {
        let err = validate_depth(6).unwrap_err();
        assert_eq!(err.code(), "QUERY_DEPTH");
    }

    #[test]
    fn zero_limit_is_bad_input() {
        let err = clamp_limit(Some(0)).unwrap_err();
        assert_eq!(err.code(), "QUERY_BAD_INPUT");
    }

    #[test]
    fn limit_above_hard_cap_is_clamped() {
        assert_eq!(clamp_limit(Some(100_000)).unwrap(), HARD_PAGE_LIMIT);
    }

    #[test]
    fn missing_limit_uses_default() {
        assert_eq!(clamp_limit(None).unwrap(), DEFAULT_PAGE_LIMIT);
    }

    #[test]
    fn parses_minutes_and_hours() {
        assert_eq!(parse_duration("5m").unwrap(), Duration::minutes(5));
        assert_eq!(parse_duration("1h").unwrap(), Duration::hours(1));
        assert_eq!(parse_duration("30s").unwrap(), Duration::seconds(30));
        assert_eq!(parse_duration("2d").unwrap(), Duration::days(2));
    }

    #[test]
    fn rejects_unknown_unit() {
        assert!(parse_duration("5x").is_err());
    }
}
