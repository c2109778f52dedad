//! Integration tests against a live Neo4j instance.
//!
//! Skipped automatically if Neo4j is not available. Run with:
//! `cargo test --package mesh-graph --test integration -- --ignored`

use chrono::Utc;
use mesh_core::types::Protocol;
use mesh_graph::mutations::PortKey;
use mesh_graph::queries::Selectors;
use mesh_graph::{GraphClient, GraphConfig};
use uuid::Uuid;

async fn connect_or_skip() -> Option<GraphClient> {
    let config = GraphConfig::default();
    match GraphClient::connect(&config).await {
        Ok(client) => Some(client),
        Err(e) => {
            eprintln!("Skipping integration test (Neo4j not available): {e}");
            None
        }
    }
}

fn unique_namespace() -> String {
    format!("it-{}", Uuid::new_v4())
}

async fn cleanup(client: &GraphClient, namespace: &str) {
    let q = neo4rs::query("MATCH (n {namespace: $namespace}) DETACH DELETE n").param("namespace", namespace);
    let _ = client.run(q).await;
}

#[tokio::test]
#[ignore = "requires live Neo4j"]
async fn upsert_host_is_idempotent() {
    let Some(client) = connect_or_skip().await else { return };
    let namespace = unique_namespace();
    let now = Utc::now();

    client.upsert_host(&namespace, "10.0.1.1", now).await.unwrap();
    client.upsert_host(&namespace, "10.0.1.1", now).await.unwrap();

    let graph = client.query_host(&namespace, "10.0.1.1", 0).await.unwrap().unwrap();
    assert_eq!(graph.host.unwrap().ip, "10.0.1.1");

    cleanup(&client, &namespace).await;
}

#[tokio::test]
#[ignore = "requires live Neo4j"]
async fn last_seen_moves_forward_not_backward() {
    let Some(client) = connect_or_skip().await else { return };
    let namespace = unique_namespace();
    let t1 = Utc::now();
    let t2 = t1 + chrono::Duration::minutes(5);

    client.upsert_host(&namespace, "10.0.1.2", t1).await.unwrap();
    client.upsert_host(&namespace, "10.0.1.2", t2).await.unwrap();
    // a stale, out-of-order observation must not roll last_seen back
    client.upsert_host(&namespace, "10.0.1.2", t1).await.unwrap();

    let graph = client.query_host(&namespace, "10.0.1.2", 0).await.unwrap().unwrap();
    let host = graph.host.unwrap();
    let last_seen = chrono::DateTime::parse_from_rfc3339(&host.last_seen).unwrap();
    assert_eq!(last_seen.with_timezone(&Utc), t2);

    cleanup(&client, &namespace).await;
}

#[tokio::test]
#[ignore = "requires live Neo4j"]
async fn host_port_service_chain_resolves_at_depth() {
    let Some(client) = connect_or_skip().await else { return };
    let namespace = unique_namespace();
    let now = Utc::now();

    client.upsert_host(&namespace, "10.0.2.1", now).await.unwrap();
    client
        .upsert_port(&namespace, "10.0.2.1", 443, Protocol::Tcp, false, now)
        .await
        .unwrap();
    let port_key = PortKey {
        host_ip: "10.0.2.1".to_string(),
        number: 443,
        protocol: Protocol::Tcp,
    };
    client
        .upsert_service(&namespace, &port_key, "https", "nginx", "1.25.0", "fp-1", now)
        .await
        .unwrap();

    let depth0 = client.query_host(&namespace, "10.0.2.1", 0).await.unwrap().unwrap();
    assert!(depth0.ports.is_empty());

    let depth1 = client.query_host(&namespace, "10.0.2.1", 1).await.unwrap().unwrap();
    assert_eq!(depth1.ports.len(), 1);
    assert!(depth1.services.is_empty());

    let depth2 = client.query_host(&namespace, "10.0.2.1", 2).await.unwrap().unwrap();
    assert_eq!(depth2.services.len(), 1);
    assert_eq!(depth2.services[0].product, "nginx");

    cleanup(&client, &namespace).await;
}

#[tokio::test]
#[ignore = "requires live Neo4j"]
async fn job_transition_table_is_enforced() {
    let Some(client) = connect_or_skip().await else { return };
    let namespace = unique_namespace();

    let job_id = client.create_job(&namespace, "scanner-key-1").await.unwrap();

    use mesh_core::types::JobState;
    client
        .transition_job(&namespace, job_id, JobState::Processing, None, None, None)
        .await
        .unwrap();

    // completed -> processing is not a legal transition
    client
        .transition_job(&namespace, job_id, JobState::Completed, None, Some(1), Some(1))
        .await
        .unwrap();
    let err = client
        .transition_job(&namespace, job_id, JobState::Processing, None, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, mesh_graph::GraphError::InvalidTransition { .. }));

    let job = client.get_job(&namespace, job_id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert!(job.completed_at.is_some());

    cleanup(&client, &namespace).await;
}

#[tokio::test]
#[ignore = "requires live Neo4j"]
async fn selector_query_filters_by_country() {
    let Some(client) = connect_or_skip().await else { return };
    let namespace = unique_namespace();
    let now = Utc::now();

    client.upsert_host(&namespace, "10.0.3.1", now).await.unwrap();
    client
        .upsert_geo(&namespace, "10.0.3.1", "Ashburn", "Virginia", "US", None, now)
        .await
        .unwrap();
    client
        .upsert_port(&namespace, "10.0.3.1", 22, Protocol::Tcp, false, now)
        .await
        .unwrap();

    let selectors = Selectors {
        country_cc: Some("US".to_string()),
        ..Default::default()
    };
    let rows = client.query_selector(&namespace, &selectors, 100, 0).await.unwrap();
    assert!(rows.iter().any(|r| r.ip == "10.0.3.1" && r.port == 22));

    let selectors_miss = Selectors {
        country_cc: Some("JP".to_string()),
        ..Default::default()
    };
    let rows_miss = client.query_selector(&namespace, &selectors_miss, 100, 0).await.unwrap();
    assert!(rows_miss.iter().all(|r| r.ip != "10.0.3.1"));

    cleanup(&client, &namespace).await;
}

#[tokio::test]
#[ignore = "requires live Neo4j"]
async fn plan_stale_respects_min_age_and_exclusions() {
    let Some(client) = connect_or_skip().await else { return };
    let namespace = unique_namespace();
    let old = Utc::now() - chrono::Duration::hours(2);

    client.upsert_host(&namespace, "10.0.4.1", old).await.unwrap();
    client
        .upsert_port(&namespace, "10.0.4.1", 80, Protocol::Tcp, false, old)
        .await
        .unwrap();

    let selectors = Selectors::default();
    let exclusions = mesh_graph::queries::Exclusions::default();

    let (targets, _cursor) = client
        .plan_stale(&namespace, &selectors, chrono::Duration::minutes(5), &exclusions, 100, 0)
        .await
        .unwrap();
    assert!(targets.iter().any(|t| t.ip == "10.0.4.1" && t.port == 80));

    let (targets_too_fresh, _) = client
        .plan_stale(&namespace, &selectors, chrono::Duration::hours(24), &exclusions, 100, 0)
        .await
        .unwrap();
    assert!(targets_too_fresh.iter().all(|t| t.ip != "10.0.4.1"));

    let excluded = mesh_graph::queries::Exclusions {
        cidrs: vec!["10.0.4.0/24".parse().unwrap()],
        ports: Vec::new(),
    };
    let (targets_excluded, _) = client
        .plan_stale(&namespace, &selectors, chrono::Duration::minutes(5), &excluded, 100, 0)
        .await
        .unwrap();
    assert!(targets_excluded.iter().all(|t| t.ip != "10.0.4.1"));

    cleanup(&client, &namespace).await;
}
