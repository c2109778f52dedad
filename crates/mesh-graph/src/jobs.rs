//! Job registry: the `pending -> processing -> {completed, failed}` state
//! machine that tracks one ingestion run per contributor submission (§4.3).

use chrono::{DateTime, Utc};
use mesh_core::types::JobState;
use neo4rs::query;
use serde::Serialize;
use uuid::Uuid;

use crate::client::{GraphClient, GraphError};

/// Transitions not in this table are rejected with `JOB_INVALID_TRANSITION`.
fn transition_allowed(from: JobState, to: JobState) -> bool {
    matches!(
        (from, to),
        (JobState::Pending, JobState::Processing)
            | (JobState::Processing, JobState::Completed)
            | (JobState::Processing, JobState::Failed)
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub namespace: String,
    pub state: JobState,
    pub scanner_key: String,
    pub error_message: Option<String>,
    pub host_count: i64,
    pub port_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub scanner_key: Option<String>,
}

impl GraphClient {
    /// Create a new job in `pending` state, owned by the given scanner key.
    pub async fn create_job(&self, namespace: &str, scanner_key: &str) -> Result<Uuid, GraphError> {
        let id = Uuid::new_v4();
        let now = Utc::now();

        let q = query(
            "CREATE (j:Job {
                namespace: $namespace, id: $id, state: $state, scanner_key: $scanner_key,
                error_message: null, host_count: 0, port_count: 0,
                created_at: $now, updated_at: $now, completed_at: null
            })",
        )
        .param("namespace", namespace)
        .param("id", id.to_string())
        .param("state", JobState::Pending.to_string())
        .param("scanner_key", scanner_key)
        .param("now", now.to_rfc3339());

        self.run(q).await?;
        Ok(id)
    }

    async fn load_state(&self, namespace: &str, id: Uuid) -> Result<Option<JobState>, GraphError> {
        let row = self
            .query_one(
                query("MATCH (j:Job {namespace: $namespace, id: $id}) RETURN j.state AS state")
                    .param("namespace", namespace)
                    .param("id", id.to_string()),
            )
            .await?;
        let Some(row) = row else { return Ok(None) };
        let state: String = row.get("state").unwrap_or_default();
        Ok(state.parse::<JobState>().ok())
    }

    /// Advance a job's state, enforcing the transition table. Returns
    /// `GraphError::InvalidTransition` (mapped to `JOB_INVALID_TRANSITION`
    /// by callers) when `to` is not reachable from the job's current state.
    pub async fn transition_job(
        &self,
        namespace: &str,
        id: Uuid,
        to: JobState,
        error_message: Option<&str>,
        host_count: Option<i64>,
        port_count: Option<i64>,
    ) -> Result<(), GraphError> {
        let current = self.load_state(namespace, id).await?.ok_or_else(|| GraphError::NotFound {
            label: "Job".to_string(),
            id: id.to_string(),
            namespace: namespace.to_string(),
        })?;

        if !transition_allowed(current, to) {
            return Err(GraphError::InvalidTransition {
                from: current.to_string(),
                to: to.to_string(),
            });
        }

        let now = Utc::now();
        let completed_at = matches!(to, JobState::Completed | JobState::Failed).then_some(now);

        let q = query(
            "MATCH (j:Job {namespace: $namespace, id: $id})
             SET j.state = $state, j.updated_at = $now,
                 j.error_message = $error_message,
                 j.host_count = coalesce($host_count, j.host_count),
                 j.port_count = coalesce($port_count, j.port_count),
                 j.completed_at = $completed_at",
        )
        .param("namespace", namespace)
        .param("id", id.to_string())
        .param("state", to.to_string())
        .param("now", now.to_rfc3339())
        .param("error_message", error_message.map(|s| s.to_string()))
        .param("host_count", host_count)
        .param("port_count", port_count)
        .param("completed_at", completed_at.map(|t| t.to_rfc3339()));

        self.run(q).await
    }

    pub async fn get_job(&self, namespace: &str, id: Uuid) -> Result<Option<JobRecord>, GraphError> {
        let row = self
            .query_one(
                query(
                    "MATCH (j:Job {namespace: $namespace, id: $id})
                     RETURN j.id AS id, j.state AS state, j.scanner_key AS scanner_key,
                            j.error_message AS error_message, j.host_count AS host_count,
                            j.port_count AS port_count, j.created_at AS created_at,
                            j.updated_at AS updated_at, j.completed_at AS completed_at",
                )
                .param("namespace", namespace)
                .param("id", id.to_string()),
            )
            .await?;

        let Some(row) = row else { return Ok(None) };
        Ok(Some(row_to_job(namespace, &row)?))
    }

    /// List jobs filterable by state and scanner key, ordered newest-first.
    pub async fn list_jobs(
        &self,
        namespace: &str,
        filter: &JobFilter,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<JobRecord>, GraphError> {
        let mut clauses = Vec::new();
        if filter.state.is_some() {
            clauses.push("j.state = $state".to_string());
        }
        if filter.scanner_key.is_some() {
            clauses.push("j.scanner_key = $scanner_key".to_string());
        }

        let mut cypher = String::from("MATCH (j:Job {namespace: $namespace})");
        if !clauses.is_empty() {
            cypher.push_str(" WHERE ");
            cypher.push_str(&clauses.join(" AND "));
        }
        cypher.push_str(
            " RETURN j.id AS id, j.state AS state, j.scanner_key AS scanner_key,
                     j.error_message AS error_message, j.host_count AS host_count,
                     j.port_count AS port_count, j.created_at AS created_at,
                     j.updated_at AS updated_at, j.completed_at AS completed_at
              ORDER BY j.created_at DESC, j.updated_at DESC
              SKIP $offset LIMIT $limit",
        );

        let mut q = query(&cypher)
            .param("namespace", namespace)
            .param("offset", offset as i64)
            .param("limit", limit as i64);
        if let Some(ref state) = filter.state {
            q = q.param("state", state.to_string());
        }
        if let Some(ref scanner_key) = filter.scanner_key {
            q = q.param("scanner_key", scanner_key.clone());
        }

        let rows = self.query_rows(q).await?;
        rows.iter().map(|row| row_to_job(namespace, row)).collect()
    }
}

fn row_to_job(namespace: &str, row: &neo4rs::Row) -> Result<JobRecord, GraphError> {
    let id_str: String = row.get("id").unwrap_or_default();
    let state_str: String = row.get("state").unwrap_or_default();
    let created_at: String = row.get("created_at").unwrap_or_default();
    let updated_at: String = row.get("updated_at").unwrap_or_default();
    let completed_at: Option<String> = row.get("completed_at").ok();

    Ok(JobRecord {
        id: id_str.parse().map_err(|_| GraphError::Serialization("invalid job id".to_string()))?,
        namespace: namespace.to_string(),
        state: state_str
            .parse()
            .map_err(|_| GraphError::Serialization("invalid job state".to_string()))?,
        scanner_key: row.get("scanner_key").unwrap_or_default(),
        error_message: row.get("error_message").ok(),
        host_count: row.get("host_count").unwrap_or(0),
        port_count: row.get("port_count").unwrap_or(0),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now()),
        completed_at: completed_at
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|d| d.with_timezone(&Utc)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_to_processing_allowed() {
        assert!(transition_allowed(JobState::Pending, JobState::Processing));
    }

    #[test]
    fn processing_to_terminal_states_allowed() {
        assert!(transition_allowed(JobState::Processing, JobState::Completed));
        assert!(transition_allowed(JobState::Processing, JobState::Failed));
    }

    #[test]
    fn terminal_states_are_final() {
        assert!(!transition_allowed(JobState::Completed, JobState::Processing));
        assert!(!transition_allowed(JobState::Failed, JobState::Processing));
        assert!(!transition_allowed(JobState::Completed, JobState::Failed));
    }

    #[test]
    fn pending_cannot_skip_to_terminal() {
        assert!(!transition_allowed(JobState::Pending, JobState::Completed));
        assert!(!transition_allowed(JobState::Pending, JobState::Failed));
    }
}
