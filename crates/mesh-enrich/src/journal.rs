//! In-process substitute for the durable-workflow contract (C4, §4.4).
//!
//! Built the way the donor's `scheduler` module sequences a scan through a
//! series of fallible async steps, generalized here so each step's outcome
//! is journaled: a step that already ran (found in the graph-persisted
//! journal) is never re-executed, so a restart mid-workflow resumes rather
//! than repeats. Token buckets and caches are deliberately NOT part of this
//! journal (§5) — only step *results* are replayed.

use std::future::Future;

use mesh_graph::GraphClient;
use neo4rs::query;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{EnrichError, Result};

pub struct JournaledRun {
    graph: GraphClient,
    namespace: String,
    workflow_id: String,
    cache: dashmap::DashMap<String, serde_json::Value>,
}

impl JournaledRun {
    /// Load (or start) a journal for the given workflow id, replaying any
    /// previously-recorded step results from the graph.
    pub async fn load(graph: GraphClient, namespace: String, workflow_id: String) -> Result<Self> {
        let rows = graph
            .query_rows(
                query(
                    "MATCH (e:JournalEntry {namespace: $namespace, workflow_id: $workflow_id})
                     RETURN e.step_name AS step_name, e.result AS result",
                )
                .param("namespace", namespace.clone())
                .param("workflow_id", workflow_id.clone()),
            )
            .await?;

        let cache = dashmap::DashMap::new();
        for row in &rows {
            let step_name: String = row.get("step_name").unwrap_or_default();
            let result: String = row.get("result").unwrap_or_default();
            if let Ok(value) = serde_json::from_str::<serde_json::Value>(&result) {
                cache.insert(step_name, value);
            }
        }

        Ok(Self {
            graph,
            namespace,
            workflow_id,
            cache,
        })
    }

    /// Run `f` at most once for `name` across the lifetime of this workflow
    /// id: if a prior run already recorded a result for this step, it is
    /// replayed instead of re-executing `f`.
    pub async fn step<T, F, Fut>(&self, name: &str, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Clone,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(cached) = self.cache.get(name) {
            return serde_json::from_value(cached.clone())
                .map_err(|e| EnrichError::Config(format!("journal replay for {name}: {e}")));
        }

        let result = f().await?;
        let value = serde_json::to_value(&result)
            .map_err(|e| EnrichError::Config(format!("journal encode for {name}: {e}")))?;

        self.persist(name, &value).await?;
        self.cache.insert(name.to_string(), value);

        Ok(result)
    }

    async fn persist(&self, name: &str, value: &serde_json::Value) -> Result<()> {
        let now = chrono::Utc::now();
        let q = query(
            "MERGE (e:JournalEntry {namespace: $namespace, workflow_id: $workflow_id, step_name: $step_name})
             ON CREATE SET e.result = $result, e.recorded_at = $now
             ON MATCH SET e.result = $result, e.recorded_at = $now",
        )
        .param("namespace", self.namespace.clone())
        .param("workflow_id", self.workflow_id.clone())
        .param("step_name", name)
        .param("result", serde_json::to_string(value).unwrap_or_default())
        .param("now", now.to_rfc3339());

        self.graph.run(q).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_names_must_be_distinct_to_journal_independently() {
        // Stable naming is a caller discipline the type can't enforce at
        // compile time; this test just documents the requirement.
        let a = "ingest:parse";
        let b = "ingest:persist";
        assert_ne!(a, b);
    }
}
