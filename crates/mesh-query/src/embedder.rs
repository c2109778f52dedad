//! The text embedder behind the similarity surface is an opaque external
//! collaborator (§4.6): when it's unreachable the planner degrades rather
//! than failing the request.

use async_trait::async_trait;

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;
}

/// Used when no embedding model is configured. Every call reports
/// unavailable, which `planner::similarity` turns into a `degraded=true`
/// response instead of an error.
pub struct NoEmbedder;

#[async_trait]
impl Embedder for NoEmbedder {
    async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        Err(anyhow::anyhow!("no embedder configured"))
    }
}
