//! Freshness planner and query surface for the intelligence mesh: validated
//! host/selector/coverage/plan/similarity queries over the observation
//! graph (§4.6).

pub mod embedder;
pub mod error;
pub mod planner;

pub use embedder::{Embedder, NoEmbedder};
pub use error::ApiError;
