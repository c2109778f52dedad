//! Maps the stable `MeshError` codes (§7) onto HTTP status codes for the
//! query and ingest surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use mesh_core::MeshError;
use serde::Serialize;

#[derive(Debug)]
pub struct ApiError(pub MeshError);

impl From<MeshError> for ApiError {
    fn from(e: MeshError) -> Self {
        ApiError(e)
    }
}

impl From<mesh_graph::GraphError> for ApiError {
    fn from(e: mesh_graph::GraphError) -> Self {
        ApiError(MeshError::QueryStoreError(e.to_string()))
    }
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            MeshError::AuthMalformed(_) | MeshError::IngestEmpty | MeshError::IngestBadJsonLine(_) => {
                StatusCode::BAD_REQUEST
            }
            MeshError::AuthStale | MeshError::AuthBadSig | MeshError::AuthRevoked => StatusCode::UNAUTHORIZED,
            MeshError::RateLimitWaitCancelled | MeshError::IngestQueueFull => StatusCode::TOO_MANY_REQUESTS,
            MeshError::QueryBadInput(_) | MeshError::QueryDepth(_) => StatusCode::BAD_REQUEST,
            MeshError::ExtTimeout(_)
            | MeshError::ExtHttp5xx(_)
            | MeshError::ExtHttp4xx(_)
            | MeshError::JobInvalidTransition { .. }
            | MeshError::QueryStoreError(_)
            | MeshError::StoreTransient(_)
            | MeshError::StoreInvariant(_)
            | MeshError::Config(_)
            | MeshError::Serialization(_)
            | MeshError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = ErrorBody {
            code: self.0.code(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
