use thiserror::Error;

/// Top-level error type for the intelligence mesh.
///
/// Each variant corresponds to one of the stable error kinds in the error
/// handling design: the `code()` string is what gets persisted as a job's
/// `error_message` tag and mapped to an HTTP status at the query surface.
#[derive(Error, Debug)]
pub enum MeshError {
    #[error("malformed envelope: {0}")]
    AuthMalformed(String),

    #[error("envelope timestamp outside admit window")]
    AuthStale,

    #[error("signature verification failed")]
    AuthBadSig,

    #[error("scanner key is revoked")]
    AuthRevoked,

    #[error("scan submission contained no valid records")]
    IngestEmpty,

    #[error("malformed scan record line: {0}")]
    IngestBadJsonLine(String),

    #[error("transient store error: {0}")]
    StoreTransient(String),

    #[error("store invariant violated: {0}")]
    StoreInvariant(String),

    #[error("rate limit wait cancelled")]
    RateLimitWaitCancelled,

    #[error("ingest queue is saturated")]
    IngestQueueFull,

    #[error("external call timed out: {0}")]
    ExtTimeout(String),

    #[error("external provider returned 5xx: {0}")]
    ExtHttp5xx(String),

    #[error("external provider returned 4xx: {0}")]
    ExtHttp4xx(String),

    #[error("invalid job state transition: {from} -> {to}")]
    JobInvalidTransition { from: String, to: String },

    #[error("bad query input: {0}")]
    QueryBadInput(String),

    #[error("query depth out of range: {0}")]
    QueryDepth(u8),

    #[error("query store error: {0}")]
    QueryStoreError(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MeshError {
    /// The stable machine-readable code for this error, as enumerated in §7.
    pub fn code(&self) -> &'static str {
        match self {
            MeshError::AuthMalformed(_) => "AUTH_MALFORMED",
            MeshError::AuthStale => "AUTH_STALE",
            MeshError::AuthBadSig => "AUTH_BAD_SIG",
            MeshError::AuthRevoked => "AUTH_REVOKED",
            MeshError::IngestEmpty => "INGEST_EMPTY",
            MeshError::IngestBadJsonLine(_) => "INGEST_BAD_JSON_LINE",
            MeshError::StoreTransient(_) => "STORE_TRANSIENT",
            MeshError::StoreInvariant(_) => "STORE_INVARIANT",
            MeshError::RateLimitWaitCancelled => "RATE_LIMIT_WAIT_CANCELLED",
            MeshError::IngestQueueFull => "RATE_LIMIT",
            MeshError::ExtTimeout(_) => "EXT_TIMEOUT",
            MeshError::ExtHttp5xx(_) => "EXT_HTTP_5XX",
            MeshError::ExtHttp4xx(_) => "EXT_HTTP_4XX",
            MeshError::JobInvalidTransition { .. } => "JOB_INVALID_TRANSITION",
            MeshError::QueryBadInput(_) => "QUERY_BAD_INPUT",
            MeshError::QueryDepth(_) => "QUERY_DEPTH",
            MeshError::QueryStoreError(_) => "QUERY_STORE_ERROR",
            MeshError::Config(_) => "CONFIG",
            MeshError::Serialization(_) => "SERIALIZATION",
            MeshError::Internal(_) => "INTERNAL",
        }
    }

    /// True for errors the workflow runtime should retry with backoff rather
    /// than treat as terminal (§7: "Recovery" column).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MeshError::StoreTransient(_)
                | MeshError::RateLimitWaitCancelled
                | MeshError::ExtTimeout(_)
                | MeshError::ExtHttp5xx(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(MeshError::AuthStale.code(), "AUTH_STALE");
        assert_eq!(MeshError::QueryDepth(6).code(), "QUERY_DEPTH");
        assert_eq!(
            MeshError::JobInvalidTransition {
                from: "completed".into(),
                to: "processing".into()
            }
            .code(),
            "JOB_INVALID_TRANSITION"
        );
    }

    #[test]
    fn retryability_matches_recovery_column() {
        assert!(MeshError::StoreTransient("timeout".into()).is_retryable());
        assert!(!MeshError::StoreInvariant("dup".into()).is_retryable());
        assert!(!MeshError::AuthBadSig.is_retryable());
        assert!(MeshError::ExtHttp5xx("503".into()).is_retryable());
        assert!(!MeshError::ExtHttp4xx("404".into()).is_retryable());
    }
}
