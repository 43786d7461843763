//! Crate-wide error type.
//!
//! Only network, auth and decode failures surface as [`Error`]. Geometry
//! union failures degrade to a bounding box and missing prediction artifacts
//! degrade to [`PredictionData::Unavailable`](crate::PredictionData), so
//! neither shows up here.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("request failed: {0}")]
    Request(String),

    #[error("failed to decode response: {0}")]
    Decode(String),

    #[error("invalid geometry: {0}")]
    Geometry(String),

    #[error("polygon union failed: {0}")]
    Union(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("prediction source error: {0}")]
    Source(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Transient errors are worth another attempt (job status polling).
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Request(_) => true,
            Error::Http { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Request("connection reset".into()).is_transient());
        assert!(Error::Http { status: 503, url: "x".into() }.is_transient());
        assert!(Error::Http { status: 429, url: "x".into() }.is_transient());
        assert!(!Error::Http { status: 404, url: "x".into() }.is_transient());
        assert!(!Error::Auth("bad token".into()).is_transient());
        assert!(!Error::Cancelled.is_transient());
    }
}
