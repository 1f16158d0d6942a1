//! Pipeline error taxonomy and its HTTP mapping.
//!
//! Adapters and stores report `anyhow::Error`; the ingestion and query
//! pipelines classify those into [`PipelineError`] so callers can tell a bad
//! request from an unreachable provider.
//!
//! | Variant | Status |
//! |---------|--------|
//! | `Validation` | 400 |
//! | `Unauthorized` | 401 |
//! | `Forbidden` | 403 |
//! | `NotFound` | 404 |
//! | `Upstream` (storage) | 500 |
//! | `Upstream` (other stages) | 502 |
//! | `Config` | 500 |

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// The pipeline step an upstream failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Fetch,
    Embedding,
    Search,
    Generation,
    Storage,
    Condense,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Fetch => "fetch",
            Stage::Embedding => "embedding",
            Stage::Search => "search",
            Stage::Generation => "generation",
            Stage::Storage => "storage",
            Stage::Condense => "condense",
        };
        f.write_str(s)
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("{0}")]
    Validation(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{stage} failed: {source:#}")]
    Upstream {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    pub fn validation(message: impl Into<String>) -> Self {
        PipelineError::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        PipelineError::NotFound(message.into())
    }

    pub fn upstream(stage: Stage, source: impl Into<anyhow::Error>) -> Self {
        PipelineError::Upstream {
            stage,
            source: source.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            PipelineError::Unauthorized => StatusCode::UNAUTHORIZED,
            PipelineError::Forbidden(_) => StatusCode::FORBIDDEN,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::Upstream {
                stage: Stage::Storage,
                ..
            } => StatusCode::INTERNAL_SERVER_ERROR,
            PipelineError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            PipelineError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Extension for tagging `anyhow` results with the stage they came from.
pub trait StageExt<T> {
    fn stage(self, stage: Stage) -> PipelineResult<T>;
}

impl<T> StageExt<T> for anyhow::Result<T> {
    fn stage(self, stage: Stage) -> PipelineResult<T> {
        self.map_err(|e| PipelineError::upstream(stage, e))
    }
}

/// JSON error body: `{"success": false, "error": "..."}`.
#[derive(Serialize)]
struct ErrorBody {
    success: bool,
    error: String,
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, status = status.as_u16(), "request rejected");
        }
        let body = ErrorBody {
            success: false,
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
