//! Error taxonomy shared across the route parser, template engine, pipeline
//! executor and dispatcher. Every variant maps to a stable HTTP status and a
//! machine-readable `error` field; only the HTTP boundary (the gateway
//! service's handler) turns one of these into a `RouteResponse`.

use actix_web::http::StatusCode;
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("malformed request body: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("server configuration error: {0}")]
    ServerConfiguration(String),

    #[error("database error: {0}")]
    DbError(String),

    #[error("node.js error: {0}")]
    NodeJsError(String),

    #[error("pipeline error in node '{node}': {source}")]
    PipelineError { node: String, source: Box<AppError> },

    #[error("action timed out")]
    Timeout,
}

impl AppError {
    /// Machine-readable discriminant used for the `error` field and for log
    /// correlation, mirroring the taxonomy in the error handling design.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::BadRequest(_) => "BadRequest",
            AppError::Unauthorized(_) => "Unauthorized",
            AppError::NotFound => "NotFound",
            AppError::Conflict(_) => "Conflict",
            AppError::ServerConfiguration(_) => "ServerConfiguration",
            AppError::DbError(_) => "DbError",
            AppError::NodeJsError(_) => "NodeJsError",
            AppError::PipelineError { .. } => "PipelineError",
            AppError::Timeout => "Timeout",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::ServerConfiguration(_) | AppError::DbError(_) | AppError::NodeJsError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::PipelineError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Body shape used at the HTTP boundary: `{"error": "<Kind>", ...}`.
    pub fn body(&self) -> Value {
        match self {
            AppError::PipelineError { node, source } => json!({
                "error": self.kind(),
                "node": node,
                "cause": source.kind(),
            }),
            _ => json!({ "error": self.kind(), "message": self.to_string() }),
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &e {
            // Postgres SQLSTATE 23505 = unique_violation, 23503 = foreign_key_violation.
            if let Some(code) = db_err.code() {
                if code == "23505" || code == "23503" || code.starts_with("23") {
                    return AppError::Conflict(db_err.message().to_string());
                }
            }
        }
        AppError::DbError(e.to_string())
    }
}

/// Convenience alias for results that use [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;
