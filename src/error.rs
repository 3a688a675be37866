use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),

    #[error("Relational store error: {0}")]
    Relational(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Comment not found: {0}")]
    CommentNotFound(String),

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Invalid url: {0}")]
    InvalidUrl(String),

    #[error("Comment is too long: {length} characters, at most {max} allowed")]
    CommentTooLong { length: usize, max: usize },

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Unsupported vote action: {0}")]
    UnsupportedVoteAction(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Validation error: {0}")]
    ValidatorError(#[from] validator::ValidationErrors),

    #[error("Connection pool timed out after {0:?}")]
    PoolTimedOut(Duration),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn not_found(resource: &str) -> Self {
        Self::NotFound(format!("{} not found", resource))
    }

    pub fn comment_not_found(comment_id: &str) -> Self {
        Self::CommentNotFound(format!("comment {} not found", comment_id))
    }

    pub fn invalid_identifier(id: &str) -> Self {
        Self::InvalidIdentifier(format!("'{}' is not a valid identifier", id))
    }

    pub fn unauthorized(msg: &str) -> Self {
        Self::Unauthorized(msg.to_string())
    }

    pub fn validation(msg: &str) -> Self {
        Self::Validation(msg.to_string())
    }

    pub fn internal(msg: &str) -> Self {
        Self::Internal(msg.to_string())
    }

    /// 存储层故障（I/O、超时、连接池耗尽等），与业务错误区分开
    pub fn is_backend_failure(&self) -> bool {
        matches!(
            self,
            AppError::Database(_)
                | AppError::Relational(_)
                | AppError::PoolTimedOut(_)
                | AppError::Timeout(_)
                | AppError::Conflict(_)
                | AppError::Serialization(_)
                | AppError::Internal(_)
        )
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message, error_code) = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string(), "DATABASE_ERROR")
            }
            AppError::Relational(e) => {
                tracing::error!("Relational store error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".to_string(), "DATABASE_ERROR")
            }
            AppError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, msg.clone(), "POST_NOT_FOUND")
            }
            AppError::CommentNotFound(msg) => {
                (StatusCode::NOT_FOUND, msg.clone(), "COMMENT_NOT_FOUND")
            }
            AppError::InvalidIdentifier(msg) => {
                (StatusCode::BAD_REQUEST, msg.clone(), "INVALID_IDENTIFIER")
            }
            AppError::InvalidUrl(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, msg.clone(), "INVALID_URL")
            }
            AppError::CommentTooLong { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, self.to_string(), "COMMENT_TOO_LONG")
            }
            AppError::Unauthorized(msg) => {
                (StatusCode::UNAUTHORIZED, msg.clone(), "UNAUTHORIZED")
            }
            AppError::UnsupportedVoteAction(action) => {
                (StatusCode::BAD_REQUEST, format!("vote action '{}' is not supported", action), "UNSUPPORTED_VOTE_ACTION")
            }
            AppError::Validation(msg) => {
                (StatusCode::UNPROCESSABLE_ENTITY, msg.clone(), "VALIDATION_ERROR")
            }
            AppError::ValidatorError(e) => {
                let validation_errors = e
                    .field_errors()
                    .iter()
                    .map(|(field, errors)| {
                        (
                            field.to_string(),
                            errors.iter().map(|e| e.message.as_ref().unwrap_or(&"Invalid value".into()).to_string()).collect::<Vec<_>>()
                        )
                    })
                    .collect::<std::collections::HashMap<String, Vec<String>>>();

                return (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    Json(json!({
                        "error": {
                            "code": "VALIDATION_ERROR",
                            "message": "Validation failed",
                            "details": validation_errors
                        }
                    }))
                ).into_response();
            }
            AppError::PoolTimedOut(_) | AppError::Timeout(_) => {
                tracing::warn!("{}", self);
                (StatusCode::SERVICE_UNAVAILABLE, "Storage is busy, try again later".to_string(), "STORAGE_UNAVAILABLE")
            }
            AppError::Conflict(msg) => {
                tracing::warn!("Write conflict: {}", msg);
                (StatusCode::CONFLICT, msg.clone(), "CONFLICT")
            }
            AppError::Serialization(e) => {
                tracing::error!("Serialization error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Serialization error".to_string(), "SERIALIZATION_ERROR")
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string(), "INTERNAL_ERROR")
            }
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": error_message
            }
        }));

        (status, body).into_response()
    }
}

// 从其他错误类型转换
impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}
