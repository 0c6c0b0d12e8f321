use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use redis::RedisError;
use serde::{Deserialize, Serialize};
use sqlx::error::Error as SqlxError;
use std::error::Error as StdError;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    Database(String),
    Redis(String),
    Internal(String),
    Unauthorized(String),
    NotFound(String),
    BadRequest(String),
    Configuration(String),
    Validation(String),
    Serialization(String),
    TooManyRequests(String),
}

#[derive(Serialize, Deserialize)]
struct ErrorResponse {
    code: u16,
    message: String,
    error_type: String,
}

impl AppError {
    fn kind(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "database_error"),
            AppError::Redis(_) => (StatusCode::SERVICE_UNAVAILABLE, "queue_store_error"),
            AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
            AppError::Unauthorized(_) => (StatusCode::UNAUTHORIZED, "unauthorized"),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "bad_request"),
            AppError::Configuration(_) => (StatusCode::INTERNAL_SERVER_ERROR, "configuration_error"),
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            AppError::Serialization(_) => (StatusCode::INTERNAL_SERVER_ERROR, "serialization_error"),
            AppError::TooManyRequests(_) => (StatusCode::TOO_MANY_REQUESTS, "too_many_requests"),
        }
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Database(e) => write!(f, "Database error: {}", e),
            AppError::Redis(e) => write!(f, "Command queue store error: {}", e),
            AppError::Internal(e) => write!(f, "Internal error: {}", e),
            AppError::Unauthorized(e) => write!(f, "Unauthorized: {}", e),
            AppError::NotFound(e) => write!(f, "Not found: {}", e),
            AppError::BadRequest(e) => write!(f, "Bad request: {}", e),
            AppError::Configuration(e) => write!(f, "Configuration error: {}", e),
            AppError::Validation(e) => write!(f, "Validation error: {}", e),
            AppError::Serialization(e) => write!(f, "Serialization error: {}", e),
            AppError::TooManyRequests(e) => write!(f, "Too many requests: {}", e),
        }
    }
}

impl StdError for AppError {}

impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status_code, error_type) = self.kind();

        let error_response = ErrorResponse {
            code: status_code.as_u16(),
            message: self.to_string(),
            error_type: error_type.to_string(),
        };

        HttpResponse::build(status_code).json(error_response)
    }

    fn status_code(&self) -> StatusCode {
        self.kind().0
    }
}

impl From<SqlxError> for AppError {
    fn from(error: SqlxError) -> Self {
        match error {
            SqlxError::RowNotFound => AppError::NotFound("Record not found".to_string()),
            _ => AppError::Database(error.to_string()),
        }
    }
}

impl From<RedisError> for AppError {
    fn from(error: RedisError) -> Self {
        AppError::Redis(error.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::Serialization(format!("JSON deserialization/serialization error: {}", error))
    }
}

// Define AppResult type alias for Result<T, AppError>
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AppError::Unauthorized("bad token".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::Validation("kind is empty".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Redis("down".into()).status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: AppError = SqlxError::RowNotFound.into();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
