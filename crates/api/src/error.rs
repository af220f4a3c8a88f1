use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use domain::{AggregationError, StoreError, SubmissionError};
use serde::Serialize;
use shared::pagination::CursorError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Validation failed: {message}")]
    InvalidFields {
        message: String,
        details: Vec<ValidationDetail>,
    },

    /// Well-formed request that the data cannot satisfy yet.
    #[error("Unprocessable: {0}")]
    Unprocessable(String),

    /// The registry refused or never accepted a submission.
    #[error("Registry error: {message}")]
    Registry {
        message: String,
        submission_id: Option<Uuid>,
        retryable: bool,
    },

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<Vec<ValidationDetail>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    submission_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retryable: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationDetail {
    pub field: String,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = ErrorBody {
            error: String::new(),
            message: String::new(),
            details: None,
            submission_id: None,
            retryable: None,
        };

        let (status, error_code) = match self {
            ApiError::NotFound(msg) => {
                body.message = msg;
                (StatusCode::NOT_FOUND, "not_found")
            }
            ApiError::Conflict(msg) => {
                body.message = msg;
                (StatusCode::CONFLICT, "conflict")
            }
            ApiError::Validation(msg) => {
                body.message = msg;
                (StatusCode::BAD_REQUEST, "validation_error")
            }
            ApiError::InvalidFields { message, details } => {
                body.message = message;
                body.details = Some(details);
                (StatusCode::BAD_REQUEST, "validation_error")
            }
            ApiError::Unprocessable(msg) => {
                body.message = msg;
                (StatusCode::UNPROCESSABLE_ENTITY, "unprocessable")
            }
            ApiError::Registry {
                message,
                submission_id,
                retryable,
            } => {
                body.message = message;
                body.submission_id = submission_id;
                body.retryable = Some(retryable);
                (StatusCode::BAD_GATEWAY, "registry_error")
            }
            ApiError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                body.message = "An internal error occurred".into();
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error")
            }
            ApiError::ServiceUnavailable(msg) => {
                body.message = msg;
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
        };
        body.error = error_code.into();

        (status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => ApiError::NotFound("Resource not found".into()),
            sqlx::Error::Database(db_err) => match db_err.code().as_deref() {
                Some("23505") => ApiError::Conflict("Resource already exists".into()),
                Some("23514") => ApiError::Validation("Value violates a table constraint".into()),
                _ => ApiError::Internal(format!("Database error: {}", db_err)),
            },
            sqlx::Error::PoolTimedOut => {
                ApiError::ServiceUnavailable("Database connection pool exhausted".into())
            }
            _ => ApiError::Internal(format!("Database error: {}", err)),
        }
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        let mut details: Vec<ValidationDetail> = errors
            .field_errors()
            .iter()
            .flat_map(|(field, errors)| {
                errors.iter().map(move |e| ValidationDetail {
                    field: field.to_string(),
                    message: e
                        .message
                        .clone()
                        .map(|m| m.to_string())
                        .unwrap_or_else(|| e.code.to_string()),
                })
            })
            .collect();
        details.sort_by(|a, b| a.field.cmp(&b.field));

        let message = if details.len() == 1 {
            details[0].message.clone()
        } else {
            format!("{} validation errors", details.len())
        };

        ApiError::InvalidFields { message, details }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => ApiError::NotFound(format!("{} not found", what)),
            StoreError::Duplicate(msg) => ApiError::Conflict(msg),
            StoreError::Terminal(id) => {
                ApiError::Conflict(format!("Submission {} is already final", id))
            }
            StoreError::Conflict(id) => {
                ApiError::Conflict(format!("Submission {} is being updated elsewhere", id))
            }
            StoreError::InvalidTransition(msg) => ApiError::Internal(msg),
            StoreError::Unavailable(msg) => ApiError::ServiceUnavailable(msg),
            StoreError::Corrupt(msg) => ApiError::Internal(msg),
        }
    }
}

impl From<AggregationError> for ApiError {
    fn from(err: AggregationError) -> Self {
        match err {
            AggregationError::InvalidArgument(msg) => ApiError::Validation(msg),
            e @ AggregationError::NoData { .. } => ApiError::NotFound(e.to_string()),
            e @ AggregationError::InsufficientData { .. } => ApiError::Unprocessable(e.to_string()),
            AggregationError::Storage(e) => e.into(),
        }
    }
}

impl From<SubmissionError> for ApiError {
    fn from(err: SubmissionError) -> Self {
        let submission_id = err.submission_id();
        let retryable = err.may_succeed_later();
        match err {
            SubmissionError::InvalidArgument(msg) => ApiError::Validation(msg),
            SubmissionError::NotFound(id) => {
                ApiError::NotFound(format!("Submission {} not found", id))
            }
            e @ (SubmissionError::RetryableExhausted { .. }
            | SubmissionError::NonRetryable { .. }
            | SubmissionError::RegistryUnavailable { .. }) => ApiError::Registry {
                message: e.to_string(),
                submission_id,
                retryable,
            },
            e @ SubmissionError::InvalidState(..) => ApiError::Conflict(e.to_string()),
            SubmissionError::Serialization(e) => {
                ApiError::Internal(format!("Payload serialization failed: {}", e))
            }
            SubmissionError::Storage(e) => e.into(),
        }
    }
}

impl From<CursorError> for ApiError {
    fn from(err: CursorError) -> Self {
        ApiError::Validation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use domain::models::ErrorClass;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_status_codes() {
        let cases = [
            (ApiError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (ApiError::Conflict("x".into()), StatusCode::CONFLICT),
            (ApiError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (ApiError::Unprocessable("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (
                ApiError::Internal("x".into()),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                ApiError::ServiceUnavailable("x".into()),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (error, status) in cases {
            assert_eq!(error.into_response().status(), status);
        }
    }

    #[tokio::test]
    async fn test_internal_error_hides_message() {
        let response = ApiError::Internal("password=hunter2".into()).into_response();
        let body = body_json(response).await;
        assert_eq!(body["error"], "internal_error");
        assert_eq!(body["message"], "An internal error occurred");
    }

    #[test]
    fn test_from_sqlx_row_not_found() {
        let error: ApiError = sqlx::Error::RowNotFound.into();
        match error {
            ApiError::NotFound(msg) => assert_eq!(msg, "Resource not found"),
            _ => panic!("Expected NotFound error"),
        }
    }

    #[test]
    fn test_from_aggregation_errors() {
        let now = Utc::now();
        let no_data: ApiError = AggregationError::NoData {
            device_id: "ESP32_001".into(),
            start: now,
            end: now,
        }
        .into();
        assert!(matches!(no_data, ApiError::NotFound(_)));

        let insufficient: ApiError = AggregationError::InsufficientData {
            device_id: "ESP32_001".into(),
            total: 4,
        }
        .into();
        assert!(matches!(insufficient, ApiError::Unprocessable(_)));

        let invalid: ApiError = AggregationError::InvalidArgument("bad window".into()).into();
        assert!(matches!(invalid, ApiError::Validation(_)));

        let storage: ApiError =
            AggregationError::Storage(StoreError::Unavailable("down".into())).into();
        assert!(matches!(storage, ApiError::ServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_registry_failure_carries_submission_id() {
        let id = Uuid::new_v4();
        let error: ApiError = SubmissionError::NonRetryable {
            submission_id: id,
            class: ErrorClass::Validation,
            message: "bad document".into(),
        }
        .into();

        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = body_json(response).await;
        assert_eq!(body["error"], "registry_error");
        assert_eq!(body["submission_id"], id.to_string());
        assert_eq!(body["retryable"], false);
    }

    #[test]
    fn test_exhausted_retries_are_retryable() {
        let error: ApiError = SubmissionError::RetryableExhausted {
            submission_id: Uuid::new_v4(),
            attempts: 4,
            class: ErrorClass::Transient,
            message: "HTTP 503".into(),
        }
        .into();
        assert!(matches!(error, ApiError::Registry { retryable: true, .. }));
    }

    #[test]
    fn test_from_store_errors() {
        let terminal: ApiError = StoreError::Terminal(Uuid::new_v4()).into();
        assert!(matches!(terminal, ApiError::Conflict(_)));
        let missing: ApiError = StoreError::NotFound("submission".into()).into();
        assert!(matches!(missing, ApiError::NotFound(_)));
        let raced: ApiError = StoreError::Conflict(Uuid::new_v4()).into();
        assert!(matches!(raced, ApiError::Conflict(_)));
        let illegal: ApiError = StoreError::InvalidTransition("PENDING -> VERIFIED".into()).into();
        assert!(matches!(illegal, ApiError::Internal(_)));
    }

    #[test]
    fn test_from_cursor_error() {
        let error: ApiError = CursorError::InvalidEncoding.into();
        match error {
            ApiError::Validation(msg) => assert_eq!(msg, "Invalid cursor encoding"),
            _ => panic!("Expected Validation error"),
        }
    }

    #[tokio::test]
    async fn test_validation_details_are_returned() {
        let mut errors = validator::ValidationErrors::new();
        let mut e = validator::ValidationError::new("range");
        e.message = Some("efficiency must be within [0, 1]".into());
        errors.add("efficiency", e);

        let error: ApiError = errors.into();
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["message"], "efficiency must be within [0, 1]");
        assert_eq!(body["details"][0]["field"], "efficiency");
    }
}
