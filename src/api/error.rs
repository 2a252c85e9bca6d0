use crate::error::ErrorKind;
use crate::model::enums::ResourceType;
use crate::string::SmallString;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub enum ApiError {
    FailedConnection(#[from] diesel::r2d2::PoolError),
    FailedQuery(#[from] diesel::result::Error),
    #[error("Insufficient privileges")]
    InsufficientPrivileges,
    #[error("Validation Error: annotation doesn't follow schema ({0})")]
    InvalidAnnotation(String),
    #[error("Body is not a GeoJSON annotation: {0}")]
    InvalidGeoJson(String),
    #[error("Minimum age in days must be at least {0}")]
    InvalidMinimumAge(i64),
    #[error("keepInactiveVersions must be non-negative")]
    InvalidKeepVersions,
    JsonRejection(#[from] axum::extract::rejection::JsonRejection),
    JsonSerialization(#[from] serde_json::Error),
    #[error("Entries in the annotation list must be JSON objects")]
    MalformedBulkEntry,
    #[error("{0} not found")]
    NotFound(ResourceType),
    #[error("This action requires you to be logged in")]
    NotLoggedIn,
    PathRejection(#[from] axum::extract::rejection::PathRejection),
    QueryRejection(#[from] axum::extract::rejection::QueryRejection),
    Request(#[from] reqwest::Error),
    #[error("Element of type '{0}' cannot be represented as GeoJSON")]
    UnrepresentableElement(SmallString),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        use serde_json::error::Category;
        type QueryError = diesel::result::Error;

        let query_error_status_code = |err: &QueryError| match err {
            QueryError::NotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        match self {
            Self::JsonRejection(err) => err.status(),
            Self::PathRejection(err) => err.status(),
            Self::QueryRejection(err) => err.status(),
            Self::InvalidAnnotation(_)
            | Self::InvalidGeoJson(_)
            | Self::InvalidMinimumAge(_)
            | Self::InvalidKeepVersions
            | Self::MalformedBulkEntry
            | Self::Request(_)
            | Self::UnrepresentableElement(_) => StatusCode::BAD_REQUEST,
            Self::InsufficientPrivileges | Self::NotLoggedIn => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::FailedConnection(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::JsonSerialization(err) => match err.classify() {
                Category::Io | Category::Eof => StatusCode::INTERNAL_SERVER_ERROR,
                Category::Syntax | Category::Data => StatusCode::BAD_REQUEST,
            },
            Self::FailedQuery(err) => query_error_status_code(err),
        }
    }

    fn category(&self) -> &'static str {
        match self {
            Self::FailedConnection(_) => "Failed Connection",
            Self::FailedQuery(_) => "Failed Query",
            Self::InsufficientPrivileges => "Insufficient Privileges",
            Self::InvalidAnnotation(_) => "Invalid Annotation",
            Self::InvalidGeoJson(_) => "Invalid GeoJSON",
            Self::InvalidMinimumAge(_) => "Invalid Minimum Age",
            Self::InvalidKeepVersions => "Invalid Keep Versions",
            Self::JsonRejection(_) => "JSON Rejection",
            Self::JsonSerialization(_) => "JSON Serialization Error",
            Self::MalformedBulkEntry => "Malformed Bulk Entry",
            Self::NotFound(_) => "Resource Not Found",
            Self::NotLoggedIn => "Not Logged In",
            Self::PathRejection(_) => "Path Rejection",
            Self::QueryRejection(_) => "Query Rejection",
            Self::Request(_) => "Request Error",
            Self::UnrepresentableElement(_) => "Unrepresentable Element",
        }
    }

    fn response(&self) -> ErrorResponse {
        ErrorResponse {
            name: self.kind(),
            title: self.category(),
            description: self.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.response())).into_response()
    }
}

/// Represents a response if an error occured.
#[derive(Serialize)]
struct ErrorResponse {
    title: &'static str,
    name: &'static str,
    description: String,
}
