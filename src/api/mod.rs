mod annotation;
pub mod doc;
pub mod error;
pub mod extract;
mod item;
pub mod middleware;

pub use error::{ApiError, ApiResult};

use crate::app::AppState;
use crate::auth::Client;
use serde::{Deserialize, Serialize};
use utoipa::IntoParams;
use utoipa_axum::router::OpenApiRouter;

/// Returns all routes of the application, with authentication resolution
/// applied to each request.
pub fn routes(state: AppState) -> OpenApiRouter {
    OpenApiRouter::with_openapi(<doc::ApiDoc as utoipa::OpenApi>::openapi())
        .merge(annotation::routes())
        .merge(item::routes())
        .layer(axum::middleware::from_fn_with_state(state.clone(), middleware::auth))
        .with_state(state)
}

/// Checks that the client is an authenticated user. Returns an error
/// otherwise.
pub fn verify_logged_in(client: &Client) -> ApiResult<&crate::string::SmallString> {
    client.id.as_ref().ok_or(ApiError::NotLoggedIn)
}

/// Checks that the client is a site administrator. Returns an error
/// otherwise.
pub fn verify_admin(client: &Client) -> ApiResult<()> {
    if client.admin {
        Ok(())
    } else if client.id.is_none() {
        Err(ApiError::NotLoggedIn)
    } else {
        Err(ApiError::InsufficientPrivileges)
    }
}

/// Represents part of a request to retrieve multiple resources, paged.
#[derive(Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct PageParams {
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

impl PageParams {
    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }

    pub fn limit_or(&self, default: i64) -> i64 {
        self.limit.unwrap_or(default).max(0)
    }
}

/// Represents a response to a request to retrieve multiple resources, paged.
#[derive(Serialize)]
pub struct PagedResponse<T> {
    pub offset: i64,
    pub limit: i64,
    pub total: i64,
    pub results: Vec<T>,
}
