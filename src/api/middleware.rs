use crate::api::{ApiError, ApiResult};
use crate::app::AppState;
use crate::auth::Client;
use crate::model::enums::ResourceType;
use crate::model::item::UserAccount;
use crate::schema::user_account;
use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use diesel::prelude::*;

/// Resolves the acting principal. Authentication proper happens upstream of
/// this service; the `X-User-Id` header names an already-authenticated user,
/// and its absence means an anonymous caller.
pub async fn auth(State(state): State<AppState>, mut request: Request, next: Next) -> ApiResult<Response> {
    let client = match request.headers().get("x-user-id") {
        None => Client::anonymous(),
        Some(value) => {
            let id = value.to_str().map_err(|_| ApiError::NotLoggedIn)?;
            let mut conn = state.get_connection()?;
            let user: Option<UserAccount> = user_account::table
                .find(id)
                .select(UserAccount::as_select())
                .first(&mut conn)
                .optional()?;
            let user = user.ok_or(ApiError::NotFound(ResourceType::User))?;
            Client::new(Some(user.id), user.admin)
        }
    };
    request.extensions_mut().insert(client);
    Ok(next.run(request).await)
}
