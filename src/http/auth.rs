use axum::extract::FromRequestParts;
use axum::http::header;
use axum::http::request::Parts;

use crate::error::Error;
use crate::store::users::User;

use super::AppState;

/// Authenticated caller, resolved from a bearer token in the
/// `Authorization` header or a `session` cookie.
pub struct AuthUser(pub User);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = Error;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .or_else(|| cookie_token(parts))
            .ok_or(Error::Unauthorized)?;
        let user = state
            .users
            .find_by_token(&token)?
            .ok_or(Error::Unauthorized)?;
        Ok(AuthUser(user))
    }
}

fn bearer_token(parts: &Parts) -> Option<String> {
    let value = parts.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    value
        .strip_prefix("Bearer ")
        .map(|token| token.trim().to_string())
}

fn cookie_token(parts: &Parts) -> Option<String> {
    let value = parts.headers.get(header::COOKIE)?.to_str().ok()?;
    value.split(';').find_map(|pair| {
        pair.trim()
            .strip_prefix("session=")
            .map(|token| token.to_string())
    })
}
