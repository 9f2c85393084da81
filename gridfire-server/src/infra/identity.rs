//! Caller identity.
//!
//! Authentication happens upstream; the gateway forwards the authenticated
//! account id in [`USER_ID_HEADER`]. Requests without it are rejected.

use axum::{extract::FromRequestParts, http::request::Parts};
use gridfire_model::UserId;

use super::errors::AppError;

pub const USER_ID_HEADER: &str = "x-user-id";

/// The authenticated account making the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller(pub UserId);

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(USER_ID_HEADER)
            .ok_or_else(|| AppError::unauthorized("Missing caller identity"))?;
        value
            .to_str()
            .ok()
            .and_then(|raw| raw.parse::<UserId>().ok())
            .map(Caller)
            .ok_or_else(|| AppError::unauthorized("Malformed caller identity"))
    }
}
