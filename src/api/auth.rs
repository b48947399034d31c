//! Bearer credential extraction
//!
//! Tokens are never stored; only their SHA-256 digest is looked up.

use super::handlers::AppError;
use super::AppState;
use crate::access::Identity;
use crate::error::TurnError;
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use sha2::{Digest, Sha256};
use std::fmt::Write;

/// Hex SHA-256 digest of a bearer token
pub fn key_digest(token: &str) -> String {
    Sha256::digest(token.as_bytes())
        .iter()
        .fold(String::with_capacity(64), |mut out, byte| {
            let _ = write!(out, "{byte:02x}");
            out
        })
}

/// The authenticated caller
pub struct Caller(pub Identity);

#[async_trait]
impl FromRequestParts<AppState> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, AppError> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError(TurnError::Unauthenticated))?;

        match state
            .credentials
            .identity_for_key(&key_digest(bearer.token()))
            .await?
        {
            Some(identity) => Ok(Caller(identity)),
            None => {
                tracing::info!("Rejected unknown credential");
                Err(AppError(TurnError::Unauthenticated))
            }
        }
    }
}
