//! Authentication extractor.
//!
//! Devices present their API key as a Bearer token. When the server has no
//! `AUTH_SECRET` configured every request is let through as anonymous.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::error::AppError;
use crate::AppState;

/// Authenticated caller extracted from request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthUser {
    /// Presented the configured API key
    Device,
    /// No secret configured
    Anonymous,
}

impl AuthUser {
    pub fn is_anonymous(&self) -> bool {
        matches!(self, AuthUser::Anonymous)
    }
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(secret) = state.config.auth_secret.as_deref() else {
            return Ok(AuthUser::Anonymous);
        };

        let auth_header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok());

        match auth_header.and_then(|h| h.strip_prefix("Bearer ")) {
            Some(token) if !token.is_empty() && token == secret => Ok(AuthUser::Device),
            Some(_) => {
                tracing::warn!(path = %parts.uri.path(), "rejected bearer token");
                Err(AppError::Unauthorized)
            }
            None => Err(AppError::Unauthorized),
        }
    }
}
