//! Caller identity from the upstream authentication layer
//!
//! The gateway in front of this service authenticates users and forwards
//! `X-User-Id` and `X-User-Role`. Only `user` and `admin` are accepted from
//! outside; the `system` role is reserved for background work.

use axum::{extract::FromRequestParts, http::request::Parts};
use std::convert::Infallible;

use crate::error::AppError;
use crate::middleware::logging::request_id;
use crate::services::payment_orchestrator::{Actor, ActorRole};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_ROLE_HEADER: &str = "x-user-role";

/// Resolve the caller from request headers. A missing role means `user`.
pub fn actor_from_headers(headers: &http::HeaderMap) -> Result<Actor, AppError> {
    let id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::unauthenticated("missing X-User-Id header"))?;

    let role = match headers
        .get(USER_ROLE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase())
        .as_deref()
    {
        None | Some("") | Some("user") => ActorRole::User,
        Some("admin") => ActorRole::Admin,
        Some("system") => {
            return Err(AppError::forbidden(
                "the system role cannot be asserted by a client",
            ))
        }
        Some(other) => {
            return Err(AppError::unauthenticated(format!(
                "unrecognized role '{}'",
                other
            )))
        }
    };

    Ok(Actor {
        id: id.to_string(),
        role,
    })
}

impl<S: Send + Sync> FromRequestParts<S> for Actor {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        actor_from_headers(&parts.headers).map_err(|e| match request_id(&parts.headers) {
            Some(id) => e.with_request_id(id),
            None => e,
        })
    }
}

/// An [`Actor`] holding the admin role
#[derive(Debug, Clone)]
pub struct AdminActor(pub Actor);

impl<S: Send + Sync> FromRequestParts<S> for AdminActor {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let actor = Actor::from_request_parts(parts, state).await?;
        if actor.role != ActorRole::Admin {
            let err = AppError::forbidden("admin role required");
            return Err(match request_id(&parts.headers) {
                Some(id) => err.with_request_id(id),
                None => err,
            });
        }
        Ok(AdminActor(actor))
    }
}

/// The `x-request-id` of the current request, used as the audit correlation id
#[derive(Debug, Clone)]
pub struct Correlation(pub String);

impl Correlation {
    /// Attach this request's id to an error on its way out
    pub fn tag(&self, error: impl Into<AppError>) -> AppError {
        error.into().with_request_id(self.0.clone())
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Correlation {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(Correlation(
            request_id(&parts.headers).unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderMap;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (k, v) in pairs {
            headers.insert(*k, v.parse().unwrap());
        }
        headers
    }

    #[test]
    fn test_user_is_default_role() {
        let actor = actor_from_headers(&headers(&[(USER_ID_HEADER, "u-1")])).unwrap();
        assert_eq!(actor, Actor::user("u-1"));
    }

    #[test]
    fn test_admin_role_is_case_insensitive() {
        let actor =
            actor_from_headers(&headers(&[(USER_ID_HEADER, "ops"), (USER_ROLE_HEADER, "Admin")]))
                .unwrap();
        assert!(actor.is_privileged());
    }

    #[test]
    fn test_missing_user_is_unauthenticated() {
        let err = actor_from_headers(&headers(&[(USER_ROLE_HEADER, "admin")])).unwrap_err();
        assert_eq!(err.status_code(), 401);
    }

    #[test]
    fn test_system_role_is_refused() {
        let err =
            actor_from_headers(&headers(&[(USER_ID_HEADER, "x"), (USER_ROLE_HEADER, "system")]))
                .unwrap_err();
        assert_eq!(err.status_code(), 403);
    }
}
