//! Bearer-token authentication for the RPC surface (spec.md §6).

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::error::CoordinatorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Participant,
    Coordinator,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
}

/// The authenticated caller of an RPC, resolved from the bearer token.
#[derive(Debug, Clone)]
pub struct Principal {
    pub identifier: String,
    pub role: Role,
}

impl Principal {
    pub fn is_coordinator(&self) -> bool {
        self.role == Role::Coordinator
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
    String: FromRef<S>,
{
    type Rejection = CoordinatorError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let jwt_secret = String::from_ref(state);
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| CoordinatorError::Auth("missing bearer token".to_string()))?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| CoordinatorError::Auth("malformed authorization header".to_string()))?;

        let claims = decode::<Claims>(
            token,
            &DecodingKey::from_secret(jwt_secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|e| CoordinatorError::Auth(format!("invalid token: {e}")))?
        .claims;

        Ok(Principal {
            identifier: claims.sub,
            role: claims.role,
        })
    }
}
