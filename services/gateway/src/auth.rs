use crate::error::AppError;
use crate::state::AppState;
use axum::{
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use types::ids::UserId;

/// What a token holder may do. Tokens without a role are traders.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Trader,
    /// Price feed bridge; may write market prices
    Relay,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// The user's id
    pub sub: String,
    pub exp: usize,
    #[serde(default)]
    pub role: Role,
}

/// HS256 signing material shared by every request.
pub struct AuthKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl AuthKeys {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// Sign a trader token for `user_id`, valid until `exp` (Unix seconds).
    pub fn issue(&self, user_id: UserId, exp: usize) -> Result<String, AppError> {
        self.issue_as(user_id, Role::Trader, exp)
    }

    pub fn issue_as(&self, user_id: UserId, role: Role, exp: usize) -> Result<String, AppError> {
        let claims = Claims {
            sub: user_id.to_string(),
            exp,
            role,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| AppError::InternalError(anyhow::anyhow!("token signing failed: {}", e)))
    }

    pub fn verify(&self, token: &str) -> Result<AuthenticatedUser, AppError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)
            .map_err(|e| AppError::Unauthorized(format!("Invalid token: {}", e)))?;
        let user_id = data
            .claims
            .sub
            .parse()
            .map_err(|_| AppError::Unauthorized("Token subject is not a user id".into()))?;
        Ok(AuthenticatedUser {
            user_id,
            role: data.claims.role,
        })
    }
}

pub struct AuthenticatedUser {
    pub user_id: UserId,
    pub role: Role,
}

impl AuthenticatedUser {
    pub fn require(&self, role: Role) -> Result<(), AppError> {
        if self.role == role {
            Ok(())
        } else {
            Err(AppError::Forbidden(format!("{:?} role required", role)))
        }
    }
}

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = AppState::from_ref(state);

        if let Some(auth_header) = parts.headers.get("Authorization") {
            let auth_str = auth_header
                .to_str()
                .map_err(|_| AppError::Unauthorized("Invalid header string".into()))?;
            let token = auth_str
                .strip_prefix("Bearer ")
                .ok_or_else(|| AppError::Unauthorized("Expected a bearer token".into()))?;
            return state.auth.verify(token);
        }

        // Browsers cannot set headers on a websocket upgrade
        if let Some(token) = query_token(parts.uri.query()) {
            return state.auth.verify(token);
        }

        Err(AppError::Unauthorized("Missing authentication credentials".to_string()))
    }
}

fn query_token(query: Option<&str>) -> Option<&str> {
    query?
        .split('&')
        .find_map(|pair| pair.strip_prefix("token="))
        .filter(|token| !token.is_empty())
}
