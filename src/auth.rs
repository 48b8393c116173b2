use crate::config::ConfigError;
use axum::http::HeaderMap;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Issued tokens stay valid for one day.
pub const TOKEN_TTL_SECONDS: i64 = 24 * 60 * 60;

/// Caller identity carried by a verified token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Identity {
    pub id: String,
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub id: ClaimId,
    #[serde(default)]
    pub email: String,
    pub iat: i64,
    pub exp: i64,
}

/// Account ids are numeric when issued here but other issuers use strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClaimId {
    Number(u64),
    Text(String),
}

impl std::fmt::Display for ClaimId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClaimId::Number(n) => write!(f, "{n}"),
            ClaimId::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("authentication token missing")]
    Missing,
    #[error("token rejected: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum VerifyError {
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Verifies and issues bearer tokens. The secret is optional so that a missing
/// secret surfaces per request instead of preventing startup.
#[derive(Clone)]
pub struct AuthState {
    secret: Option<Arc<str>>,
}

impl AuthState {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret
                .filter(|s| !s.trim().is_empty())
                .map(Arc::from),
        }
    }

    pub fn has_secret(&self) -> bool {
        self.secret.is_some()
    }

    fn secret(&self) -> Result<&str, ConfigError> {
        self.secret.as_deref().ok_or(ConfigError::Missing("JWT_SECRET"))
    }

    pub fn verify(&self, token: Option<&str>) -> Result<Identity, VerifyError> {
        let token = token.ok_or(AuthError::Missing)?;
        let secret = self.secret()?;
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|err| AuthError::Invalid(err.to_string()))?;
        Ok(Identity {
            id: data.claims.id.to_string(),
            email: data.claims.email,
        })
    }

    pub fn issue_token(&self, id: u64, email: &str) -> Result<String, ConfigError> {
        let secret = self.secret()?;
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            id: ClaimId::Number(id),
            email: email.to_string(),
            iat: now,
            exp: now + TOKEN_TTL_SECONDS,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .map_err(|err| ConfigError::Invalid {
            name: "JWT_SECRET",
            reason: err.to_string(),
        })
    }
}

/// Extracts the credential from `Authorization: <scheme> <token>`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())?;
    let (_, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    if token.is_empty() { None } else { Some(token) }
}
