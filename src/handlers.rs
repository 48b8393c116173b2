use crate::app::AppState;
use crate::error::{AppError, AppResult};
use crate::identity::{self, IdentityStoreError};
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use regex::Regex;
use serde::{Deserialize, Serialize};

const MIN_PASSWORD_LEN: usize = 6;

const EMAIL_PATTERN: &str = r"\S+@\S+\.\S+";

pub async fn root() -> &'static str {
    "AI Assistant Backend is running!"
}

pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl CredentialsRequest {
    fn into_parts(self) -> AppResult<(String, String)> {
        match (self.email, self.password) {
            (Some(email), Some(password)) if !email.trim().is_empty() && !password.is_empty() => {
                Ok((email.trim().to_string(), password))
            }
            _ => Err(AppError::new(
                StatusCode::BAD_REQUEST,
                "credentials_required",
                "Email and password are required.",
            )),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    pub message: &'static str,
    pub user_id: u64,
}

#[derive(Debug, Serialize)]
pub struct UserSummary {
    pub id: u64,
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub message: &'static str,
    pub token: String,
    pub user: UserSummary,
}

pub async fn register(
    State(state): State<AppState>,
    Json(body): Json<CredentialsRequest>,
) -> AppResult<impl IntoResponse> {
    let (email, password) = body.into_parts()?;

    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_password",
            "Password must be at least 6 characters long.",
        ));
    }
    let email_shape = Regex::new(EMAIL_PATTERN).map_err(|e| {
        AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string())
    })?;
    if !email_shape.is_match(&email) {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "invalid_email",
            "Invalid email format.",
        ));
    }

    let password_hash = identity::hash_password(&password)
        .map_err(|e| AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e))?;
    let user = state
        .identity_store
        .create_user(&email, password_hash)
        .await
        .map_err(|err| match err {
            IdentityStoreError::Conflict => {
                tracing::info!(email = %email, "registration rejected, email exists");
                AppError::new(
                    StatusCode::CONFLICT,
                    "user_exists",
                    "User with this email already exists.",
                )
            }
            IdentityStoreError::Backend(e) => AppError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("Failed to register user due to a server error: {e}"),
            ),
        })?;
    tracing::info!(user_id = user.id, "user registered");

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            message: "User registered successfully.",
            user_id: user.id,
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(body): Json<CredentialsRequest>,
) -> AppResult<impl IntoResponse> {
    let (email, password) = body.into_parts()?;
    let invalid = || {
        AppError::new(
            StatusCode::UNAUTHORIZED,
            "invalid_credentials",
            "Invalid email or password.",
        )
    };

    let user = state
        .identity_store
        .find_by_email(&email)
        .await
        .map_err(|e| {
            AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e.to_string())
        })?
        .ok_or_else(invalid)?;

    let valid = identity::verify_password(&password, &user.password_hash)
        .map_err(|e| AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", e))?;
    if !valid {
        tracing::info!(user_id = user.id, "login rejected, wrong password");
        return Err(invalid());
    }

    let token = state.auth.issue_token(user.id, &user.email).map_err(|err| {
        tracing::error!(error = %err, "cannot issue token");
        AppError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "server_misconfigured",
            "Login failed due to server configuration.",
        )
    })?;
    tracing::info!(user_id = user.id, "user logged in");

    Ok(Json(LoginResponse {
        message: "Login successful",
        token,
        user: UserSummary {
            id: user.id,
            email: user.email,
        },
    }))
}
