use axum::{
    extract::{FromRef, Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::{
    auth::{
        dto::{AuthResponse, CreateUserRequest, LoginRequest, PublicUser, RegisterRequest},
        errors::AuthError,
        extractors::AuthUser,
        jwt::TokenIssuer,
        services::{is_valid_email, normalize_email},
    },
    state::AppState,
};

const MIN_PASSWORD_LEN: usize = 8;

pub fn auth_routes() -> Router<AppState> {
    Router::new()
        .route("/auth", post(create).get(find_all))
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/check-token", get(check_token))
        .route("/auth/:id", get(find_by_id))
}

pub fn me_routes() -> Router<AppState> {
    Router::new().route("/me", get(get_me))
}

fn validate_signup(email: &str, name: &str, password: &str) -> Result<(), AuthError> {
    let email = normalize_email(email);
    if !is_valid_email(&email) {
        warn!(email = %email, "invalid email");
        return Err(AuthError::InvalidInput("invalid email".into()));
    }
    if name.trim().is_empty() {
        return Err(AuthError::InvalidInput("name is required".into()));
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        warn!("password too short");
        return Err(AuthError::InvalidInput("password too short".into()));
    }
    Ok(())
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<AuthResponse>, AuthError> {
    validate_signup(&payload.email, &payload.name, &payload.password)?;
    let res = state
        .service
        .register(&payload.email, &payload.name, &payload.password)
        .await?;
    Ok(Json(res))
}

#[instrument(skip(state, payload))]
pub async fn login(
    State(state): State<AppState>,
    Json(payload): Json<LoginRequest>,
) -> Result<Json<AuthResponse>, AuthError> {
    if !is_valid_email(&normalize_email(&payload.email)) || payload.password.is_empty() {
        return Err(AuthError::InvalidCredentials);
    }
    let res = state.service.login(&payload.email, &payload.password).await?;
    Ok(Json(res))
}

#[instrument(skip(state, payload))]
pub async fn create(
    State(state): State<AppState>,
    Json(payload): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<PublicUser>), AuthError> {
    validate_signup(&payload.email, &payload.name, &payload.password)?;
    let user = state
        .service
        .create(&payload.email, &payload.name, &payload.password, payload.roles)
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[instrument(skip(state))]
pub async fn find_all(
    State(state): State<AppState>,
    AuthUser(_user_id): AuthUser,
) -> Result<Json<Vec<PublicUser>>, AuthError> {
    Ok(Json(state.service.find_all().await?))
}

#[instrument(skip(state))]
pub async fn find_by_id(
    State(state): State<AppState>,
    AuthUser(_user_id): AuthUser,
    Path(id): Path<Uuid>,
) -> Result<Json<PublicUser>, AuthError> {
    Ok(Json(state.service.find_by_id(id).await?))
}

/// Re-issues a token for the bearer of a valid one.
#[instrument(skip(state))]
pub async fn check_token(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<AuthResponse>, AuthError> {
    let user = state.service.find_by_id(user_id).await?;
    let token = TokenIssuer::from_ref(&state).issue(user.id)?;
    Ok(Json(AuthResponse { user, token }))
}

#[instrument(skip(state))]
pub async fn get_me(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<PublicUser>, AuthError> {
    Ok(Json(state.service.find_by_id(user_id).await?))
}
