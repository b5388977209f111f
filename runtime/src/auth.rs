//! Cookie sessions for configured users.
//!
//! `POST /login` checks credentials and issues a `session_token` cookie;
//! [`require_session`] resolves that cookie to a [`CurrentUser`] for every
//! protected route.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use bcrypt::BcryptError;
use config_loader::UserEntry;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::server::AppState;
use crate::UserId;

pub const SESSION_COOKIE: &str = "session_token";

/// Authenticated caller, inserted into request extensions by [`require_session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CurrentUser(pub UserId);

/// Known users plus live sessions.
#[derive(Debug, Clone, Default)]
pub struct AuthState {
    users: Arc<HashMap<String, UserEntry>>,
    sessions: Arc<RwLock<HashMap<String, UserId>>>,
}

impl AuthState {
    pub fn new(users: Vec<UserEntry>) -> Self {
        let users = users
            .into_iter()
            .map(|user| (user.username.clone(), user))
            .collect();
        Self {
            users: Arc::new(users),
            sessions: Arc::default(),
        }
    }

    /// User id for valid credentials. Unknown user and wrong password are not distinguished.
    /// The bcrypt comparison runs on the blocking pool.
    pub async fn verify(&self, username: &str, password: &str) -> Option<UserId> {
        let user = self.users.get(username)?.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || {
            verify_password(&user.password_hash, &password).then_some(user.id)
        })
        .await
        .ok()
        .flatten()
    }

    pub async fn open_session(&self, user: UserId) -> String {
        let token = Uuid::new_v4().simple().to_string();
        self.sessions.write().await.insert(token.clone(), user);
        token
    }

    pub async fn resolve(&self, token: &str) -> Option<UserId> {
        self.sessions.read().await.get(token).copied()
    }

    pub async fn close_session(&self, token: &str) -> bool {
        self.sessions.write().await.remove(token).is_some()
    }
}

/// bcrypt hash of `password`, in the form `passwordHash` expects.
pub fn hash_password(password: &str, cost: u32) -> Result<String, BcryptError> {
    bcrypt::hash(password, cost)
}

pub fn verify_password(stored: &str, password: &str) -> bool {
    match bcrypt::verify(password, stored) {
        Ok(matched) => matched,
        Err(err) => {
            warn!(error = %err, "stored password hash is not usable");
            false
        }
    }
}

/// Value of the session cookie, if the request carries one.
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/login", post(login))
        .route("/logout", post(logout))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn login(State(state): State<AppState>, body: axum::body::Bytes) -> Response {
    let request: LoginRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(_) => return (StatusCode::BAD_REQUEST, "Invalid request").into_response(),
    };

    let Some(user) = state.auth.verify(&request.username, &request.password).await else {
        warn!(username = %request.username, "login rejected");
        return (StatusCode::UNAUTHORIZED, "Invalid credentials").into_response();
    };

    let token = state.auth.open_session(user).await;
    info!(user, "session opened");

    let cookie = format!("{}={}; Path=/; HttpOnly", SESSION_COOKIE, token);
    match HeaderValue::from_str(&cookie) {
        Ok(value) => (
            StatusCode::OK,
            [(header::SET_COOKIE, value)],
            Json(serde_json::json!({ "message": "Logged in" })),
        )
            .into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(token) = session_token(&headers) {
        if state.auth.close_session(&token).await {
            debug!("session closed");
        }
    }

    let expired = HeaderValue::from_static("session_token=; Path=/; Max-Age=0; HttpOnly");
    (StatusCode::OK, [(header::SET_COOKIE, expired)], "Logged out").into_response()
}

/// Reject requests without a live session; otherwise attach [`CurrentUser`].
pub async fn require_session(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = session_token(request.headers()) else {
        debug!("no session cookie present - returning 401");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    };

    match state.auth.resolve(&token).await {
        Some(user) => {
            request.extensions_mut().insert(CurrentUser(user));
            next.run(request).await
        }
        None => {
            warn!("unknown session token");
            (StatusCode::UNAUTHORIZED, "Invalid username or token.").into_response()
        }
    }
}
