//! In-memory mock of the dashboard REST backend.
//!
//! Sessions are opaque tokens carried in a `session` cookie. Every
//! `/clients` route requires a live session and answers 401 with
//! `{"message":"session expired"}` otherwise. `GET /stats` reports how many
//! times each route was hit so tests can assert on request counts.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, sync::RwLock};
use tracing::{debug, info};
use uuid::Uuid;

pub const SESSION_COOKIE: &str = "session";

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Client {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub company: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateClient {
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateClient {
    pub name: Option<String>,
    pub email: Option<String>,
    pub company: Option<String>,
}

#[derive(Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct ListParams {
    pub delay_ms: Option<u64>,
}

/// Shared backend state. Cloning shares the same stores.
#[derive(Clone, Default)]
pub struct AppState {
    clients: Arc<RwLock<HashMap<Uuid, Client>>>,
    sessions: Arc<RwLock<HashSet<String>>>,
    hits: Arc<RwLock<BTreeMap<String, u64>>>,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every live session, as a server-side logout or expiry would.
    pub async fn revoke_all(&self) {
        let mut sessions = self.sessions.write().await;
        info!(revoked = sessions.len(), "revoking all sessions");
        sessions.clear();
    }

    pub async fn hits(&self, route: &str) -> u64 {
        self.hits.read().await.get(route).copied().unwrap_or(0)
    }

    async fn hit(&self, route: &str) {
        *self.hits.write().await.entry(route.to_string()).or_default() += 1;
    }

    async fn authorize(&self, headers: &HeaderMap) -> Result<(), ApiError> {
        let token = session_token(headers).ok_or(ApiError::SessionExpired)?;
        if self.sessions.read().await.contains(token) {
            Ok(())
        } else {
            Err(ApiError::SessionExpired)
        }
    }
}

/// Error responses, always rendered as `{"message": ...}`.
#[derive(Debug)]
pub enum ApiError {
    SessionExpired,
    InvalidCredentials,
    NotFound,
    Validation(&'static str),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::SessionExpired => (StatusCode::UNAUTHORIZED, "session expired"),
            ApiError::InvalidCredentials => (StatusCode::UNAUTHORIZED, "invalid credentials"),
            ApiError::NotFound => (StatusCode::NOT_FOUND, "client not found"),
            ApiError::Validation(message) => (StatusCode::UNPROCESSABLE_ENTITY, message),
        };
        (status, Json(serde_json::json!({ "message": message }))).into_response()
    }
}

pub fn app() -> Router {
    app_with_state(AppState::new())
}

pub fn app_with_state(state: AppState) -> Router {
    Router::new()
        .route("/session", post(login).delete(logout))
        .route("/clients", get(list_clients).post(create_client))
        .route(
            "/clients/{id}",
            get(get_client).put(update_client).delete(delete_client),
        )
        .route("/stats", get(stats))
        .with_state(state)
}

pub async fn run(listener: TcpListener) -> Result<(), std::io::Error> {
    serve(listener, AppState::new()).await
}

/// Serve with caller-owned state, so tests can revoke sessions or read hits.
pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), std::io::Error> {
    axum::serve(listener, app_with_state(state)).await
}

fn session_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, token)| token)
}

async fn login(
    State(state): State<AppState>,
    Json(input): Json<Credentials>,
) -> Result<impl IntoResponse, ApiError> {
    state.hit("POST /session").await;
    if input.username.trim().is_empty() || input.password.is_empty() {
        return Err(ApiError::InvalidCredentials);
    }
    let token = Uuid::new_v4().simple().to_string();
    state.sessions.write().await.insert(token.clone());
    info!(username = %input.username, "session opened");
    let cookie = format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly");
    Ok((StatusCode::NO_CONTENT, [(header::SET_COOKIE, cookie)]))
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    state.hit("DELETE /session").await;
    if let Some(token) = session_token(&headers) {
        state.sessions.write().await.remove(token);
    }
    let cookie = format!("{SESSION_COOKIE}=; Path=/; Max-Age=0");
    (StatusCode::NO_CONTENT, [(header::SET_COOKIE, cookie)])
}

async fn list_clients(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Client>>, ApiError> {
    state.hit("GET /clients").await;
    state.authorize(&headers).await?;
    if let Some(delay) = params.delay_ms {
        debug!(delay_ms = delay, "delaying list response");
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    let clients = state.clients.read().await;
    let mut list: Vec<Client> = clients.values().cloned().collect();
    list.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(Json(list))
}

async fn create_client(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CreateClient>,
) -> Result<(StatusCode, Json<Client>), ApiError> {
    state.hit("POST /clients").await;
    state.authorize(&headers).await?;
    if input.name.trim().is_empty() {
        return Err(ApiError::Validation("name must not be empty"));
    }
    let client = Client {
        id: Uuid::new_v4(),
        name: input.name,
        email: input.email,
        company: input.company,
    };
    state.clients.write().await.insert(client.id, client.clone());
    info!(id = %client.id, "client created");
    Ok((StatusCode::CREATED, Json(client)))
}

async fn get_client(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Client>, ApiError> {
    state.hit("GET /clients/{id}").await;
    state.authorize(&headers).await?;
    let clients = state.clients.read().await;
    clients.get(&id).cloned().map(Json).ok_or(ApiError::NotFound)
}

async fn update_client(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(input): Json<UpdateClient>,
) -> Result<Json<Client>, ApiError> {
    state.hit("PUT /clients/{id}").await;
    state.authorize(&headers).await?;
    if input.name.as_deref().is_some_and(|name| name.trim().is_empty()) {
        return Err(ApiError::Validation("name must not be empty"));
    }
    let mut clients = state.clients.write().await;
    let client = clients.get_mut(&id).ok_or(ApiError::NotFound)?;
    if let Some(name) = input.name {
        client.name = name;
    }
    if input.email.is_some() {
        client.email = input.email;
    }
    if input.company.is_some() {
        client.company = input.company;
    }
    Ok(Json(client.clone()))
}

async fn delete_client(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.hit("DELETE /clients/{id}").await;
    state.authorize(&headers).await?;
    let mut clients = state.clients.write().await;
    clients
        .remove(&id)
        .map(|_| StatusCode::NO_CONTENT)
        .ok_or(ApiError::NotFound)
}

async fn stats(State(state): State<AppState>) -> Json<BTreeMap<String, u64>> {
    Json(state.hits.read().await.clone())
}
