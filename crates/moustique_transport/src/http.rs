//! HTTP surface.
//!
//! A thin router over the broker operations. Every endpoint accepts GET and
//! POST; parameters come from the query string or the form body, each VALUE
//! (never the key) run through the obfuscation codec, and every JSON
//! response body is encoded the same way before it leaves. Tenant
//! resolution happens here: credentials select (and lazily create) the
//! tenant's broker, no credentials selects the shared anonymous broker when
//! public access is on.
//!
//! Middleware order per request: peer allowlist, admission cap, deadline,
//! then the handler. Handlers encode the full response before returning, so
//! no broker lock is ever held across network I/O.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, FromRequest, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tower_http::trace::TraceLayer;
use tracing::debug;

use moustique_broker::{Broker, BrokerManager};
use moustique_utils::{codec, time};

use crate::auth::{hash_password, UserAuth};
use crate::security::PeerAllowlist;

/// Maximum accepted form body.
const MAX_BODY_BYTES: usize = 1024 * 1024;
/// Lines returned by the LOG and ADMIN/SERVER_LOG endpoints.
const LOG_TAIL_LINES: usize = 100;

static ADMIN_HTML: &str = include_str!("../assets/admin.html");

/// Server-level knobs threaded into the router state.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub version: String,
    pub allow_public: bool,
    pub admin_password: String,
    pub server_log: Option<PathBuf>,
    pub request_timeout: Duration,
    pub max_connections: usize,
}

#[derive(Clone)]
pub struct AppState {
    manager: Arc<BrokerManager>,
    auth: Arc<UserAuth>,
    allowlist: Arc<PeerAllowlist>,
    version: String,
    allow_public: bool,
    admin_password_hash: String,
    server_log: Option<PathBuf>,
    request_timeout: Duration,
    admission: Arc<Semaphore>,
}

impl AppState {
    pub fn new(
        manager: Arc<BrokerManager>,
        auth: Arc<UserAuth>,
        allowlist: Arc<PeerAllowlist>,
        options: ServerOptions,
    ) -> Self {
        Self {
            manager,
            auth,
            allowlist,
            version: options.version,
            allow_public: options.allow_public,
            admin_password_hash: hash_password(&options.admin_password),
            server_log: options.server_log,
            request_timeout: options.request_timeout,
            admission: Arc::new(Semaphore::new(options.max_connections)),
        }
    }
}

/// Error mapped to a plain HTTP status and text body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request() -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: "Invalid request".to_string(),
        }
    }

    fn unauthorized(message: &str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: format!("Access denied: {message}"),
        }
    }

    fn not_found() -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: "404 Not Found".to_string(),
        }
    }

    fn internal<E: std::fmt::Display>(err: E) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("Error: {err}"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

/// Parameters from the query string and form body, values decoded through
/// the obfuscation codec. The first occurrence of a key wins.
pub struct Params(HashMap<String, String>);

impl Params {
    fn get(&self, key: &str) -> &str {
        self.0.get(key).map(String::as_str).unwrap_or("")
    }
}

impl<S> FromRequest<S> for Params
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, _state: &S) -> Result<Self, Self::Rejection> {
        let query = req.uri().query().unwrap_or("").to_string();

        let body = axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES)
            .await
            .map_err(|_| ApiError::bad_request())?;
        let body = std::str::from_utf8(&body).map_err(|_| ApiError::bad_request())?;

        let mut params = HashMap::new();
        for source in [query.as_str(), body] {
            if source.is_empty() {
                continue;
            }
            let pairs: Vec<(String, String)> =
                serde_urlencoded::from_str(source).map_err(|_| ApiError::bad_request())?;
            for (key, value) in pairs {
                params.entry(key).or_insert_with(|| codec::decode(&value));
            }
        }

        Ok(Params(params))
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(admin_ui).post(admin_ui))
        .route("/VERSION", get(version).post(version))
        .route("/FILEVERSION", get(fileversion).post(fileversion))
        .route("/PICKUP", get(pickup).post(pickup))
        .route("/POST", get(post_message).post(post_message))
        .route("/SUBSCRIBE", get(subscribe).post(subscribe))
        .route("/PUTVAL", get(putval).post(putval))
        .route("/GETVAL", get(getval).post(getval))
        .route("/GETVALSBYREGEX", get(getvals_by_regex).post(getvals_by_regex))
        .route("/STATS", get(stats).post(stats))
        .route("/STATUS", get(status_page).post(status_page))
        .route("/CLIENTS", get(clients).post(clients))
        .route("/POSTERS", get(posters).post(posters))
        .route("/TOPICS", get(topics).post(topics))
        .route("/LOG", get(tenant_log).post(tenant_log))
        .route("/ADMIN/LIST_USERS", get(admin_list_users).post(admin_list_users))
        .route("/ADMIN/ADD_USER", get(admin_add_user).post(admin_add_user))
        .route("/ADMIN/DELETE_USER", get(admin_delete_user).post(admin_delete_user))
        .route("/ADMIN/SERVER_LOG", get(admin_server_log).post(admin_server_log))
        .layer(middleware::from_fn_with_state(state.clone(), request_deadline))
        .layer(middleware::from_fn_with_state(state.clone(), admission))
        .layer(middleware::from_fn_with_state(state.clone(), check_peer))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the shutdown signal flips.
pub async fn serve(
    state: AppState,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let app = build_router(state);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown.changed().await;
    })
    .await
}

/// SHA-256 fingerprint of the running executable.
pub fn file_version() -> std::io::Result<String> {
    let mut file = std::fs::File::open(std::env::current_exe()?)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

// --- middleware ---

/// Reject peers the allowlist does not admit, before any parsing.
async fn check_peer(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    match peer {
        Some(ip) if state.allowlist.is_allowed(ip) => next.run(req).await,
        Some(ip) => {
            debug!(peer = %ip, "rejected disallowed peer");
            ApiError::unauthorized("Peer not allowed").into_response()
        }
        None => ApiError::unauthorized("Peer not allowed").into_response(),
    }
}

/// Global admission cap; requests beyond the cap are shed immediately.
async fn admission(State(state): State<AppState>, req: Request, next: Next) -> Response {
    match Arc::clone(&state.admission).try_acquire_owned() {
        Ok(_permit) => next.run(req).await,
        Err(_) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
    }
}

/// Per-request deadline.
async fn request_deadline(State(state): State<AppState>, req: Request, next: Next) -> Response {
    match tokio::time::timeout(state.request_timeout, next.run(req)).await {
        Ok(response) => response,
        Err(_) => StatusCode::REQUEST_TIMEOUT.into_response(),
    }
}

// --- helpers ---

fn encoded_json<T: Serialize>(value: &T) -> Result<Response, ApiError> {
    let json = serde_json::to_string(value).map_err(ApiError::internal)?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        codec::encode(&json),
    )
        .into_response())
}

fn ok_empty() -> Response {
    StatusCode::OK.into_response()
}

/// Resolve the broker a tenant request is addressed to, counting the
/// request against it.
fn resolve_broker(state: &AppState, params: &Params) -> Result<Arc<Broker>, ApiError> {
    let username = params.get("username");
    let password = params.get("password");

    let broker = if username.is_empty() || password.is_empty() {
        if !state.allow_public {
            return Err(ApiError::unauthorized("Username and password required"));
        }
        state
            .manager
            .default_broker()
            .ok_or_else(|| ApiError::internal("public access not configured"))?
    } else {
        if !state.auth.validate(username, password) {
            return Err(ApiError::unauthorized("Invalid credentials"));
        }
        state
            .manager
            .get_or_create(username)
            .map_err(ApiError::internal)?
    };

    broker.note_request();
    Ok(broker)
}

fn parse_updated_time(params: &Params) -> i64 {
    let raw = params.get("updated_time");
    if raw.is_empty() {
        return time::now();
    }
    raw.parse().unwrap_or_else(|_| time::now())
}

fn tail_lines(path: &Path, count: usize) -> std::io::Result<(Vec<String>, usize)> {
    let content = std::fs::read_to_string(path)?;
    let lines: Vec<&str> = content.lines().collect();
    let start = lines.len().saturating_sub(count);
    let tail = lines[start..].iter().map(|l| l.to_string()).collect();
    Ok((tail, lines.len()))
}

#[derive(Serialize)]
struct LogTail {
    lines: Vec<String>,
    total: usize,
}

// --- public endpoints ---

async fn admin_ui() -> Html<&'static str> {
    Html(ADMIN_HTML)
}

async fn version(State(state): State<AppState>) -> Result<Response, ApiError> {
    encoded_json(&state.version)
}

async fn fileversion() -> Result<Response, ApiError> {
    let version = file_version().map_err(|_| ApiError::not_found())?;
    encoded_json(&version)
}

// --- tenant endpoints ---

async fn pickup(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    params: Params,
) -> Result<Response, ApiError> {
    let client = params.get("client");
    if client.is_empty() {
        return Err(ApiError::not_found());
    }

    let broker = resolve_broker(&state, &params)?;
    let start = Instant::now();
    let messages = broker.pickup(client, &peer.ip().to_string());
    broker.add_serve_time(start.elapsed().as_secs_f64() * 1000.0);
    encoded_json(&messages)
}

async fn post_message(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    params: Params,
) -> Result<Response, ApiError> {
    let topic = params.get("topic");
    let message = params.get("message");
    if topic.is_empty() || message.is_empty() {
        return Err(ApiError::not_found());
    }

    let broker = resolve_broker(&state, &params)?;
    let start = Instant::now();
    broker
        .publish(
            topic,
            message,
            params.get("from"),
            &peer.ip().to_string(),
            parse_updated_time(&params),
        )
        .map_err(ApiError::internal)?;
    broker.add_serve_time(start.elapsed().as_secs_f64() * 1000.0);
    Ok(ok_empty())
}

async fn subscribe(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    params: Params,
) -> Result<Response, ApiError> {
    let topic = params.get("topic");
    let client = params.get("client");
    if topic.is_empty() || client.is_empty() {
        return Err(ApiError::not_found());
    }

    let broker = resolve_broker(&state, &params)?;
    let start = Instant::now();
    broker
        .subscribe(topic, client, &peer.ip().to_string())
        .map_err(ApiError::internal)?;
    broker.add_serve_time(start.elapsed().as_secs_f64() * 1000.0);
    Ok(ok_empty())
}

async fn putval(State(state): State<AppState>, params: Params) -> Result<Response, ApiError> {
    let valname = params.get("valname");
    let val = params.get("val");
    let message = params.get("message");
    if valname.is_empty() || (val.is_empty() && message.is_empty()) {
        return Err(ApiError::not_found());
    }

    let broker = resolve_broker(&state, &params)?;
    let start = Instant::now();
    broker
        .put_value(
            valname,
            val,
            message,
            params.get("from"),
            parse_updated_time(&params),
        )
        .map_err(ApiError::internal)?;
    broker.add_serve_time(start.elapsed().as_secs_f64() * 1000.0);
    Ok(ok_empty())
}

async fn getval(State(state): State<AppState>, params: Params) -> Result<Response, ApiError> {
    let topic = params.get("topic");
    if topic.is_empty() {
        return Err(ApiError::not_found());
    }

    let broker = resolve_broker(&state, &params)?;
    let start = Instant::now();
    let value = broker.get_value(topic).map_err(|_| ApiError::not_found())?;
    broker.add_serve_time(start.elapsed().as_secs_f64() * 1000.0);
    encoded_json(&value)
}

async fn getvals_by_regex(
    State(state): State<AppState>,
    params: Params,
) -> Result<Response, ApiError> {
    let pattern = params.get("topic");
    if pattern.is_empty() {
        return Err(ApiError::not_found());
    }

    let broker = resolve_broker(&state, &params)?;
    let start = Instant::now();
    let values = broker
        .get_values_by_regex(pattern)
        .map_err(ApiError::internal)?;
    broker.add_serve_time(start.elapsed().as_secs_f64() * 1000.0);
    encoded_json(&values)
}

async fn stats(State(state): State<AppState>, params: Params) -> Result<Response, ApiError> {
    let broker = resolve_broker(&state, &params)?;
    encoded_json(&broker.get_stats())
}

async fn clients(State(state): State<AppState>, params: Params) -> Result<Response, ApiError> {
    let broker = resolve_broker(&state, &params)?;
    encoded_json(&broker.get_clients())
}

async fn posters(State(state): State<AppState>, params: Params) -> Result<Response, ApiError> {
    let broker = resolve_broker(&state, &params)?;
    encoded_json(&broker.get_posters())
}

async fn topics(State(state): State<AppState>, params: Params) -> Result<Response, ApiError> {
    let broker = resolve_broker(&state, &params)?;
    encoded_json(&broker.get_topics())
}

async fn status_page(State(state): State<AppState>, params: Params) -> Result<Response, ApiError> {
    let broker = resolve_broker(&state, &params)?;
    let stats = broker.get_stats();
    let pretty = serde_json::to_string_pretty(&stats).map_err(ApiError::internal)?;

    let html = format!(
        "<html>\n<head><title>Moustique Status</title></head>\n<body>\n\
         <h1>Moustique Status</h1>\n\
         <p>Version: {}</p>\n<p>Started: {}</p>\n\
         <h2>Statistics</h2>\n<pre>{}</pre>\n</body>\n</html>",
        state.version, stats.started, pretty
    );
    Ok(Html(html).into_response())
}

async fn tenant_log(State(state): State<AppState>, params: Params) -> Result<Response, ApiError> {
    let broker = resolve_broker(&state, &params)?;
    let Some(path) = broker.user_log_path() else {
        return Err(ApiError::not_found());
    };
    let (lines, total) = tail_lines(path, LOG_TAIL_LINES).map_err(|_| ApiError::not_found())?;
    encoded_json(&LogTail { lines, total })
}

// --- admin endpoints ---

fn require_admin(state: &AppState, params: &Params) -> Result<(), ApiError> {
    if hash_password(params.get("admin_password")) != state.admin_password_hash {
        return Err(ApiError::unauthorized("Invalid admin password"));
    }
    Ok(())
}

#[derive(Serialize)]
struct UserInfo {
    username: String,
    requests: u64,
    messages: u64,
    topics: usize,
    clients: usize,
}

#[derive(Serialize)]
struct UserListing {
    users: Vec<UserInfo>,
    total: usize,
    total_requests: u64,
    total_messages: u64,
    requests_per_minute: u64,
    messages_per_minute: u64,
    active_brokers: usize,
}

async fn admin_list_users(
    State(state): State<AppState>,
    params: Params,
) -> Result<Response, ApiError> {
    require_admin(&state, &params)?;

    let mut entries: Vec<(String, Option<Arc<Broker>>)> = Vec::new();
    if let Some(broker) = state.manager.default_broker() {
        entries.push(("public".to_string(), Some(broker)));
    }
    for username in state.auth.usernames() {
        let broker = state.manager.get(&username);
        entries.push((username, broker));
    }

    let mut users = Vec::new();
    let mut total_requests = 0;
    let mut total_messages = 0;
    let mut requests_per_minute = 0;
    let mut messages_per_minute = 0;
    let mut active_brokers = 0;

    for (username, broker) in entries {
        let mut info = UserInfo {
            username,
            requests: 0,
            messages: 0,
            topics: 0,
            clients: 0,
        };
        if let Some(broker) = broker {
            let usage = broker.usage_summary();
            info.requests = usage.requests;
            info.messages = usage.messages;
            info.topics = usage.topics;
            info.clients = usage.clients;

            total_requests += usage.requests;
            total_messages += usage.messages;
            requests_per_minute += usage.requests_last_minute;
            messages_per_minute += usage.messages_last_minute;
            if usage.requests > 0 {
                active_brokers += 1;
            }
        }
        users.push(info);
    }

    encoded_json(&UserListing {
        total: users.len(),
        users,
        total_requests,
        total_messages,
        requests_per_minute,
        messages_per_minute,
        active_brokers,
    })
}

#[derive(Serialize)]
struct AdminOutcome {
    status: String,
    message: String,
}

async fn admin_add_user(
    State(state): State<AppState>,
    params: Params,
) -> Result<Response, ApiError> {
    require_admin(&state, &params)?;

    let username = params.get("username");
    let password = params.get("password");
    if username.is_empty() || password.is_empty() {
        return Err(ApiError::bad_request());
    }

    if state.auth.contains(username) {
        return encoded_json(&AdminOutcome {
            status: "error".to_string(),
            message: format!("User '{username}' already exists"),
        });
    }

    state
        .auth
        .add_user(username, password)
        .map_err(ApiError::internal)?;
    tracing::info!(username, "user added");
    encoded_json(&AdminOutcome {
        status: "success".to_string(),
        message: format!("User '{username}' created"),
    })
}

async fn admin_delete_user(
    State(state): State<AppState>,
    params: Params,
) -> Result<Response, ApiError> {
    require_admin(&state, &params)?;

    let username = params.get("username");
    if username.is_empty() {
        return Err(ApiError::bad_request());
    }

    state
        .auth
        .remove_user(username)
        .map_err(ApiError::internal)?;
    tracing::info!(username, "user deleted");
    encoded_json(&AdminOutcome {
        status: "success".to_string(),
        message: format!("User '{username}' deleted"),
    })
}

async fn admin_server_log(
    State(state): State<AppState>,
    params: Params,
) -> Result<Response, ApiError> {
    require_admin(&state, &params)?;

    let Some(path) = &state.server_log else {
        return Err(ApiError::not_found());
    };
    let (lines, total) = tail_lines(path, LOG_TAIL_LINES).map_err(|_| ApiError::not_found())?;
    encoded_json(&LogTail { lines, total })
}
