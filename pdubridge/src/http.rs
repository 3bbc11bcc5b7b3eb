//! HTTP/JSON facade over the bridge manager and history store.
//!
//! A thin adapter: handlers validate input, resolve the target device and
//! forward to the manager; every error kind maps onto a status code. Only
//! `/api/health` is exempt from session auth.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post, put};
use serde::Deserialize;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::info;

use pdubridge_common::error::Error;
use pdubridge_common::model::current_timestamp_millis;
use pdubridge_common::{DeviceConfig, validate_device_id};
use pdubridge_core::manager::BridgeManager;
use pdubridge_core::poller::{CommandOrigin, ManagementRequest};
use pdubridge_core::rules::Rule;
use pdubridge_transport::OutletAction;
use pdubridge_transport::management::{
    AtsSettings, BankThresholds, EnergyWiseSettings, NetworkSettings, NotificationSettings,
    OutletSettings,
};

use crate::auth::{SESSION_COOKIE, SessionStore, session_from_cookies};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<BridgeManager>,
    pub sessions: Arc<SessionStore>,
}

/// API error with a wire-visible kind.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: String,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, kind: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind: kind.to_string(),
            message: message.into(),
        }
    }

    fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", "login required")
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "config_invalid", message)
    }
}

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        let status = match &e {
            Error::ConfigInvalid(_) | Error::RuleInvalid(_) => StatusCode::BAD_REQUEST,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Conflict(_) => StatusCode::CONFLICT,
            Error::RequiresSerial(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::TransportTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.kind(), e.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message, "kind": self.kind })),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Deserialize)]
struct DeviceQuery {
    device_id: Option<String>,
}

fn resolve(state: &AppState, query: &DeviceQuery) -> ApiResult<String> {
    Ok(state.manager.resolve_device(query.device_id.as_deref())?)
}

/// Gate a mutating endpoint behind the session cookie when a web password is
/// configured.
fn require_auth(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    if state.manager.settings().web_password.is_none() {
        return Ok(());
    }

    let token = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(session_from_cookies);

    match token {
        Some(token) if state.sessions.verify(token) => Ok(()),
        _ => Err(ApiError::unauthorized()),
    }
}

/// Build the HTTP router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(status))
        .route("/api/health", get(health))
        .route("/api/pdus", get(list_pdus).post(add_pdu))
        .route("/api/pdus/discover", post(discover))
        .route("/api/pdus/:device_id", put(update_pdu).delete(delete_pdu))
        .route("/api/config", get(get_config).put(put_config))
        .route("/api/outlets/:outlet/command", post(outlet_command))
        .route("/api/outlets/:outlet/name", put(rename_outlet))
        .route("/api/outlet-names", get(outlet_names))
        .route("/api/rules", get(list_rules).post(add_rule))
        .route("/api/rules/:name", put(update_rule).delete(delete_rule))
        .route("/api/rules/:name/toggle", put(toggle_rule))
        .route("/api/events", get(events))
        .route("/api/history/banks", get(history_banks))
        .route("/api/history/banks.csv", get(history_banks_csv))
        .route("/api/history/outlets", get(history_outlets))
        .route("/api/history/outlets.csv", get(history_outlets_csv))
        .route("/api/reports", get(reports))
        .route("/api/reports/latest", get(report_latest))
        .route("/api/reports/:id", get(report_by_id))
        .route("/api/auth/login", post(login))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/status", get(auth_status))
        .route(
            "/api/management/thresholds",
            get(get_thresholds).put(set_thresholds),
        )
        .route("/api/management/network", get(get_network).put(set_network))
        .route("/api/management/ats", get(get_ats).put(set_ats))
        .route("/api/management/outlet-config", post(set_outlet_config))
        .route("/api/management/device-name", put(set_device_name))
        .route("/api/management/device-location", put(set_device_location))
        .route("/api/management/security/check", get(check_credentials))
        .route("/api/management/security/password", post(change_password))
        .route("/api/management/users", get(get_users))
        .route("/api/management/event-log", get(get_event_log))
        .route(
            "/api/management/notifications",
            get(get_notifications).put(set_notifications),
        )
        .route(
            "/api/management/energywise",
            get(get_energywise).put(set_energywise),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// --- Status & health ---

async fn status(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    Ok(Json(state.manager.status(query.device_id.as_deref())?))
}

/// Never gated; 200 when healthy, 503 otherwise, always JSON with `issues[]`.
async fn health(State(state): State<AppState>) -> Response {
    let report = state.manager.health();
    let status = if report.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report)).into_response()
}

// --- Device management ---

async fn list_pdus(State(state): State<AppState>) -> Json<Vec<DeviceConfig>> {
    Json(state.manager.device_configs())
}

async fn add_pdu(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut body): Json<serde_json::Value>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    require_auth(&state, &headers)?;

    if !body.is_object() {
        return Err(ApiError::bad_request("expected a JSON object"));
    }

    // Synthesize a positional id when the caller omits one.
    if body.get("device_id").is_none() {
        body["device_id"] = serde_json::Value::String(state.manager.next_device_id());
    }

    let device: DeviceConfig =
        serde_json::from_value(body).map_err(|e| ApiError::bad_request(e.to_string()))?;
    validate_device_id(&device.device_id)?;
    let device_id = device.device_id.clone();

    state.manager.add_device(device).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "ok": true, "device_id": device_id })),
    ))
}

async fn update_pdu(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
    Json(mut body): Json<serde_json::Value>,
) -> ApiResult<Json<serde_json::Value>> {
    require_auth(&state, &headers)?;

    if !body.is_object() {
        return Err(ApiError::bad_request("expected a JSON object"));
    }
    body["device_id"] = serde_json::Value::String(device_id);
    let device: DeviceConfig =
        serde_json::from_value(body).map_err(|e| ApiError::bad_request(e.to_string()))?;

    state.manager.update_device(device).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn delete_pdu(
    State(state): State<AppState>,
    Path(device_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    require_auth(&state, &headers)?;
    state.manager.remove_device(&device_id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// The subnet scanner is an external collaborator; without it installed,
/// discovery is unavailable.
async fn discover(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Response> {
    require_auth(&state, &headers)?;
    Err(ApiError::new(
        StatusCode::SERVICE_UNAVAILABLE,
        "requires_serial",
        "network discovery scanner is not installed",
    ))
}

// --- Bridge config ---

async fn get_config(State(state): State<AppState>) -> Json<serde_json::Value> {
    let settings = state.manager.settings();
    Json(serde_json::json!({
        "poll_interval_ms": settings.poll_interval_ms,
        "retention_days": settings.retention_days,
        "auth_enabled": settings.web_password.is_some(),
    }))
}

#[derive(Debug, Deserialize)]
struct ConfigBody {
    poll_interval_ms: Option<u64>,
    retention_days: Option<u32>,
    web_password: Option<String>,
}

async fn put_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ConfigBody>,
) -> ApiResult<Json<serde_json::Value>> {
    require_auth(&state, &headers)?;

    let mut settings = state.manager.settings();
    if let Some(interval) = body.poll_interval_ms {
        settings.poll_interval_ms = interval;
    }
    if let Some(days) = body.retention_days {
        settings.retention_days = days;
    }
    if let Some(password) = body.web_password {
        settings.web_password = if password.is_empty() {
            None
        } else {
            Some(password)
        };
    }

    state.manager.update_settings(settings).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

// --- Outlets ---

#[derive(Debug, Deserialize)]
struct CommandBody {
    action: String,
    device_id: Option<String>,
}

async fn outlet_command(
    State(state): State<AppState>,
    Path(outlet): Path<u32>,
    headers: HeaderMap,
    Json(body): Json<CommandBody>,
) -> ApiResult<Json<serde_json::Value>> {
    require_auth(&state, &headers)?;

    let device_id = state.manager.resolve_device(body.device_id.as_deref())?;
    let action = OutletAction::parse(&body.action)
        .ok_or_else(|| ApiError::bad_request(format!("unknown action '{}'", body.action)))?;

    let response = state
        .manager
        .outlet_command(&device_id, outlet, action, CommandOrigin::Http)
        .await?;

    Ok(Json(serde_json::json!({
        "ok": response.success,
        "command": response.command,
        "outlet": response.outlet,
        "error": response.error,
        "ts": response.ts,
    })))
}

#[derive(Debug, Deserialize)]
struct NameBody {
    name: String,
    device_id: Option<String>,
}

async fn rename_outlet(
    State(state): State<AppState>,
    Path(outlet): Path<u32>,
    headers: HeaderMap,
    Json(body): Json<NameBody>,
) -> ApiResult<Json<serde_json::Value>> {
    require_auth(&state, &headers)?;

    let device_id = state.manager.resolve_device(body.device_id.as_deref())?;
    state
        .manager
        .set_outlet_name(&device_id, outlet, body.name)
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn outlet_names(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let device_id = resolve(&state, &query)?;
    let names = state.manager.outlet_names(&device_id)?;
    Ok(Json(serde_json::to_value(names).map_err(Error::from)?))
}

// --- Rules ---

async fn list_rules(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> ApiResult<Json<Vec<Rule>>> {
    let device_id = resolve(&state, &query)?;
    Ok(Json(state.manager.rules(&device_id)?))
}

async fn add_rule(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
    headers: HeaderMap,
    Json(rule): Json<Rule>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    require_auth(&state, &headers)?;
    let device_id = resolve(&state, &query)?;
    state.manager.add_rule(&device_id, rule).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "ok": true })),
    ))
}

async fn update_rule(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<DeviceQuery>,
    headers: HeaderMap,
    Json(mut rule): Json<Rule>,
) -> ApiResult<Json<serde_json::Value>> {
    require_auth(&state, &headers)?;
    let device_id = resolve(&state, &query)?;
    rule.name = name;
    state.manager.update_rule(&device_id, rule).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn delete_rule(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<DeviceQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    require_auth(&state, &headers)?;
    let device_id = resolve(&state, &query)?;
    state.manager.remove_rule(&device_id, &name).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn toggle_rule(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<DeviceQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    require_auth(&state, &headers)?;
    let device_id = resolve(&state, &query)?;
    let enabled = state.manager.toggle_rule(&device_id, &name).await?;
    Ok(Json(serde_json::json!({ "ok": true, "enabled": enabled })))
}

async fn events(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> Json<serde_json::Value> {
    let events = state.manager.events(query.device_id.as_deref());
    Json(serde_json::json!({ "events": events }))
}

// --- History ---

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    device_id: Option<String>,
    range: Option<String>,
    start: Option<i64>,
    end: Option<i64>,
}

/// Parse `"1h"`, `"24h"`, `"7d"` style ranges into seconds.
fn parse_range(range: &str) -> ApiResult<i64> {
    let range = range.trim();
    let (number, unit) = range.split_at(range.len().saturating_sub(1));
    let n: i64 = number
        .parse()
        .map_err(|_| ApiError::bad_request(format!("invalid range '{}'", range)))?;
    if n <= 0 {
        return Err(ApiError::bad_request(format!("invalid range '{}'", range)));
    }
    match unit {
        "s" => Ok(n),
        "m" => Ok(n * 60),
        "h" => Ok(n * 3600),
        "d" => Ok(n * 86_400),
        _ => Err(ApiError::bad_request(format!(
            "invalid range unit in '{}'",
            range
        ))),
    }
}

fn history_window(query: &HistoryQuery) -> ApiResult<(i64, i64)> {
    if let Some(range) = &query.range {
        let secs = parse_range(range)?;
        let end = current_timestamp_millis();
        return Ok((end - secs * 1000, end));
    }
    match (query.start, query.end) {
        (Some(start), Some(end)) if start < end => Ok((start, end)),
        (Some(_), Some(_)) => Err(ApiError::bad_request("start must be before end")),
        _ => Err(ApiError::bad_request("pass range= or start=&end=")),
    }
}

async fn history_banks(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let device_id = state.manager.resolve_device(query.device_id.as_deref())?;
    let (start, end) = history_window(&query)?;

    let history = state.manager.history().clone();
    let points = tokio::task::spawn_blocking(move || history.query_banks(&device_id, start, end))
        .await
        .map_err(|e| Error::internal(e.to_string()))??;

    Ok(Json(serde_json::json!({ "points": points })))
}

async fn history_outlets(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let device_id = state.manager.resolve_device(query.device_id.as_deref())?;
    let (start, end) = history_window(&query)?;

    let history = state.manager.history().clone();
    let points = tokio::task::spawn_blocking(move || history.query_outlets(&device_id, start, end))
        .await
        .map_err(|e| Error::internal(e.to_string()))??;

    Ok(Json(serde_json::json!({ "points": points })))
}

fn csv_response(body: String) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
        body,
    )
        .into_response()
}

fn fmt_opt(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

async fn history_banks_csv(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Response> {
    let device_id = state.manager.resolve_device(query.device_id.as_deref())?;
    let (start, end) = history_window(&query)?;

    let history = state.manager.history().clone();
    let points = tokio::task::spawn_blocking(move || history.query_banks(&device_id, start, end))
        .await
        .map_err(|e| Error::internal(e.to_string()))??;

    let mut csv = String::from("bucket,bank,voltage,current,power,apparent,pf\n");
    for p in points {
        csv.push_str(&format!(
            "{},{},{},{},{},{},{}\n",
            p.bucket,
            p.bank,
            fmt_opt(p.voltage),
            p.current,
            fmt_opt(p.power),
            fmt_opt(p.apparent),
            fmt_opt(p.pf),
        ));
    }
    Ok(csv_response(csv))
}

async fn history_outlets_csv(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Response> {
    let device_id = state.manager.resolve_device(query.device_id.as_deref())?;
    let (start, end) = history_window(&query)?;

    let history = state.manager.history().clone();
    let points = tokio::task::spawn_blocking(move || history.query_outlets(&device_id, start, end))
        .await
        .map_err(|e| Error::internal(e.to_string()))??;

    let mut csv = String::from("bucket,outlet,state,current,power,energy\n");
    for p in points {
        csv.push_str(&format!(
            "{},{},{},{},{},{}\n",
            p.bucket,
            p.outlet,
            p.state.as_str(),
            fmt_opt(p.current),
            fmt_opt(p.power),
            fmt_opt(p.energy),
        ));
    }
    Ok(csv_response(csv))
}

// --- Reports ---

async fn reports(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let history = state.manager.history().clone();
    let device_id = query.device_id.clone();
    let reports = tokio::task::spawn_blocking(move || history.reports(device_id.as_deref()))
        .await
        .map_err(|e| Error::internal(e.to_string()))??;
    Ok(Json(serde_json::json!({ "reports": reports })))
}

async fn report_latest(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let history = state.manager.history().clone();
    let device_id = query.device_id.clone();
    let reports = tokio::task::spawn_blocking(move || history.reports(device_id.as_deref()))
        .await
        .map_err(|e| Error::internal(e.to_string()))??;

    match reports.into_iter().next() {
        Some(report) => Ok(Json(serde_json::to_value(report).map_err(Error::from)?)),
        None => Err(Error::not_found("no reports generated yet").into()),
    }
}

async fn report_by_id(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let history = state.manager.history().clone();
    let report = tokio::task::spawn_blocking(move || history.report(id))
        .await
        .map_err(|e| Error::internal(e.to_string()))??;

    match report {
        Some(report) => Ok(Json(serde_json::to_value(report).map_err(Error::from)?)),
        None => Err(Error::not_found(format!("report {}", id)).into()),
    }
}

// --- Auth ---

#[derive(Debug, Deserialize)]
struct LoginBody {
    password: String,
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginBody>,
) -> ApiResult<Response> {
    let Some(expected) = state.manager.settings().web_password else {
        return Ok(Json(serde_json::json!({ "ok": true, "auth_enabled": false })).into_response());
    };

    if body.password != expected {
        return Err(ApiError::new(
            StatusCode::FORBIDDEN,
            "forbidden",
            "wrong password",
        ));
    }

    let token = state.sessions.create();
    let cookie = format!(
        "{}={}; Path=/; HttpOnly; SameSite=Strict",
        SESSION_COOKIE, token
    );
    Ok((
        StatusCode::OK,
        [(header::SET_COOKIE, cookie)],
        Json(serde_json::json!({ "ok": true })),
    )
        .into_response())
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Json<serde_json::Value> {
    if let Some(token) = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(session_from_cookies)
    {
        state.sessions.revoke(token);
    }
    Json(serde_json::json!({ "ok": true }))
}

async fn auth_status(State(state): State<AppState>, headers: HeaderMap) -> Json<serde_json::Value> {
    let enabled = state.manager.settings().web_password.is_some();
    let logged_in = !enabled
        || headers
            .get(header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .and_then(session_from_cookies)
            .is_some_and(|token| state.sessions.verify(token));

    Json(serde_json::json!({ "auth_enabled": enabled, "logged_in": logged_in }))
}

// --- PDU management (serial or mock transport required) ---

async fn forward_management(
    state: &AppState,
    query: &DeviceQuery,
    request: ManagementRequest,
) -> ApiResult<Json<serde_json::Value>> {
    let device_id = resolve(state, query)?;
    Ok(Json(state.manager.management(&device_id, request).await?))
}

async fn get_thresholds(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    forward_management(&state, &query, ManagementRequest::GetThresholds).await
}

async fn set_thresholds(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
    headers: HeaderMap,
    Json(body): Json<BankThresholds>,
) -> ApiResult<Json<serde_json::Value>> {
    require_auth(&state, &headers)?;
    forward_management(&state, &query, ManagementRequest::SetThresholds(body)).await
}

async fn get_network(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    forward_management(&state, &query, ManagementRequest::GetNetwork).await
}

async fn set_network(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
    headers: HeaderMap,
    Json(body): Json<NetworkSettings>,
) -> ApiResult<Json<serde_json::Value>> {
    require_auth(&state, &headers)?;
    forward_management(&state, &query, ManagementRequest::SetNetwork(body)).await
}

async fn get_ats(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    forward_management(&state, &query, ManagementRequest::GetAtsConfig).await
}

async fn set_ats(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
    headers: HeaderMap,
    Json(body): Json<AtsSettings>,
) -> ApiResult<Json<serde_json::Value>> {
    require_auth(&state, &headers)?;
    forward_management(&state, &query, ManagementRequest::SetAtsConfig(body)).await
}

async fn set_outlet_config(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
    headers: HeaderMap,
    Json(body): Json<OutletSettings>,
) -> ApiResult<Json<serde_json::Value>> {
    require_auth(&state, &headers)?;
    forward_management(&state, &query, ManagementRequest::SetOutletConfig(body)).await
}

#[derive(Debug, Deserialize)]
struct TextBody {
    value: String,
}

async fn set_device_name(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
    headers: HeaderMap,
    Json(body): Json<TextBody>,
) -> ApiResult<Json<serde_json::Value>> {
    require_auth(&state, &headers)?;
    forward_management(&state, &query, ManagementRequest::SetDeviceName(body.value)).await
}

async fn set_device_location(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
    headers: HeaderMap,
    Json(body): Json<TextBody>,
) -> ApiResult<Json<serde_json::Value>> {
    require_auth(&state, &headers)?;
    forward_management(
        &state,
        &query,
        ManagementRequest::SetDeviceLocation(body.value),
    )
    .await
}

async fn check_credentials(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    forward_management(&state, &query, ManagementRequest::CheckDefaultCredentials).await
}

#[derive(Debug, Deserialize)]
struct PasswordBody {
    username: String,
    old_password: String,
    new_password: String,
}

async fn change_password(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
    headers: HeaderMap,
    Json(body): Json<PasswordBody>,
) -> ApiResult<Json<serde_json::Value>> {
    require_auth(&state, &headers)?;
    forward_management(
        &state,
        &query,
        ManagementRequest::ChangePassword {
            username: body.username,
            old_password: body.old_password,
            new_password: body.new_password,
        },
    )
    .await
}

async fn get_users(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    forward_management(&state, &query, ManagementRequest::GetUsers).await
}

async fn get_event_log(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    forward_management(&state, &query, ManagementRequest::GetEventLog).await
}

async fn get_notifications(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    forward_management(&state, &query, ManagementRequest::GetNotifications).await
}

async fn set_notifications(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
    headers: HeaderMap,
    Json(body): Json<NotificationSettings>,
) -> ApiResult<Json<serde_json::Value>> {
    require_auth(&state, &headers)?;
    forward_management(&state, &query, ManagementRequest::SetNotifications(body)).await
}

async fn get_energywise(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    forward_management(&state, &query, ManagementRequest::GetEnergywise).await
}

async fn set_energywise(
    State(state): State<AppState>,
    Query(query): Query<DeviceQuery>,
    headers: HeaderMap,
    Json(body): Json<EnergyWiseSettings>,
) -> ApiResult<Json<serde_json::Value>> {
    require_auth(&state, &headers)?;
    forward_management(&state, &query, ManagementRequest::SetEnergywise(body)).await
}

/// HTTP server wrapper with graceful shutdown.
pub struct HttpServer {
    state: AppState,
    listen_addr: SocketAddr,
}

impl HttpServer {
    pub fn new(state: AppState, listen_addr: SocketAddr) -> Self {
        Self { state, listen_addr }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let router = create_router(self.state);

        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        info!(addr = %self.listen_addr, "HTTP server listening");

        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("1h").unwrap(), 3600);
        assert_eq!(parse_range("24h").unwrap(), 86_400);
        assert_eq!(parse_range("7d").unwrap(), 604_800);
        assert_eq!(parse_range("90s").unwrap(), 90);
        assert_eq!(parse_range("15m").unwrap(), 900);
        assert!(parse_range("h").is_err());
        assert!(parse_range("-1h").is_err());
        assert!(parse_range("10x").is_err());
    }
}
