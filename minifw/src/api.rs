use crate::control::{ControlError, ControlHandler};
use crate::hook::{Enforcer, Hook, Verdict};
use crate::rule::{PacketSpec, RuleSpec, RuleSpecError};
use crate::wire::ControlMessage;
use axum::{
    extract::{ConnectInfo, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ipnet::IpNet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tower_http::trace::TraceLayer;

pub struct AppState {
    pub handler: Arc<ControlHandler>,
    pub enforcer: Enforcer,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(handler: Arc<ControlHandler>) -> Self {
        let enforcer = Enforcer::new(handler.store().clone());
        Self {
            handler,
            enforcer,
            start_time: Instant::now(),
        }
    }
}

// ── Prometheus Metrics ────────────────────────────────────────────────────────

struct Metrics {
    registry: Registry,
    rules: Gauge,
    control_requests_total: Counter,
    control_errors_total: Counter,
}

impl Metrics {
    fn new() -> Self {
        let mut registry = Registry::default();
        let rules = Gauge::default();
        let control_requests_total = Counter::default();
        let control_errors_total = Counter::default();

        registry.register("minifw_rules", "Rules currently installed", rules.clone());
        registry.register(
            "minifw_control_requests",
            "Control requests handled",
            control_requests_total.clone(),
        );
        registry.register(
            "minifw_control_errors",
            "Control requests rejected",
            control_errors_total.clone(),
        );

        Self {
            registry,
            rules,
            control_requests_total,
            control_errors_total,
        }
    }

    /// Brings the monotonic counters up to the handler's totals.
    fn sync(&self, state: &AppState) {
        let requests = state.handler.requests();
        let current = self.control_requests_total.get();
        if requests > current {
            self.control_requests_total.inc_by(requests - current);
        }
        let errors = state.handler.errors();
        let current = self.control_errors_total.get();
        if errors > current {
            self.control_errors_total.inc_by(errors - current);
        }
        self.rules.set(state.handler.store().len() as i64);
    }
}

// ── Request / Response Types ──────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    status: String,
    rules: usize,
    capacity: Option<usize>,
    uptime_seconds: u64,
}

#[derive(Deserialize)]
pub struct CheckRequest {
    hook: Hook,
    #[serde(flatten)]
    packet: PacketSpec,
}

#[derive(Serialize)]
pub struct CheckResponse {
    verdict: Verdict,
    rule_index: Option<usize>,
    rule: Option<RuleSpec>,
}

#[derive(Debug)]
pub enum ApiError {
    Control(ControlError),
    BadRule(RuleSpecError),
    Internal(String),
}

impl From<ControlError> for ApiError {
    fn from(err: ControlError) -> Self {
        ApiError::Control(err)
    }
}

impl From<RuleSpecError> for ApiError {
    fn from(err: RuleSpecError) -> Self {
        ApiError::BadRule(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Control(err) => {
                let status = match err {
                    ControlError::MalformedMessage(_) | ControlError::InvalidMode(_) => {
                        StatusCode::BAD_REQUEST
                    }
                    ControlError::CapacityExceeded { .. } => StatusCode::CONFLICT,
                    ControlError::NotFound => StatusCode::NOT_FOUND,
                };
                (status, err.to_string())
            }
            ApiError::BadRule(err) => (StatusCode::BAD_REQUEST, err.to_string()),
            ApiError::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn router(state: Arc<AppState>, allowed_ips: &[String]) -> Router {
    let metrics = Arc::new(Metrics::new());

    let mut app = Router::new()
        .route("/api/health", get(get_health))
        .route(
            "/api/rules",
            get(list_rules).post(add_rule).delete(remove_rule),
        )
        .route("/api/check", post(check_packet))
        .route("/metrics", get({
            let m = metrics.clone();
            let s = state.clone();
            move || get_metrics(s.clone(), m.clone())
        }));

    // Apply IP allowlist middleware if configured.
    if !allowed_ips.is_empty() {
        let nets: Arc<Vec<IpNet>> = Arc::new(
            allowed_ips
                .iter()
                .filter_map(|s| s.parse::<IpNet>().ok())
                .collect(),
        );
        app = app.layer(middleware::from_fn(move |req, next| {
            let nets = nets.clone();
            ip_allowlist(req, next, nets)
        }));
    }

    app.layer(TraceLayer::new_for_http()).with_state(state)
}

// ── IP Allowlist Middleware ────────────────────────────────────────────────────

async fn ip_allowlist(
    req: axum::extract::Request,
    next: middleware::Next,
    allowed: Arc<Vec<IpNet>>,
) -> impl IntoResponse {
    if let Some(connect_info) = req.extensions().get::<ConnectInfo<SocketAddr>>() {
        let ip = connect_info.0.ip();
        if allowed.iter().any(|net| net.contains(&ip)) {
            return next.run(req).await.into_response();
        }
        tracing::warn!("API request from {} refused by allowlist", ip);
        return StatusCode::FORBIDDEN.into_response();
    }
    // Without ConnectInfo the peer is unknown; the daemon always serves with it.
    next.run(req).await.into_response()
}

// ── Handlers ──────────────────────────────────────────────────────────────────

async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let store = state.handler.store();
    Json(HealthResponse {
        status: "ok".to_string(),
        rules: store.len(),
        capacity: store.capacity(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

async fn list_rules(State(state): State<Arc<AppState>>) -> Result<Json<Vec<RuleSpec>>, ApiError> {
    let rules = state
        .handler
        .store()
        .snapshot_iter()
        .map(|rule| RuleSpec::try_from(&rule))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(Json(rules))
}

async fn add_rule(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<RuleSpec>,
) -> Result<StatusCode, ApiError> {
    let rule = spec.to_rule()?;
    state.handler.dispatch(ControlMessage::Add(rule))?;
    Ok(StatusCode::CREATED)
}

async fn remove_rule(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<RuleSpec>,
) -> Result<StatusCode, ApiError> {
    let rule = spec.to_rule()?;
    state.handler.dispatch(ControlMessage::Remove(rule))?;
    Ok(StatusCode::NO_CONTENT)
}

async fn check_packet(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CheckRequest>,
) -> Result<Json<CheckResponse>, ApiError> {
    let key = req.packet.to_key()?;
    let decision = state.enforcer.decide(req.hook, &key);
    let rule = decision
        .rule
        .as_ref()
        .map(RuleSpec::try_from)
        .transpose()?;
    Ok(Json(CheckResponse {
        verdict: decision.verdict,
        rule_index: decision.rule_index,
        rule,
    }))
}

async fn get_metrics(state: Arc<AppState>, metrics: Arc<Metrics>) -> Response {
    metrics.sync(&state);

    let mut buf = String::new();
    if let Err(e) = encode(&mut buf, &metrics.registry) {
        return ApiError::Internal(e.to_string()).into_response();
    }
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        buf,
    )
        .into_response()
}
