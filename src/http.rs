use crate::health::Classification;
use crate::indicator::IndicatorLook;
use crate::metrics::Metrics;
use crate::notify::NotifyToggle;
use crate::parser::DeviceStatus;
use crate::state::State as MonitorState;
use axum::body::Body;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub state: Arc<RwLock<MonitorState>>,
    pub notify: NotifyToggle,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiState {
    pub started_at_unix: i64,
    pub last_poll_timestamp_seconds: i64,
    pub poll_count: u64,
    pub source_available: bool,
    pub classification: Option<Classification>,
    pub devices: Vec<DeviceStatus>,
    pub indicator: IndicatorLook,
    pub last_event: Option<&'static str>,
    pub last_change_at: Option<i64>,
    pub bad_since_unix: Option<i64>,
    pub last_notification_at: Option<i64>,
    pub notifications_sent: u64,
    pub notify_enabled: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NotifySwitch {
    pub enabled: bool,
}

impl ApiState {
    fn from_state(value: &MonitorState, notify_enabled: bool) -> Self {
        Self {
            started_at_unix: value.started_at_unix,
            last_poll_timestamp_seconds: value.last_poll_timestamp_seconds,
            poll_count: value.poll_count,
            source_available: value.source_available,
            classification: value.classification.clone(),
            devices: value.devices.clone(),
            indicator: value.indicator,
            last_event: value.last_event,
            last_change_at: value.last_change_at,
            bad_since_unix: value.bad_since_unix,
            last_notification_at: value.last_notification_at,
            notifications_sent: value.notifications_sent,
            notify_enabled,
        }
    }
}

pub fn build_router(
    metrics: Arc<Metrics>,
    state: Arc<RwLock<MonitorState>>,
    notify: NotifyToggle,
) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/state", get(state_handler))
        .route("/api/notify", get(notify_get).put(notify_put))
        .with_state(HttpAppState {
            metrics,
            state,
            notify,
        })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

async fn state_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    let guard = state.state.read().await;
    Json(ApiState::from_state(&guard, state.notify.is_enabled()))
}

async fn notify_get(State(state): State<HttpAppState>) -> Json<NotifySwitch> {
    Json(NotifySwitch {
        enabled: state.notify.is_enabled(),
    })
}

async fn notify_put(
    State(state): State<HttpAppState>,
    Json(switch): Json<NotifySwitch>,
) -> Json<NotifySwitch> {
    state.notify.set(switch.enabled);
    Json(NotifySwitch {
        enabled: state.notify.is_enabled(),
    })
}
