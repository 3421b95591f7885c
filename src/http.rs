use crate::entities::EntityState;
use crate::metrics::Metrics;
use crate::state::State as BridgeState;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, Json, Router};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::sync::RwLock;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub state: Arc<RwLock<BridgeState>>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiSystem {
    pub id: String,
    pub name: String,
    pub status: String,
    pub has_stats: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiState {
    pub started_at_unix: i64,
    pub last_attempt_unix: i64,
    pub last_success_unix: i64,
    pub last_success_at: Option<String>,
    pub last_update_success: bool,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub entity_count: usize,
    pub systems: Vec<ApiSystem>,
}

impl From<&BridgeState> for ApiState {
    fn from(value: &BridgeState) -> Self {
        let snapshot = value.snapshot();
        Self {
            started_at_unix: value.started_at_unix,
            last_attempt_unix: value.last_attempt_unix,
            last_success_unix: value.last_success_unix,
            last_success_at: (value.last_success_unix > 0)
                .then(|| format_unix(value.last_success_unix)),
            last_update_success: value.last_update_success,
            consecutive_failures: value.consecutive_failures,
            last_error: value.last_error.clone(),
            entity_count: value.entities().len(),
            systems: snapshot
                .systems
                .iter()
                .map(|s| ApiSystem {
                    id: s.id.clone(),
                    name: s.name.clone(),
                    status: s.status.clone(),
                    has_stats: snapshot.stats(&s.id).is_some_and(|st| !st.is_empty()),
                })
                .collect(),
        }
    }
}

pub fn build_router(metrics: Arc<Metrics>, state: Arc<RwLock<BridgeState>>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/state", get(state_handler))
        .route("/api/entities", get(entities_handler))
        // disk names may contain slashes
        .route("/api/entities/*unique_id", get(entity_handler))
        .with_state(HttpAppState { metrics, state })
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
    Json(ApiState::from(&*guard))
}

async fn entities_handler(State(state): State<HttpAppState>) -> Json<Vec<EntityState>> {
    let guard = state.state.read().await;
    Json(guard.render_entities())
}

async fn entity_handler(
    State(state): State<HttpAppState>,
    Path(unique_id): Path<String>,
) -> Response {
    let guard = state.state.read().await;
    match guard.render_entity(unique_id.trim_start_matches('/')) {
        Some(entity) => Json(entity).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            format!("сенсор {unique_id} не найден"),
        )
            .into_response(),
    }
}

fn format_unix(ts: i64) -> String {
    let st = UNIX_EPOCH + Duration::from_secs(ts.max(0) as u64);
    humantime::format_rfc3339_seconds(st).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Snapshot;
    use axum::body::to_bytes;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn published_state() -> Arc<RwLock<BridgeState>> {
        let mut state = BridgeState::new(0);
        let mut snapshot = Snapshot {
            systems: vec![serde_json::from_value(
                json!({"id": "a1", "name": "nas", "status": "up", "info": {"cpu": 9}}),
            )
            .unwrap()],
            ..Snapshot::default()
        };
        snapshot.stats.insert(
            "a1".to_string(),
            serde_json::from_value(json!({"efs": {"/data": {"d": 500, "du": 250}}})).unwrap(),
        );
        state.publish(snapshot, 1_700_000_000);
        Arc::new(RwLock::new(state))
    }

    async fn get_body(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let metrics = Metrics::new().expect("инициализация метрик");
        let app = build_router(metrics, Arc::new(RwLock::new(BridgeState::new(0))));

        let (status, body) = get_body(app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn metrics_contains_sensor_values() {
        let metrics = Metrics::new().expect("инициализация метрик");
        let state = published_state();
        metrics.update_from_state(&*state.read().await);
        let app = build_router(metrics, state);

        let (status, body) = get_body(app, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("beszel_bridge_sensor_value"));
        assert!(body.contains("beszel_bridge_uptime_seconds"));
    }

    #[tokio::test]
    async fn api_state_reports_systems() {
        let metrics = Metrics::new().expect("инициализация метрик");
        let app = build_router(metrics, published_state());

        let (status, body) = get_body(app, "/api/state").await;
        assert_eq!(status, StatusCode::OK);
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["last_update_success"], json!(true));
        assert_eq!(value["last_success_at"], json!("2023-11-14T22:13:20Z"));
        assert_eq!(value["entity_count"], json!(8));
        assert_eq!(value["systems"][0]["has_stats"], json!(true));
    }

    #[tokio::test]
    async fn api_entities_lists_rendered_states() {
        let metrics = Metrics::new().expect("инициализация метрик");
        let app = build_router(metrics, published_state());

        let (status, body) = get_body(app, "/api/entities").await;
        assert_eq!(status, StatusCode::OK);
        let value: Value = serde_json::from_str(&body).unwrap();
        let entities = value.as_array().expect("массив");
        assert_eq!(entities.len(), 8);
        let cpu = entities
            .iter()
            .find(|e| e["unique_id"] == "beszel_a1_cpu")
            .expect("cpu");
        assert_eq!(cpu["value"], json!(9.0));
        assert_eq!(cpu["unit"], json!("%"));
        assert_eq!(cpu["platform"], json!("sensor"));
        assert_eq!(cpu["device"]["identifiers"], json!([["beszel", "a1"]]));
    }

    #[tokio::test]
    async fn api_entity_by_id() {
        let metrics = Metrics::new().expect("инициализация метрик");
        let state = published_state();

        let (status, body) =
            get_body(build_router(metrics.clone(), state.clone()), "/api/entities/beszel_a1_status").await;
        assert_eq!(status, StatusCode::OK);
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["value"], json!(true));
        assert_eq!(value["platform"], json!("binary_sensor"));

        let (status, body) =
            get_body(build_router(metrics.clone(), state.clone()), "/api/entities/beszel_a1_efs_/data").await;
        assert_eq!(status, StatusCode::OK);
        let value: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(value["value"], json!(50.0));

        let (status, _) = get_body(build_router(metrics, state), "/api/entities/beszel_zz_cpu").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
