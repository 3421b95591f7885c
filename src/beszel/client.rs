use super::{BeszelApi, StatsSnapshot, System};
use crate::config::BeszelConfig;
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const SYSTEMS_COLLECTION: &str = "systems";
const STATS_COLLECTION: &str = "system_stats";
const AUTH_COLLECTION: &str = "users";
const FULL_LIST_BATCH: u32 = 200;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("не удалось создать HTTP-клиент: {0}")]
    Build(#[source] reqwest::Error),
    #[error("ошибка запроса {url}: {source}")]
    Transport { url: String, source: reqwest::Error },
    #[error("{url} ответил HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("не удалось авторизоваться в Beszel: HTTP {status}")]
    Auth { status: u16 },
    #[error("не удалось разобрать ответ {url}: {source}")]
    Decode { url: String, source: reqwest::Error },
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
struct Session {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListResult<T> {
    #[serde(default, rename = "totalPages")]
    total_pages: u32,
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct StatsRecord {
    #[serde(default)]
    stats: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    token: String,
}

pub struct BeszelClient {
    http: Client,
    base_url: String,
    credentials: Option<Credentials>,
    session: Mutex<Option<Session>>,
}

impl BeszelClient {
    pub fn new(cfg: &BeszelConfig, credentials: Option<Credentials>) -> Result<Self, ApiError> {
        let http = Client::builder()
            .user_agent(concat!("beszel-bridge/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .map_err(ApiError::Build)?;

        Ok(Self {
            http,
            base_url: cfg.url.trim().trim_end_matches('/').to_string(),
            credentials,
            session: Mutex::new(None),
        })
    }

    fn records_url(&self, collection: &str) -> String {
        format!("{}/api/collections/{collection}/records", self.base_url)
    }

    async fn session(&self) -> Result<Session, ApiError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }

        let session = match &self.credentials {
            Some(credentials) => Session {
                token: Some(self.authenticate(credentials).await?),
            },
            None => Session { token: None },
        };
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<String, ApiError> {
        let url = format!(
            "{}/api/collections/{AUTH_COLLECTION}/auth-with-password",
            self.base_url
        );
        let response = self
            .http
            .post(&url)
            .json(&json!({
                "identity": credentials.username,
                "password": credentials.password,
            }))
            .send()
            .await
            .map_err(|source| ApiError::Transport {
                url: url.clone(),
                source,
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Auth {
                status: status.as_u16(),
            });
        }

        let body: AuthResponse = response
            .json()
            .await
            .map_err(|source| ApiError::Decode { url, source })?;
        info!(user = %credentials.username, "авторизация в Beszel выполнена");
        Ok(body.token)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<T, ApiError> {
        let session = self.session().await?;
        let mut request = self.http.get(url).query(query);
        if let Some(token) = &session.token {
            request = request.header(AUTHORIZATION, token);
        }

        let response = request.send().await.map_err(|source| ApiError::Transport {
            url: url.to_string(),
            source,
        })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            self.session.lock().await.take();
        }
        if !status.is_success() {
            return Err(ApiError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        response.json().await.map_err(|source| ApiError::Decode {
            url: url.to_string(),
            source,
        })
    }

    pub async fn fetch_systems(&self) -> Result<Vec<System>, ApiError> {
        let url = self.records_url(SYSTEMS_COLLECTION);
        let mut systems = Vec::new();
        let mut page = 1_u32;

        loop {
            let result: ListResult<Value> = self
                .get_json(
                    &url,
                    &[
                        ("page", page.to_string()),
                        ("perPage", FULL_LIST_BATCH.to_string()),
                    ],
                )
                .await?;

            let fetched = result.items.len();
            for item in result.items {
                match serde_json::from_value::<System>(item) {
                    Ok(system) => systems.push(system),
                    Err(err) => warn!(error = %err, "пропущена запись системы с неожиданным форматом"),
                }
            }

            if fetched == 0 || page >= result.total_pages {
                break;
            }
            page += 1;
        }

        debug!(count = systems.len(), "получен список систем");
        Ok(systems)
    }

    pub async fn fetch_latest_stats(
        &self,
        system_id: &str,
    ) -> Result<Option<StatsSnapshot>, ApiError> {
        let url = self.records_url(STATS_COLLECTION);
        let result: ListResult<StatsRecord> = self
            .get_json(
                &url,
                &[
                    ("page", "1".to_string()),
                    ("perPage", "1".to_string()),
                    ("filter", system_filter(system_id)),
                    ("sort", "-created".to_string()),
                ],
            )
            .await?;

        Ok(result.items.into_iter().next().map(|record| {
            record
                .stats
                .and_then(|stats| serde_json::from_value(stats).ok())
                .unwrap_or_default()
        }))
    }
}

#[async_trait]
impl BeszelApi for BeszelClient {
    async fn list_systems(&self) -> Result<Vec<System>, ApiError> {
        self.fetch_systems().await
    }

    async fn latest_stats(&self, system_id: &str) -> Result<Option<StatsSnapshot>, ApiError> {
        self.fetch_latest_stats(system_id).await
    }
}

fn system_filter(system_id: &str) -> String {
    let escaped = system_id.replace('\\', "\\\\").replace('\'', "\\'");
    format!("system = '{escaped}'")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Query, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Hub {
        auth_calls: AtomicUsize,
        reject_next: AtomicUsize,
        stats_queries: std::sync::Mutex<Vec<HashMap<String, String>>>,
    }

    async fn spawn_hub(hub: Arc<Hub>) -> String {
        let app = Router::new()
            .route(
                "/api/collections/users/auth-with-password",
                post(auth_handler),
            )
            .route("/api/collections/systems/records", get(systems_handler))
            .route(
                "/api/collections/system_stats/records",
                get(stats_handler),
            )
            .with_state(hub);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}/")
    }

    async fn auth_handler(
        State(hub): State<Arc<Hub>>,
        Json(body): Json<Value>,
    ) -> (AxumStatus, Json<Value>) {
        hub.auth_calls.fetch_add(1, Ordering::SeqCst);
        if body["identity"] == "admin" && body["password"] == "secret" {
            (AxumStatus::OK, Json(json!({"token": "tok-1", "record": {}})))
        } else {
            (AxumStatus::BAD_REQUEST, Json(json!({"message": "bad"})))
        }
    }

    async fn systems_handler(
        State(hub): State<Arc<Hub>>,
        headers: HeaderMap,
        Query(query): Query<HashMap<String, String>>,
    ) -> (AxumStatus, Json<Value>) {
        if hub.reject_next.load(Ordering::SeqCst) > 0 {
            hub.reject_next.fetch_sub(1, Ordering::SeqCst);
            return (AxumStatus::UNAUTHORIZED, Json(json!({})));
        }
        let authorized = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            == Some("tok-1");
        if !authorized {
            return (AxumStatus::FORBIDDEN, Json(json!({})));
        }

        let page: u32 = query.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
        let items = match page {
            1 => json!([
                {"id": "a1", "name": "nas", "status": "up", "info": {"cpu": 5}},
                {"id": "b2", "name": "pi", "status": "down", "info": {}}
            ]),
            2 => json!([{"id": "c3", "name": "vps", "status": "up"}, {"name": "no id"}]),
            _ => json!([]),
        };
        (
            AxumStatus::OK,
            Json(json!({"page": page, "perPage": 200, "totalItems": 4, "totalPages": 2, "items": items})),
        )
    }

    async fn stats_handler(
        State(hub): State<Arc<Hub>>,
        Query(query): Query<HashMap<String, String>>,
    ) -> (AxumStatus, Json<Value>) {
        let filter = query.get("filter").cloned().unwrap_or_default();
        hub.stats_queries.lock().unwrap().push(query);
        if filter.contains("broken") {
            return (AxumStatus::INTERNAL_SERVER_ERROR, Json(json!({})));
        }
        let items = if filter == "system = 'a1'" {
            json!([{"id": "s1", "system": "a1", "stats": {"efs": {"/data": {"d": 10, "du": 5}}}}])
        } else {
            json!([])
        };
        (
            AxumStatus::OK,
            Json(json!({"page": 1, "perPage": 1, "totalItems": 1, "totalPages": 1, "items": items})),
        )
    }

    fn config(url: String) -> BeszelConfig {
        BeszelConfig {
            url,
            username: None,
            password: None,
            password_env: "BESZEL_PASSWORD".to_string(),
            timeout_ms: 2_000,
        }
    }

    fn credentials() -> Option<Credentials> {
        Some(Credentials {
            username: "admin".to_string(),
            password: "secret".to_string(),
        })
    }

    #[tokio::test]
    async fn lists_all_pages_with_lazy_auth() {
        let hub = Arc::new(Hub::default());
        let url = spawn_hub(hub.clone()).await;
        let client = BeszelClient::new(&config(url), credentials()).unwrap();

        assert_eq!(hub.auth_calls.load(Ordering::SeqCst), 0);
        let systems = client.list_systems().await.expect("список систем");
        let ids: Vec<&str> = systems.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["a1", "b2", "c3"]);
        assert_eq!(systems[0].info.cpu_percent, Some(5.0));

        client.list_systems().await.expect("повторный запрос");
        assert_eq!(hub.auth_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_token_triggers_reauth() {
        let hub = Arc::new(Hub::default());
        let url = spawn_hub(hub.clone()).await;
        let client = BeszelClient::new(&config(url), credentials()).unwrap();

        client.list_systems().await.expect("первый запрос");
        hub.reject_next.store(1, Ordering::SeqCst);
        let err = client.list_systems().await.expect_err("токен отклонён");
        assert!(matches!(err, ApiError::Status { status: 401, .. }));

        client.list_systems().await.expect("после повторной авторизации");
        assert_eq!(hub.auth_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn listing_errors_propagate() {
        let hub = Arc::new(Hub::default());
        let url = spawn_hub(hub).await;
        let client = BeszelClient::new(&config(url), None).unwrap();

        let err = client.list_systems().await.expect_err("без токена");
        assert!(matches!(err, ApiError::Status { status: 403, .. }));
    }

    #[tokio::test]
    async fn bad_credentials_fail_listing() {
        let hub = Arc::new(Hub::default());
        let url = spawn_hub(hub).await;
        let creds = Some(Credentials {
            username: "admin".to_string(),
            password: "wrong".to_string(),
        });
        let client = BeszelClient::new(&config(url), creds).unwrap();

        let err = client.list_systems().await.expect_err("неверный пароль");
        assert!(matches!(err, ApiError::Auth { status: 400 }));
    }

    #[tokio::test]
    async fn latest_stats_queries_newest_record() {
        let hub = Arc::new(Hub::default());
        let url = spawn_hub(hub.clone()).await;
        let client = BeszelClient::new(&config(url), None).unwrap();

        let stats = client
            .latest_stats("a1")
            .await
            .unwrap()
            .expect("есть запись");
        assert_eq!(stats.extra_fs["/data"].used_gb, Some(5.0));

        let queries = hub.stats_queries.lock().unwrap().clone();
        let query = &queries[0];
        assert_eq!(query["page"], "1");
        assert_eq!(query["perPage"], "1");
        assert_eq!(query["sort"], "-created");
        assert_eq!(query["filter"], "system = 'a1'");
    }

    #[tokio::test]
    async fn missing_stats_are_absent_and_failures_propagate() {
        let hub = Arc::new(Hub::default());
        let url = spawn_hub(hub).await;
        let client = BeszelClient::new(&config(url), None).unwrap();

        assert!(client.latest_stats("zz").await.unwrap().is_none());
        let err = client.latest_stats("broken").await.expect_err("ошибка хаба");
        assert!(matches!(err, ApiError::Status { status: 500, .. }));
    }

    #[test]
    fn filter_escapes_quotes() {
        assert_eq!(system_filter("a1"), "system = 'a1'");
        assert_eq!(system_filter("x' || 1=1"), "system = 'x\\' || 1=1'");
    }
}
