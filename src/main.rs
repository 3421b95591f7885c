mod beszel;
mod config;
mod coordinator;
mod entities;
mod extract;
mod http;
mod metrics;
mod state;

use axum::serve;
use beszel::client::{BeszelClient, Credentials};
use clap::Parser;
use config::Config;
use coordinator::now_unix;
use metrics::Metrics;
use state::State;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "beszel-bridge")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Run a single refresh, print the entities as JSON and exit.
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };

    let credentials = resolve_credentials(&cfg);
    let client = match BeszelClient::new(&cfg.beszel, credentials) {
        Ok(client) => Arc::new(client),
        Err(err) => {
            error!(error = %err, "не удалось создать клиент Beszel");
            std::process::exit(1);
        }
    };

    let shared_state = Arc::new(RwLock::new(State::new(now_unix())));
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };

    if cli.once {
        run_once(client.as_ref(), &shared_state, &metrics).await;
        return;
    }

    info!(
        listen = %cfg.listen,
        interval_secs = cfg.interval_secs,
        beszel_url = %cfg.beszel.url,
        "запуск beszel-bridge"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let cfg = cfg.clone();
        let metrics = metrics.clone();
        let http_state = shared_state.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(metrics, http_state);
            let addr: SocketAddr = match cfg.listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %cfg.listen, "некорректный адрес listen");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "не удалось запустить HTTP-сервер");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });
            if let Err(err) = server.await {
                error!(error = %err, "HTTP-сервер завершился с ошибкой");
            }
        })
    };

    let refresh_task = tokio::spawn(coordinator::run(
        client,
        shared_state.clone(),
        metrics.clone(),
        Duration::from_secs(cfg.interval_secs),
        shutdown_rx,
    ));

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    let _ = shutdown_tx.send(true);

    let _ = refresh_task.await;
    let _ = http_task.await;
}

async fn run_once(client: &BeszelClient, state: &RwLock<State>, metrics: &Metrics) {
    if coordinator::refresh_once(client, state, metrics).await.is_err() {
        std::process::exit(1);
    }

    let entities = state.read().await.render_entities();
    match serde_json::to_string_pretty(&entities) {
        Ok(text) => println!("{text}"),
        Err(err) => {
            error!(error = %err, "не удалось сериализовать сенсоры");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_password_from_env(env_name: &str) -> Option<String> {
    if let Ok(v) = std::env::var(env_name) {
        if !v.trim().is_empty() {
            return Some(v);
        }
    }
    None
}

fn resolve_credentials(cfg: &Config) -> Option<Credentials> {
    let username = cfg
        .beszel
        .username
        .as_ref()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    let password = resolve_password_from_env(&cfg.beszel.password_env).or_else(|| {
        cfg.beszel
            .password
            .clone()
            .filter(|v| !v.trim().is_empty())
    });

    match (username, password) {
        (Some(username), Some(password)) => Some(Credentials { username, password }),
        (Some(username), None) => {
            warn!(
                user = %username,
                password_env = %cfg.beszel.password_env,
                "пароль Beszel не задан, запросы пойдут без авторизации"
            );
            None
        }
        (None, Some(_)) => {
            warn!("пароль Beszel задан без username, запросы пойдут без авторизации");
            None
        }
        (None, None) => None,
    }
}
