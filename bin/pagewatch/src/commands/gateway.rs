use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use pagewatch_agent::{MessageBus, SessionRegistry, WatchDispatcher, WatchRegistry, WatchSession, WatchSettings};
use pagewatch_channels::{ChannelManager, TelegramChannel};
use pagewatch_core::{Config, Paths};
use pagewatch_tools::ChromeRenderer;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Upper bound on shutdown; covers the dispatcher's own drain window.
const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Clone)]
struct GatewayState {
    registry: Arc<dyn SessionRegistry>,
    started_at: Instant,
    telegram_enabled: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: String,
    version: String,
    uptime_secs: u64,
    active_watches: usize,
    telegram_enabled: bool,
}

async fn handle_root() -> &'static str {
    "running"
}

async fn handle_health(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
        active_watches: state.registry.active_count(),
        telegram_enabled: state.telegram_enabled,
    })
}

fn build_router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(handle_root))
        .route("/v1/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(cli_host: Option<String>, cli_port: Option<u16>) -> anyhow::Result<()> {
    let paths = Paths::new();
    let mut config = Config::resolve(&paths)?;
    if let Some(host) = cli_host {
        config.gateway.host = host;
    }
    if let Some(port) = cli_port {
        config.gateway.port = port;
    }
    paths.ensure_dirs()?;

    info!(
        retry_interval_ms = config.watch.retry_interval_ms,
        navigation_timeout_ms = config.watch.navigation_timeout_ms,
        "Starting gateway"
    );

    // ── Message bus and shutdown signal ──
    let bus = MessageBus::new(100);
    let ((inbound_tx, inbound_rx), (outbound_tx, outbound_rx)) = bus.split();
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // ── Watch machinery ──
    let registry: Arc<dyn SessionRegistry> = Arc::new(WatchRegistry::new());
    let renderer = ChromeRenderer::from_config(&config.watch, &config.browser, paths.profiles_dir());
    let session = WatchSession::new(Arc::new(renderer), WatchSettings::from_config(&config.watch));
    let dispatcher = WatchDispatcher::new(registry.clone(), session, outbound_tx)
        .with_drain_timeout(GRACEFUL_TIMEOUT / 2);

    let dispatcher_shutdown_rx = shutdown_tx.subscribe();
    let dispatcher_handle = tokio::spawn(async move {
        dispatcher.run_loop(inbound_rx, Some(dispatcher_shutdown_rx)).await;
    });

    let channel_manager = ChannelManager::new(&config.channels)?;
    let telegram_enabled = channel_manager.telegram_enabled();
    if !telegram_enabled {
        warn!("Telegram channel is not configured; only the health endpoint will run");
    }
    // Ends once the dispatcher and its sessions drop their senders, so final
    // outcome messages still go out during shutdown.
    let outbound_handle = tokio::spawn(async move {
        channel_manager.start_outbound_dispatcher(outbound_rx).await;
    });

    let telegram = Arc::new(TelegramChannel::new(
        config.channels.telegram.clone(),
        inbound_tx.clone(),
    )?);
    let telegram_shutdown_rx = shutdown_tx.subscribe();
    let telegram_handle = tokio::spawn(async move {
        telegram.run_loop(telegram_shutdown_rx).await;
    });

    // ── Health server ──
    let app = build_router(GatewayState {
        registry: registry.clone(),
        started_at: Instant::now(),
        telegram_enabled,
    });
    let bind_addr = format!("{}:{}", config.gateway.host, config.gateway.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "Health server listening");

    let http_shutdown_rx = shutdown_tx.subscribe();
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut rx = http_shutdown_rx;
                let _ = rx.recv().await;
            })
            .await
            .ok();
    });

    // ── Wait for shutdown signal ──
    tokio::signal::ctrl_c().await?;
    info!(
        active_watches = registry.active_count(),
        "Shutdown signal received, draining tasks..."
    );

    let _ = shutdown_tx.send(());
    drop(inbound_tx);

    let handles: Vec<(&str, tokio::task::JoinHandle<()>)> = vec![
        ("http_server", http_handle),
        ("dispatcher", dispatcher_handle),
        ("outbound", outbound_handle),
        ("telegram", telegram_handle),
    ];

    let total = handles.len();
    let deadline = tokio::time::Instant::now() + GRACEFUL_TIMEOUT;
    loop {
        if handles.iter().all(|(_, h)| h.is_finished()) {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let mut aborted = 0;
    for (name, handle) in &handles {
        if !handle.is_finished() {
            warn!(task = *name, "Task did not exit in graceful window, aborting");
            handle.abort();
            aborted += 1;
        }
    }

    let mut failed = 0;
    for (name, handle) in handles {
        match handle.await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {
                debug!(task = name, "Task cancelled during shutdown");
            }
            Err(e) => {
                error!(task = name, error = %e, "Task panicked during shutdown");
                failed += 1;
            }
        }
    }

    if failed == 0 {
        info!(total, aborted, "Gateway shutdown complete");
    } else {
        warn!(failed, total, aborted, "Gateway shutdown completed with task failures");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use pagewatch_core::WatchRequest;
    use tower::ServiceExt;

    fn state(registry: Arc<dyn SessionRegistry>) -> GatewayState {
        GatewayState {
            registry,
            started_at: Instant::now(),
            telegram_enabled: false,
        }
    }

    #[tokio::test]
    async fn test_root_reports_running() {
        let app = build_router(state(Arc::new(WatchRegistry::new())));
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"running");
    }

    #[tokio::test]
    async fn test_health_counts_active_watches() {
        let registry = Arc::new(WatchRegistry::new());
        let request = WatchRequest::parse("https://a.example.com").unwrap();
        let _token = registry.admit("telegram:1", &request).unwrap();

        let app = build_router(state(registry));
        let response = app
            .oneshot(Request::builder().uri("/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["activeWatches"], 1);
        assert_eq!(json["telegramEnabled"], false);
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let app = build_router(state(Arc::new(WatchRegistry::new())));
        let response = app
            .oneshot(Request::builder().uri("/v1/chat").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
