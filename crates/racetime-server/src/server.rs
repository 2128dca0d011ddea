use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use racetime_core::views::SiteInfo;
use racetime_store::Database;

use crate::broadcast;
use crate::client::{self, ClientRegistry};
use crate::http;
use crate::service::RaceService;
use crate::ticker;

/// Server configuration.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_send_queue: usize,
    pub event_capacity: usize,
    pub request_timeout_secs: u64,
    pub tick_interval: Duration,
    pub site: SiteInfo,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8000,
            max_send_queue: 256,
            event_capacity: 1024,
            request_timeout_secs: 30,
            tick_interval: ticker::TICK_INTERVAL,
            site: SiteInfo {
                title: "racetime".into(),
                meta_image: None,
            },
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RaceService>,
    pub registry: Arc<ClientRegistry>,
    pub site: Arc<SiteInfo>,
}

pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/", get(http::home))
        .route("/health", get(http::health))
        .route("/ws/race/{race}", get(http::ws_public))
        .route("/ws/o/race/{race}", get(http::ws_oauth))
        .route("/{category}", get(http::category))
        .route("/{category}/{race}", get(http::race))
        .route("/{category}/{race}/data", get(http::race_data))
        .with_state(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Start the server and its background tasks.
pub async fn start(config: ServerConfig, db: Database) -> Result<ServerHandle, std::io::Error> {
    let service = Arc::new(RaceService::new(db, config.event_capacity));
    let registry = Arc::new(ClientRegistry::new(config.max_send_queue));

    let bridge = broadcast::create_bridge(Arc::clone(&registry), service.subscribe());
    let cleanup = client::start_cleanup_task(Arc::clone(&registry));
    let ticker = ticker::start_ticker(Arc::clone(&service), config.tick_interval);

    let state = AppState {
        service: Arc::clone(&service),
        registry: Arc::clone(&registry),
        site: Arc::new(config.site.clone()),
    };
    let router = build_router(state, Duration::from_secs(config.request_timeout_secs));

    let listener = tokio::net::TcpListener::bind((config.host.as_str(), config.port)).await?;
    let addr = listener.local_addr()?;
    tracing::info!(%addr, "racetime server started");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            tracing::error!(error = %e, "server stopped");
        }
    });

    Ok(ServerHandle {
        addr,
        service,
        registry,
        tasks: vec![server, bridge, cleanup, ticker],
    })
}

/// Handle returned by [`start`]. Background tasks live until
/// [`shutdown`](Self::shutdown) is called.
pub struct ServerHandle {
    pub addr: SocketAddr,
    service: Arc<RaceService>,
    registry: Arc<ClientRegistry>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ServerHandle {
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn service(&self) -> &Arc<RaceService> {
        &self.service
    }

    pub fn client_count(&self) -> usize {
        self.registry.client_count()
    }

    pub fn shutdown(self) {
        for task in self.tasks {
            task.abort();
        }
        tracing::info!("racetime server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_server() -> ServerHandle {
        let config = ServerConfig {
            port: 0,
            ..ServerConfig::default()
        };
        start(config, Database::in_memory().unwrap()).await.unwrap()
    }

    #[tokio::test]
    async fn health_endpoint() {
        let handle = test_server().await;
        let url = format!("http://127.0.0.1:{}/health", handle.port());
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);
        let body: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(body["status"], "ok");
        assert_eq!(body["clients"], 0);
        handle.shutdown();
    }

    #[tokio::test]
    async fn unknown_category_is_404() {
        let handle = test_server().await;
        let url = format!("http://127.0.0.1:{}/nothing-here", handle.port());
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 404);
        handle.shutdown();
    }

    #[tokio::test]
    async fn home_lists_nothing_on_empty_site() {
        let handle = test_server().await;
        let url = format!("http://127.0.0.1:{}/", handle.port());
        let body: serde_json::Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body["site_info"]["title"], "racetime");
        assert_eq!(body["categories"], serde_json::json!([]));
        assert_eq!(body["user"]["is_authenticated"], false);
        handle.shutdown();
    }
}
