mod handlers;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use axum_server::tls_rustls::RustlsConfig;
use sigrelay_relay::{ws_handler, Registry, RelayState};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::info;

use crate::config::{Config, TlsConfig};

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<Registry>,
    pub index_path: PathBuf,
}

pub struct SignalServer {
    state: AppState,
    ws_prefix: String,
    static_dir: PathBuf,
    tls: Option<TlsConfig>,
    addr: String,
}

impl SignalServer {
    pub fn new(addr: String) -> Self {
        let defaults = Config::default();
        Self {
            state: AppState {
                registry: Arc::new(Registry::new()),
                index_path: defaults.index_path(),
            },
            ws_prefix: defaults.server.ws_prefix,
            static_dir: defaults.assets.static_dir,
            tls: None,
            addr,
        }
    }

    /// Build a server from loaded configuration. TLS is required.
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.server.bind_address.clone())
            .with_ws_prefix(&config.server.ws_prefix)
            .with_assets(config.assets.static_dir.clone(), config.index_path())
            .with_tls(config.tls.clone())
    }

    pub fn with_ws_prefix(mut self, prefix: &str) -> Self {
        self.ws_prefix = prefix.trim_matches('/').to_string();
        self
    }

    pub fn with_assets(mut self, static_dir: PathBuf, index_path: PathBuf) -> Self {
        self.static_dir = static_dir;
        self.state.index_path = index_path;
        self
    }

    /// Serve over HTTPS with the given certificate and key
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.state.registry.clone()
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn router(&self) -> Router {
        let ws_route = format!("/{}/:peer_id", self.ws_prefix);
        let relay_routes = Router::new()
            .route(&ws_route, get(ws_handler))
            .with_state(RelayState::new(self.state.registry.clone()));

        Router::new()
            .route("/", get(handlers::serve_root))
            .route("/api/stats", get(handlers::relay_stats))
            .with_state(self.state.clone())
            .nest_service("/static", ServeDir::new(&self.static_dir))
            .merge(relay_routes)
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(self) -> Result<()> {
        let app = self.router();

        match &self.tls {
            Some(tls) => {
                // Refuse to start without both halves of the key pair
                tls.ensure_present()?;
                let addr: SocketAddr = self
                    .addr
                    .parse()
                    .with_context(|| format!("Invalid bind address {}", self.addr))?;
                let rustls = RustlsConfig::from_pem_file(&tls.cert_path, &tls.key_path)
                    .await
                    .context("Failed to load TLS certificate and key")?;

                info!("Listening on https://{}", addr);
                axum_server::bind_rustls(addr, rustls)
                    .serve(app.into_make_service())
                    .await?;
            }
            None => {
                let listener = tokio::net::TcpListener::bind(&self.addr).await?;
                info!("Listening on http://{}", listener.local_addr()?);
                axum::serve(listener, app).await?;
            }
        }

        Ok(())
    }
}
