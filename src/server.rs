//! HTTP server with graceful shutdown

use axum::routing::{any, get};
use axum::Router;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::{
    catch_panic::CatchPanicLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};

use crate::config::Config;
use crate::error::Result;
use crate::handlers;
use crate::state::AppState;

/// Hard ceiling on one decision request, backend pagination included
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Build the application router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/auth", any(handlers::auth_root))
        .route("/{endpoint}/auth", any(handlers::auth_endpoint))
        .route("/health", get(handlers::health))
        .route("/healthz", get(handlers::health))
        .route("/{endpoint}/healthz", get(handlers::health_endpoint))
        .route("/explain", get(handlers::explain))
        .route("/{endpoint}/explain", get(handlers::explain_endpoint))
        .route("/metrics", get(handlers::metrics))
        .with_state(state)
}

/// Server instance
pub struct Server {
    config: Config,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Run the server with the given router
    pub async fn serve(self, app: Router) -> Result<()> {
        let addr: SocketAddr = format!(
            "{}:{}",
            self.config.server.listen.address, self.config.server.listen.port
        )
        .parse()
        .map_err(|e| {
            crate::error::Error::InvalidConfig(format!(
                "listen address {}:{}: {e}",
                self.config.server.listen.address, self.config.server.listen.port
            ))
        })?;

        // Layers are applied in reverse order (bottom layer is innermost)
        let app = app
            .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
            .layer(
                TraceLayer::new_for_http()
                    .make_span_with(DefaultMakeSpan::new())
                    .on_response(DefaultOnResponse::new()),
            )
            .layer(CatchPanicLayer::new());

        let listener = TcpListener::bind(&addr).await?;
        tracing::info!("PassCtrl listening on {}", addr);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await?;

        tracing::info!("Server shutdown complete");
        Ok(())
    }
}

/// Resolve on SIGTERM or Ctrl-C
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
