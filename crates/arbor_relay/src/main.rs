use arbor_relay::{hydrate_handler, ws_handler, AppState, Config, RelayState};
use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "arbor_relay=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match Config::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!("failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    info!("starting Arbor relay v{}", env!("CARGO_PKG_VERSION"));
    info!("data dir: {:?}", config.data_dir);
    info!("upper limit policy: {:?}", config.upper_limit_policy);

    if let Err(e) = std::fs::create_dir_all(&config.data_dir) {
        error!("failed to create data directory: {}", e);
        std::process::exit(1);
    }

    let relay = Arc::new(RelayState::new(config.data_dir.clone(), config.clone()));
    let state = AppState {
        relay,
        config: config.clone(),
    };

    let cors = CorsLayer::new().allow_methods(Any).allow_origin(Any);

    let app = Router::new()
        .route("/", get(|| async { "Arbor Relay" }))
        .route("/health", get(|| async { "OK" }))
        .route("/ws", get(ws_handler))
        .route("/hydrate", get(hydrate_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = config.server_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(l) => l,
        Err(e) => {
            error!("failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        }
    };

    info!("relay listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    info!("relay shut down gracefully");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
