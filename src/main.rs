mod api;
mod config;
mod error;
mod process;
mod services;
mod store;
mod tasks;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use services::coordinator::{JobCoordinator, MAX_SOURCE_SIZE};
use store::Store;

/// Shared application state passed to every handler via Axum's `State`
/// extractor. Must be `Clone` — Axum clones it once per request.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<JobCoordinator>,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok(); // .ok() — missing file is fine in production

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env();
    let base_dir = config.resolved_storage_base();

    let store = Store::new(base_dir.clone());
    store
        .ensure_base_dir()
        .await
        .unwrap_or_else(|e| panic!("failed to create storage directory '{base_dir:?}': {e}"));

    let port = config.port;
    let coordinator = JobCoordinator::new(store.clone(), config);

    tasks::spawn_janitor(store);

    let state = AppState { coordinator };

    let app = Router::new()
        .route("/image", post(api::image::create).get(api::image::list))
        .route("/image/{id}/meta", get(api::image::meta))
        .route("/image/{id}/source", get(api::image::get_source))
        .route("/image/{id}/target", get(api::image::get_target))
        // The upload body itself is capped at 8 MiB by the coordinator;
        // this layer just keeps a misbehaving client from forcing an
        // unbounded read before that check runs.
        .layer(DefaultBodyLimit::max((MAX_SOURCE_SIZE as usize) + 1024))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind TCP listener");

    axum::serve(listener, app).await.expect("server error");
}
