pub mod appresult;
pub mod config;
pub mod hub;
pub mod identity;
pub mod live;
pub mod model;
pub mod presence;
pub mod rooms;
pub mod session;
pub mod signaling;
pub mod store;
pub mod telemetry;

use std::sync::Arc;

use axum::{debug_handler, extract::{FromRef, State}, routing::get, Json, Router};
use sqlx::sqlite::SqlitePoolOptions;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tower_sessions::{cookie::SameSite, Expiry, MemoryStore, SessionManagerLayer};
use tracing::info;

pub use appresult::{AppError, AppResult};
use config::Config;
use live::Live;
use model::IceServer;
use store::{MemoryStore as MemoryRoomStore, RoomStore, SqliteStore};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub live: Arc<Live>,
}

/// The full HTTP surface over `live`.
pub fn app(live: Arc<Live>, session_idle: time::Duration) -> Router {
    let session_layer = SessionManagerLayer::new(MemoryStore::default())
        .with_secure(false)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(session_idle));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/ice-servers", get(ice_servers))
        .merge(identity::router())
        .nest("/s", rooms::router())
        .with_state(AppState { live })
        .layer(session_layer)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Picks SQLite when a database URL is configured, memory otherwise.
pub async fn connect_store(config: &Config) -> anyhow::Result<Arc<dyn RoomStore>> {
    let store: Arc<dyn RoomStore> = match &config.database_url {
        Some(url) => {
            let db_pool = SqlitePoolOptions::new()
                .max_connections(16)
                .connect(url)
                .await?;
            info!(url = %url, "using sqlite store");
            Arc::new(SqliteStore::new(db_pool).await?)
        }
        None => {
            info!("DATABASE_URL not set, using in-memory store");
            Arc::new(MemoryRoomStore::new())
        }
    };
    Ok(store)
}

/// Serves until ctrl-c. The presence reaper runs for as long as the server does.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let store = connect_store(&config).await?;
    let live = Arc::new(Live::new(store, config.live.clone()));
    live.restore().await?;
    let reaper = live.spawn_reaper();

    let listener = TcpListener::bind(config.addr).await?;
    info!(addr = %listener.local_addr()?, "speakspace listening");

    let result = axum::serve(listener, app(live, config.session_idle))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await;

    reaper.abort();
    result.map_err(Into::into)
}

#[debug_handler]
async fn healthz() -> &'static str {
    "ok"
}

#[debug_handler(state = AppState)]
async fn ice_servers(State(live): State<Arc<Live>>) -> Json<Vec<IceServer>> {
    Json(live.ice_servers().to_vec())
}
