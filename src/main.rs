//! Quiz Sync Back binary entrypoint wiring the stores, the sync engine, REST and SSE layers.

use std::{env, fmt::Display, future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use axum::Router;
use tokio::net::TcpListener;
use tokio::time::sleep;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quiz_sync_back::{
    config::{AppConfig, StorageBackend},
    routes,
    services::{
        engine::{EngineStores, SyncEngine},
        storage_supervisor,
    },
    state::{AppState, SharedState},
};

const INITIAL_CONNECT_DELAY: Duration = Duration::from_millis(1_000);
const MAX_CONNECT_DELAY: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();
    let backend = StorageBackend::from_env();
    info!(?backend, "connecting stores");
    let stores = connect_stores(backend).await?;

    let engine = Arc::new(SyncEngine::new(stores, config.engine.clone()));
    engine.start_recovery_sweep().await;

    let app_state = AppState::new(engine.clone(), config);
    let supervisor = tokio::spawn(storage_supervisor::run(app_state.clone()));
    // Build the HTTP router once the shared state is ready.
    let app = build_router(app_state);

    let port = env::var("PORT")
        .or_else(|_| env::var("SERVER_PORT"))
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    let service = app.into_make_service();
    axum::serve(listener, service)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    supervisor.abort();
    engine.dispose().await;
    Ok(())
}

async fn connect_stores(backend: StorageBackend) -> anyhow::Result<EngineStores> {
    match backend {
        StorageBackend::Memory => {
            warn!("using in-memory stores; nothing survives a restart");
            Ok(EngineStores::memory())
        }
        StorageBackend::Mongo => mongo_stores(false).await,
        StorageBackend::MongoCouch => mongo_stores(true).await,
    }
}

#[cfg(feature = "mongo-store")]
async fn mongo_stores(couch_sessions: bool) -> anyhow::Result<EngineStores> {
    use quiz_sync_back::dao::record_store::{
        AuthoritativeStore,
        mongodb::{MongoConfig, MongoStore},
    };

    let mongo_config = MongoConfig::from_env()
        .await
        .context("parsing MongoDB configuration")?;

    let mongo = connect_with_retry("MongoDB", || MongoStore::connect(mongo_config.clone())).await;

    let authoritative: Arc<dyn AuthoritativeStore> = if couch_sessions {
        couch_session_store().await?
    } else {
        Arc::new(mongo.clone())
    };

    Ok(EngineStores {
        fast: Arc::new(mongo.clone()),
        authoritative,
        ledger: Arc::new(mongo),
    })
}

#[cfg(not(feature = "mongo-store"))]
async fn mongo_stores(_couch_sessions: bool) -> anyhow::Result<EngineStores> {
    anyhow::bail!("this build does not include the mongo-store feature")
}

#[cfg(all(feature = "mongo-store", feature = "couch-store"))]
async fn couch_session_store()
-> anyhow::Result<Arc<dyn quiz_sync_back::dao::record_store::AuthoritativeStore>> {
    use quiz_sync_back::dao::record_store::couchdb::{CouchConfig, CouchSessionStore};

    let couch_config = CouchConfig::from_env().context("reading CouchDB configuration")?;
    let store =
        connect_with_retry("CouchDB", || CouchSessionStore::connect(couch_config.clone())).await;
    Ok(Arc::new(store))
}

#[cfg(all(feature = "mongo-store", not(feature = "couch-store")))]
async fn couch_session_store()
-> anyhow::Result<Arc<dyn quiz_sync_back::dao::record_store::AuthoritativeStore>> {
    anyhow::bail!("this build does not include the couch-store feature")
}

/// Retry `connect` with exponential backoff until it succeeds.
async fn connect_with_retry<T, E, F, Fut>(name: &'static str, mut connect: F) -> T
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delay = INITIAL_CONNECT_DELAY;
    loop {
        match connect().await {
            Ok(store) => {
                info!(store = name, "store connection established");
                return store;
            }
            Err(err) => {
                // Could not reach the store at all: wait and retry with
                // exponential backoff.
                warn!(store = name, error = %err, "store connection attempt failed");
                sleep(delay).await;
                delay = (delay * 2).min(MAX_CONNECT_DELAY);
            }
        }
    }
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
