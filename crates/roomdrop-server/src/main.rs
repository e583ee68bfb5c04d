use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{Method, header::CONTENT_TYPE};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::info;

use roomdrop_server::{AppState, Config, router};
use roomdrop_store::{BlobStore, MetaDb, RoomEngine, SystemClock, run_reaper_loop};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomdrop_server=debug,roomdrop_store=debug,tower_http=debug".into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("FATAL: {:#}", e);
            eprintln!("       Set ROOMDROP_SECRET (and any overrides) in your .env file and restart.");
            std::process::exit(1);
        }
    };

    // Init DB and storage
    let db = Arc::new(MetaDb::open(&config.db_path)?);
    let blobs = Arc::new(BlobStore::new(config.storage_dir.clone()).await?);
    let engine = Arc::new(RoomEngine::new(
        db,
        blobs,
        config.secret.clone(),
        config.limits(),
        Arc::new(SystemClock),
    ));

    // Background sweep on top of the per-upload reaping
    tokio::spawn(run_reaper_loop(engine.reaper(), config.cleanup_interval_secs));

    // Room codes are the only access control; any origin may call.
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .allow_credentials(false);

    let app = router(AppState { engine }).layer(cors);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!("Roomdrop listening on {}", addr);
    info!(
        "Limits: {} bytes/file, {} bytes/room, retention {} hours",
        config.max_file_size, config.max_room_size, config.retention_hours
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
