use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::{Mutex, watch};
use tracing::info;
use tracing_subscriber::EnvFilter;

use valet_config::ConfigSnapshot;
use valet_exec::CodeRunner;
use valet_llm::{CostTable, HttpCompletionClient, HttpEmbeddingClient};
use valet_memory::{AsyncIoLog, EmbeddingService, GistNormalizer, IoLog, SnapshotStore};
use valet_notify::{Fabric, NotificationLog};
use valet_queue::{IoSink, Scheduler};
use valet_rest::auth::StaticTokenVerifier;
use valet_rest::{AppState, build_router};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config_path =
        std::env::var("VALET_CONFIG").unwrap_or_else(|_| "conf/valet.toml".to_string());
    let config = ConfigSnapshot::load_from(&config_path)?;
    info!(path = %config_path, "configuration loaded");

    // ── Memory substrate ─────────────────────────────────────────────────────
    let normalizer = GistNormalizer::load(&config.paths.dictionary_dir);
    let embedding_base_url = config
        .get_or("embedding base url", config.get_or("llm base url", "http://localhost:11434/v1"))
        .to_string();
    let embeddings = Arc::new(EmbeddingService::open(
        &config.paths.embedding_cache_path,
        Arc::new(HttpEmbeddingClient::new(embedding_base_url)),
        normalizer,
        config.embedding_model(),
        config.expand_symbols_to_words(),
    )?);
    let snapshots = Arc::new(Mutex::new(SnapshotStore::open(
        &config.paths.solutions_dir,
        embeddings.clone(),
    )?));
    let io_log = Arc::new(IoLog::new(&config.paths.io_log_path, embeddings.clone()));
    let io_sink = if config.io_log_async() {
        IoSink::Async(AsyncIoLog::spawn(io_log.clone()))
    } else {
        IoSink::Sync(io_log.clone())
    };

    // ── Notification fabric ──────────────────────────────────────────────────
    let fabric = Arc::new(Fabric::new());
    let notifications = Arc::new(NotificationLog::new(&config.paths.notifications_path));

    // ── Agent execution ──────────────────────────────────────────────────────
    let client = Arc::new(HttpCompletionClient::new(CostTable::new(config.clone())));
    let runner = CodeRunner::new(
        config.code_interpreter(),
        Duration::from_secs(config.get_u64("code timeout seconds", 30)),
    );

    let scheduler = Arc::new(Scheduler::new(
        config.clone(),
        client,
        runner,
        snapshots,
        io_sink,
        fabric.clone(),
        notifications,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = scheduler.spawn_worker(shutdown_rx);

    // Development tokens; production deployments plug a real verifier in.
    let verifier = Arc::new(
        StaticTokenVerifier::new()
            .with_user("mock_token_alice", "alice", "alice@example.com", false)
            .with_user("mock_token_admin", "admin", "admin@example.com", true),
    );

    let app = build_router(AppState {
        scheduler: scheduler.clone(),
        fabric,
        verifier,
    });

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "valet listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = worker.await;
    info!("valet stopped");
    Ok(())
}
