//! FlowForge API - Workflow Governance Platform
//!
//! Evidence-driven workflow proposals: observe where existing workflows
//! fail users, accumulate the signals into need patterns, synthesize
//! candidate workflow graphs, and govern them through automated risk
//! review and human approval before publication.
//!
//! PIPELINE: evidence -> pattern matcher -> scheduler -> synthesizer ->
//! governor -> human review -> publish. Every arrow is an asynchronous
//! boundary; evidence ingestion never blocks on synthesis.

use flowforge_api::config::Settings;
use flowforge_api::db;
use flowforge_api::db::archive::PipelineArchive;
use flowforge_api::external::{HashEmbedder, InMemoryCatalog, LogNotifier, SimulatedSandbox};
use flowforge_api::pipeline::scheduler::spawn_background;
use flowforge_api::pipeline::PipelineService;
use flowforge_api::routes::create_router;
use flowforge_api::state::AppState;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber for structured logging
    init_tracing();

    info!("🚀 Starting FlowForge - Workflow Governance Platform...");

    // Load configuration
    let settings = Settings::load()?;
    info!("📋 Configuration loaded successfully");

    // Initialize database pool - REQUIRED (the durable archive)
    let pool = match db::init_pool().await {
        Ok(pool) => {
            info!("✅ Database pool created successfully");
            if let Err(e) = db::create_tables(&pool).await {
                error!("❌ FATAL: Failed to create pipeline tables: {}", e);
                return Err(e);
            }
            pool
        }
        Err(e) => {
            error!("❌ FATAL: Failed to initialize database pool: {}", e);
            error!("DATABASE_URL must be set in .env and database must be accessible");
            return Err(e);
        }
    };

    // Assemble the pipeline engine with the in-process collaborator
    // defaults; deployments swap these for real clients.
    let pipeline = Arc::new(PipelineService::new(
        settings.pipeline.tuning.clone(),
        Arc::new(HashEmbedder),
        Arc::new(InMemoryCatalog::new()),
        Arc::new(SimulatedSandbox),
        Arc::new(LogNotifier),
        Some(PipelineArchive::new(pool.clone())),
    ));

    // Background scheduler + dispatch workers
    let background = spawn_background(Arc::clone(&pipeline), &settings.pipeline);
    info!(
        "⚙️  Scheduler every {}s, {} dispatch worker(s)",
        settings.pipeline.scheduler_interval_secs, settings.pipeline.worker_count
    );

    let state = Arc::new(AppState::new(pool, pipeline));

    // Build the router
    let app = create_router(state, &settings);

    // Create socket address
    let addr = SocketAddr::from((settings.server.host, settings.server.port));

    info!("🌐 Server listening on http://{}", addr);
    info!("");
    info!("📚 API Endpoints:");
    info!("   ─── Evidence ───");
    info!("   POST /api/tenants/{{tenant}}/evidence              - Submit evidence");
    info!("");
    info!("   ─── Patterns ───");
    info!("   GET  /api/tenants/{{tenant}}/patterns              - List need patterns");
    info!("   GET  /api/tenants/{{tenant}}/patterns/{{id}}         - Pattern + evidence");
    info!("");
    info!("   ─── Proposals ───");
    info!("   GET  /api/tenants/{{tenant}}/proposals             - List proposals");
    info!("   GET  /api/tenants/{{tenant}}/proposals/{{id}}        - Full detail + audit trail");
    info!("   POST /api/tenants/{{tenant}}/proposals/{{id}}/review - Approve/decline/test/modify");
    info!("   POST /api/tenants/{{tenant}}/proposals/{{id}}/test   - Sandbox test run");
    info!("   POST /api/tenants/{{tenant}}/proposals/{{id}}/publish - Publish to catalog");
    info!("   GET  /api/tenants/{{tenant}}/dead-letters          - Stuck tasks for inspection");
    info!("");
    info!("   ─── Configuration ───");
    info!("   GET  /api/tenants/{{tenant}}/config                - Thresholds & weights");
    info!("   PUT  /api/tenants/{{tenant}}/config                - Update configuration");
    info!("");

    // Create TCP listener and serve
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for handle in background {
        handle.abort();
    }
    info!("👋 Server shutdown complete");
    Ok(())
}

/// Initialize tracing with structured logging
fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,flowforge_api=debug,tower_http=debug"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_level(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .compact(),
        )
        .init();
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("📴 Received Ctrl+C signal, initiating graceful shutdown...");
        },
        _ = terminate => {
            info!("📴 Received terminate signal, initiating graceful shutdown...");
        },
    }
}
