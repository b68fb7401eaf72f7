//! Database bootstrap
//!
//! Pool initialization from `DATABASE_URL` (with TLS support for managed
//! Postgres providers) and schema creation for the pipeline's durable
//! tables. The in-process store serves hot reads; these tables carry the
//! write-through archive that makes the audit trail reconstructable.

pub mod archive;

use anyhow::anyhow;
use deadpool_postgres::{Config, ManagerConfig, Pool, RecyclingMethod};
use tracing::info;

/// Initialize the database pool from `DATABASE_URL`.
pub async fn init_pool() -> anyhow::Result<Pool> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow!("DATABASE_URL not set in environment or .env file"))?;

    let config = database_url
        .parse::<tokio_postgres::Config>()
        .map_err(|e| anyhow!("Failed to parse DATABASE_URL: {}", e))?;

    let hosts = config.get_hosts();
    let host_str = match hosts.first() {
        Some(tokio_postgres::config::Host::Tcp(s)) => s.clone(),
        Some(tokio_postgres::config::Host::Unix(_)) => {
            return Err(anyhow!("Unix socket connections are not supported"));
        }
        None => return Err(anyhow!("No host in DATABASE_URL")),
    };

    let port = config.get_ports().first().copied().unwrap_or(5432);
    let user = config
        .get_user()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("No user in DATABASE_URL"))?;
    let password = config
        .get_password()
        .map(|p| String::from_utf8_lossy(p).to_string())
        .unwrap_or_default();
    let database = config
        .get_dbname()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("No database name in DATABASE_URL"))?;

    // Managed providers require TLS.
    let use_tls = host_str.contains("neon.tech") || database_url.contains("sslmode=require");

    let mut cfg = Config::new();
    cfg.host = Some(host_str);
    cfg.port = Some(port);
    cfg.user = Some(user);
    cfg.password = Some(password);
    cfg.dbname = Some(database);
    cfg.manager = Some(ManagerConfig {
        recycling_method: RecyclingMethod::Fast,
    });

    let pool = if use_tls {
        let certs = rustls_native_certs::load_native_certs();
        let mut root_store = rustls::RootCertStore::empty();
        for cert in certs.certs {
            root_store.add(cert).ok();
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        let tls = tokio_postgres_rustls::MakeRustlsConnect::new(tls_config);
        cfg.create_pool(Some(deadpool_postgres::Runtime::Tokio1), tls)
            .map_err(|e| anyhow!("Failed to create TLS pool: {}", e))?
    } else {
        cfg.create_pool(Some(deadpool_postgres::Runtime::Tokio1), tokio_postgres::NoTls)
            .map_err(|e| anyhow!("Failed to create pool: {}", e))?
    };

    // Verify the connection works before the server starts serving.
    let client = pool
        .get()
        .await
        .map_err(|e| anyhow!("Failed to get pool connection: {}", e))?;
    client
        .query_one("SELECT 1 as ok", &[])
        .await
        .map_err(|e| anyhow!("Failed to verify database connection: {}", e))?;

    info!("✅ Database connection successful (TLS: {})", use_tls);
    Ok(pool)
}

/// Create the pipeline tables if they don't exist.
pub async fn create_tables(pool: &Pool) -> anyhow::Result<()> {
    let client = pool.get().await?;

    client
        .execute(
            "CREATE TABLE IF NOT EXISTS need_patterns (
                id UUID PRIMARY KEY,
                tenant_id VARCHAR(128) NOT NULL,
                content_hash VARCHAR(64) NOT NULL,
                signature JSONB NOT NULL,
                embedding JSONB NOT NULL,
                evidence_count INTEGER NOT NULL DEFAULT 0,
                distinct_users INTEGER NOT NULL DEFAULT 0,
                cumulative_score DOUBLE PRECISION NOT NULL DEFAULT 0,
                first_occurrence TIMESTAMPTZ NOT NULL,
                last_occurrence TIMESTAMPTZ NOT NULL,
                occurrence_met BOOLEAN NOT NULL DEFAULT FALSE,
                impact_met BOOLEAN NOT NULL DEFAULT FALSE,
                confidence_met BOOLEAN NOT NULL DEFAULT FALSE,
                status VARCHAR(32) NOT NULL,
                active_proposal_id UUID,
                UNIQUE(tenant_id, content_hash)
            )",
            &[],
        )
        .await?;

    client
        .execute(
            "CREATE TABLE IF NOT EXISTS evidence (
                id UUID PRIMARY KEY,
                tenant_id VARCHAR(128) NOT NULL,
                pattern_id UUID NOT NULL REFERENCES need_patterns(id),
                evidence_type VARCHAR(40) NOT NULL,
                weight DOUBLE PRECISION NOT NULL,
                user_id VARCHAR(128) NOT NULL,
                session_id VARCHAR(128),
                execution_id VARCHAR(128),
                original_request TEXT NOT NULL,
                failure_reason TEXT,
                captured_at TIMESTAMPTZ NOT NULL
            )",
            &[],
        )
        .await?;

    client
        .execute(
            "CREATE TABLE IF NOT EXISTS workflow_proposals (
                id UUID PRIMARY KEY,
                tenant_id VARCHAR(128) NOT NULL,
                pattern_id UUID NOT NULL REFERENCES need_patterns(id),
                name VARCHAR(255) NOT NULL,
                status VARCHAR(32) NOT NULL,
                payload JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )",
            &[],
        )
        .await?;

    client
        .execute(
            "CREATE TABLE IF NOT EXISTS review_events (
                id UUID PRIMARY KEY,
                tenant_id VARCHAR(128) NOT NULL,
                proposal_id UUID NOT NULL REFERENCES workflow_proposals(id),
                pattern_id UUID NOT NULL,
                actor VARCHAR(16) NOT NULL,
                action VARCHAR(24) NOT NULL,
                previous_status VARCHAR(32) NOT NULL,
                new_status VARCHAR(32) NOT NULL,
                rationale TEXT,
                modifications JSONB NOT NULL DEFAULT '[]'::jsonb,
                reviewed_at TIMESTAMPTZ NOT NULL
            )",
            &[],
        )
        .await?;

    client
        .execute(
            "CREATE TABLE IF NOT EXISTS tenant_configs (
                tenant_id VARCHAR(128) PRIMARY KEY,
                payload JSONB NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )",
            &[],
        )
        .await?;

    client
        .execute(
            "CREATE TABLE IF NOT EXISTS pipeline_dead_letters (
                id SERIAL PRIMARY KEY,
                tenant_id VARCHAR(128) NOT NULL,
                task JSONB NOT NULL,
                attempts INTEGER NOT NULL,
                last_error TEXT NOT NULL,
                dead_lettered_at TIMESTAMPTZ NOT NULL
            )",
            &[],
        )
        .await?;

    // Indexes for the hot lookup paths.
    let _ = client
        .execute(
            "CREATE INDEX IF NOT EXISTS idx_patterns_tenant_status
             ON need_patterns(tenant_id, status)",
            &[],
        )
        .await;
    let _ = client
        .execute(
            "CREATE INDEX IF NOT EXISTS idx_evidence_pattern_id ON evidence(pattern_id)",
            &[],
        )
        .await;
    let _ = client
        .execute(
            "CREATE INDEX IF NOT EXISTS idx_proposals_tenant_created
             ON workflow_proposals(tenant_id, created_at)",
            &[],
        )
        .await;
    let _ = client
        .execute(
            "CREATE INDEX IF NOT EXISTS idx_review_events_proposal
             ON review_events(proposal_id)",
            &[],
        )
        .await;

    info!("✅ Pipeline tables initialized");
    Ok(())
}
