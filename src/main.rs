use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{Router, routing::get, routing::post};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use metascope::AppState;
use metascope::analyzer::{Analyzer, AnalyzerConfig};
use metascope::config::{MetascopeConfig, StorageBackend};
use metascope::handlers;
use metascope::migrations;
use metascope::miner::{Masker, TemplateMiner};
use metascope::query::QueryEngine;
use metascope::store::MetadataStore;
use metascope::store::columnar::{ColumnarConfig, ColumnarStore};
use metascope::store::memory::{MemoryStore, MemoryStoreConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("metascope=debug,tower_http=debug")
        }))
        .init();

    let config_path =
        std::env::var("METASCOPE_CONFIG").unwrap_or_else(|_| "./metascope.toml".to_string());
    let mut config = MetascopeConfig::load(&config_path)?;

    // Environment overrides for the connection parameters.
    if let Ok(url) = std::env::var("CLICKHOUSE_URL") {
        config.storage.clickhouse_url = url;
    }
    if let Ok(user) = std::env::var("CLICKHOUSE_USER") {
        config.storage.clickhouse_user = user;
    }
    if let Ok(password) = std::env::var("CLICKHOUSE_PASSWORD") {
        config.storage.clickhouse_password = password;
    }

    let store: Arc<dyn MetadataStore> = match config.storage.backend {
        StorageBackend::Memory => {
            tracing::info!("using in-memory metadata store");
            Arc::new(MemoryStore::new(MemoryStoreConfig {
                hll_precision: config.analysis.hll_precision,
                max_samples_per_key: config.analysis.max_samples_per_key,
                max_entities_per_shard: config.analysis.max_entities_per_shard,
            }))
        }
        StorageBackend::Columnar => {
            migrations::run(
                &config.storage.clickhouse_url,
                &config.storage.clickhouse_user,
                &config.storage.clickhouse_password,
            )
            .await?;
            tracing::info!(
                "using columnar metadata store at {}",
                config.storage.clickhouse_url
            );
            Arc::new(
                ColumnarStore::open(ColumnarConfig {
                    url: config.storage.clickhouse_url.clone(),
                    user: config.storage.clickhouse_user.clone(),
                    password: config.storage.clickhouse_password.clone(),
                    batch_size: config.storage.batch_size,
                    flush_interval: config.storage.flush_interval(),
                    attribute_flush_interval: config.storage.attribute_flush_interval(),
                    recovery_dir: config.storage.recovery_dir.clone(),
                    catalog_enabled: config.storage.attribute_catalog,
                    hll_precision: config.analysis.hll_precision,
                    max_samples_per_key: config.analysis.max_samples_per_key,
                    max_entities_per_shard: config.analysis.max_entities_per_shard,
                })
                .await?,
            )
        }
    };

    let miner = if config.analysis.mine_log_templates {
        Some(Arc::new(TemplateMiner::new(config.miner.clone())?))
    } else {
        None
    };
    let masker = Masker::new(&config.masking.specs())?;
    let analyzer = Arc::new(Analyzer::new(
        store.clone(),
        miner,
        masker,
        AnalyzerConfig {
            hll_precision: config.analysis.hll_precision,
            max_samples_per_key: config.analysis.max_samples_per_key,
        },
    ));

    let state = AppState {
        stats: analyzer.stats(),
        query: Arc::new(QueryEngine::new(store.clone())),
        store: store.clone(),
        analyzer,
    };

    let api = Router::new()
        // Metric metadata
        .route("/api/v1/metrics", get(handlers::metrics::list_metrics))
        .route("/api/v1/metrics/{name}", get(handlers::metrics::get_metric))
        .route(
            "/api/v1/metrics/{name}/cardinality",
            get(handlers::metrics::metric_cardinality),
        )
        // Span metadata
        .route("/api/v1/spans", get(handlers::spans::list_spans))
        .route("/api/v1/spans/{name}", get(handlers::spans::get_span))
        // Log metadata and mined patterns
        .route("/api/v1/logs", get(handlers::logs::list_logs))
        .route("/api/v1/logs/patterns", get(handlers::logs::log_patterns))
        .route("/api/v1/logs/{severity}", get(handlers::logs::get_log))
        // Service catalog
        .route("/api/v1/services", get(handlers::services::list_services))
        .route(
            "/api/v1/services/{name}/overview",
            get(handlers::services::service_overview),
        )
        // Attribute catalog
        .route("/api/v1/attributes", get(handlers::attributes::list_attributes))
        .route(
            "/api/v1/attributes/{key}",
            get(handlers::attributes::get_attribute),
        )
        // Cardinality analysis
        .route(
            "/api/v1/cardinality/high",
            get(handlers::analysis::high_cardinality),
        )
        .route("/api/v1/complexity", get(handlers::analysis::complexity))
        // Admin
        .route("/api/v1/admin/clear", post(handlers::admin::clear))
        .route("/api/v1/health", get(handlers::health::health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let intake = Router::new()
        .route("/v1/metrics", post(handlers::ingest::export_metrics))
        .route("/v1/traces", post(handlers::ingest::export_traces))
        .route("/v1/logs", post(handlers::ingest::export_logs))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let api_addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    let intake_addr = SocketAddr::from(([0, 0, 0, 0], 4318));
    tracing::info!("metascope query API on {api_addr}, OTLP/HTTP intake on {intake_addr}");

    let api_listener = tokio::net::TcpListener::bind(api_addr).await?;
    let intake_listener = tokio::net::TcpListener::bind(intake_addr).await?;

    let wait = |mut rx: watch::Receiver<bool>| async move {
        let _ = rx.changed().await;
    };
    let api_server = axum::serve(api_listener, api)
        .with_graceful_shutdown(wait(shutdown_rx.clone()));
    let intake_server = axum::serve(intake_listener, intake)
        .with_graceful_shutdown(wait(shutdown_rx.clone()));

    let (api_result, intake_result) =
        tokio::join!(api_server.into_future(), intake_server.into_future());
    api_result?;
    intake_result?;

    // Final drain is bounded; a wedged backend cannot hold the process.
    tracing::info!("draining buffers before exit");
    match tokio::time::timeout(Duration::from_secs(30), store.close()).await {
        Ok(Ok(())) => tracing::info!("shutdown complete"),
        Ok(Err(e)) => tracing::error!("shutdown flush failed: {e}"),
        Err(_) => tracing::error!("shutdown flush missed the 30s deadline"),
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!("failed to install SIGTERM handler: {e}"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
