use clickhouse::Client;
use serde::Deserialize;

/// Highest schema version this binary understands. A database stamped
/// with a newer version belongs to a newer binary; starting against it
/// would silently misread the tables, so startup fails instead.
pub const SCHEMA_VERSION: u32 = 1;

/// Ordered DDL to ensure the metadata schema exists. Every statement is
/// idempotent (`IF NOT EXISTS`) so this is safe to run on every startup.
///
/// Entity tables use `ReplacingMergeTree(last_seen)`: upserts append the
/// merged entity snapshot and the engine keeps the freshest row per
/// identity key. `attribute_values` is the legacy observation log used
/// when the catalog is disabled; its counts sum-merge instead.
const MIGRATIONS: &[&str] = &[
    "CREATE DATABASE IF NOT EXISTS metascope",

    r"CREATE TABLE IF NOT EXISTS metascope.schema_version
(
    version    UInt32,
    applied_at DateTime DEFAULT now()
)
ENGINE = MergeTree
ORDER BY version",

    r"CREATE TABLE IF NOT EXISTS metascope.metrics
(
    name          LowCardinality(String),
    service_name  LowCardinality(String),
    kind          LowCardinality(String),
    unit          String,
    temporality   LowCardinality(String),
    is_monotonic  Bool,
    label_keys    Array(String),
    resource_keys Array(String),
    sample_count  UInt64,
    services      Array(String),
    first_seen    Int64,
    last_seen     Int64
)
ENGINE = ReplacingMergeTree(last_seen)
ORDER BY (name, service_name)
SETTINGS index_granularity = 8192",

    r"CREATE TABLE IF NOT EXISTS metascope.spans
(
    name               LowCardinality(String),
    service_name       LowCardinality(String),
    kind               LowCardinality(String),
    attribute_keys     Array(String),
    resource_keys      Array(String),
    event_names        Array(String),
    has_links          Bool,
    status_codes       Array(String),
    dropped_attributes UInt64,
    dropped_events     UInt64,
    dropped_links      UInt64,
    sample_count       UInt64,
    services           Array(String),
    first_seen         Int64,
    last_seen          Int64
)
ENGINE = ReplacingMergeTree(last_seen)
ORDER BY (name, service_name)
SETTINGS index_granularity = 8192",

    r"CREATE TABLE IF NOT EXISTS metascope.logs
(
    pattern_template String,
    severity         LowCardinality(String),
    severity_number  Int32,
    service_name     LowCardinality(String),
    attribute_keys   Array(String),
    resource_keys    Array(String),
    example_body     String,
    flags            UInt8,
    sample_count     UInt64,
    services         Array(String),
    first_seen       Int64,
    last_seen        Int64
)
ENGINE = ReplacingMergeTree(last_seen)
ORDER BY (pattern_template, severity, service_name)
SETTINGS index_granularity = 8192",

    r"CREATE TABLE IF NOT EXISTS metascope.attribute_catalog
(
    key                   String,
    hll_sketch            String,
    count                 UInt64,
    estimated_cardinality UInt64,
    value_samples         Array(String),
    signal_types          Array(String),
    scope                 LowCardinality(String),
    first_seen            Int64,
    last_seen             Int64
)
ENGINE = ReplacingMergeTree(last_seen)
ORDER BY key
SETTINGS index_granularity = 8192",

    r"CREATE TABLE IF NOT EXISTS metascope.attribute_values
(
    key               String,
    value             String,
    signal_type       LowCardinality(String),
    scope             LowCardinality(String),
    observation_count UInt64
)
ENGINE = SummingMergeTree(observation_count)
ORDER BY (key, value, signal_type, scope)
SETTINGS index_granularity = 8192",
];

#[derive(Debug, clickhouse::Row, Deserialize)]
struct VersionRow {
    version: u32,
}

/// Run all migrations against ClickHouse and reconcile the recorded
/// schema version.
///
/// Connects **without** a default database so `CREATE DATABASE` succeeds
/// on a fresh instance.
pub async fn run(url: &str, user: &str, password: &str) -> anyhow::Result<()> {
    let client = Client::default()
        .with_url(url)
        .with_user(user)
        .with_password(password);

    tracing::info!("running clickhouse migrations ({} statements)", MIGRATIONS.len());

    for (i, sql) in MIGRATIONS.iter().enumerate() {
        let preview: String = sql.chars().take(80).collect();
        tracing::debug!("migration {}/{}: {}...", i + 1, MIGRATIONS.len(), preview);
        client.query(sql).execute().await.map_err(|e| {
            tracing::error!("migration {}/{} failed: {e}", i + 1, MIGRATIONS.len());
            e
        })?;
    }

    let recorded = client
        .query("SELECT max(version) AS version FROM metascope.schema_version")
        .fetch_one::<VersionRow>()
        .await
        .map(|r| r.version)
        .unwrap_or(0);

    if recorded > SCHEMA_VERSION {
        anyhow::bail!(
            "database schema version {recorded} is newer than this binary understands \
             (max {SCHEMA_VERSION}); refusing to start. Upgrade metascope or point it \
             at a fresh database"
        );
    }
    if recorded < SCHEMA_VERSION {
        client
            .query("INSERT INTO metascope.schema_version (version) VALUES (?)")
            .bind(SCHEMA_VERSION)
            .execute()
            .await?;
        tracing::info!("recorded schema version {SCHEMA_VERSION}");
    }

    tracing::info!("clickhouse migrations complete");
    Ok(())
}
