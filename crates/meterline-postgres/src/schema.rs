//! Table definitions, applied on connect

use sqlx::PgPool;
use tracing::info;

/// Statements creating the schema; each one is idempotent
pub const MIGRATIONS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS nodes (
        node_id BIGSERIAL PRIMARY KEY,
        props JSONB NOT NULL
    )"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS nodes_path ON nodes ((props->>'path'))"#,
    r#"CREATE TABLE IF NOT EXISTS history (
        node_id BIGINT NOT NULL REFERENCES nodes (node_id),
        dataitem_id BIGINT NOT NULL REFERENCES nodes (node_id),
        time TIMESTAMPTZ NOT NULL,
        value JSONB
    )"#,
    r#"CREATE UNIQUE INDEX IF NOT EXISTS history_series_time
        ON history (node_id, dataitem_id, time)"#,
];

pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    for statement in MIGRATIONS {
        sqlx::query(statement).execute(pool).await?;
    }
    info!(statements = MIGRATIONS.len(), "Schema is up to date");
    Ok(())
}
