//! [`Store`] implementation over a Postgres connection pool

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use meterline_core::shutdown::Shutdown;
use meterline_core::{NewNode, NodeId, SampleRecord, Scalar, Series, Store, StoreError, StoreResult, TimedValue};

use crate::schema;

#[derive(Error, Debug)]
pub enum PgError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

/// Connection settings
#[derive(Debug, Clone)]
pub struct PgOptions {
    pub url: String,
    pub max_connections: u32,
    /// Fixed delay between connection attempts
    pub retry_delay: Duration,
}

/// Hide the password of a connection URL for logging
pub fn mask_url(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    match rest.rsplit_once('@') {
        Some((credentials, host)) => {
            let user = credentials.split(':').next().unwrap_or_default();
            format!("{}://{}:***@{}", scheme, user, host)
        }
        None => url.to_string(),
    }
}

fn backend(e: sqlx::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn timed(rows: Vec<(DateTime<Utc>, Option<serde_json::Value>)>) -> Vec<TimedValue> {
    rows.into_iter()
        .map(|(time, value)| {
            let value = value
                .as_ref()
                .and_then(Scalar::from_json)
                .unwrap_or(Scalar::Null);
            TimedValue::new(time, value)
        })
        .collect()
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Connect once and bring the schema up to date
    pub async fn connect(options: &PgOptions) -> Result<Self, PgError> {
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&options.url)
            .await?;
        schema::migrate(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Connect, retrying with a fixed delay until it works; `None` on shutdown
    pub async fn connect_with_retry(options: &PgOptions, shutdown: &mut Shutdown) -> Option<Self> {
        info!(url = %mask_url(&options.url), "Connecting to database");
        loop {
            if shutdown.is_triggered() {
                return None;
            }
            match Self::connect(options).await {
                Ok(store) => match store.ping().await {
                    Ok(()) => {
                        info!("Database connection pool created");
                        return Some(store);
                    }
                    Err(e) => warn!(error = %e, "Database ping failed, retrying"),
                },
                Err(e) => warn!(
                    error = %e,
                    retry_secs = options.retry_delay.as_secs(),
                    "Database not ready, retrying"
                ),
            }
            if !shutdown.sleep(options.retry_delay).await {
                return None;
            }
        }
    }

    async fn write_samples(&self, records: &[SampleRecord], replace: bool) -> StoreResult<()> {
        let sql = if replace {
            "INSERT INTO history (node_id, dataitem_id, time, value) VALUES ($1, $2, $3, $4)
             ON CONFLICT (node_id, dataitem_id, time) DO UPDATE SET value = EXCLUDED.value"
        } else {
            "INSERT INTO history (node_id, dataitem_id, time, value) VALUES ($1, $2, $3, $4)
             ON CONFLICT (node_id, dataitem_id, time) DO NOTHING"
        };

        let mut tx = self.pool.begin().await.map_err(backend)?;
        for record in records {
            sqlx::query(sql)
                .bind(record.node_id.get())
                .bind(record.dataitem_id.get())
                .bind(record.time)
                .bind(Json(record.value.to_json()))
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }
        tx.commit().await.map_err(backend)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(backend)
    }

    async fn insert_node(&self, node: &NewNode) -> StoreResult<NodeId> {
        let result = sqlx::query_scalar::<_, i64>("INSERT INTO nodes (props) VALUES ($1) RETURNING node_id")
            .bind(Json(node.props()))
            .fetch_one(&self.pool)
            .await;

        match result {
            Ok(id) => Ok(NodeId(id)),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => Err(StoreError::Conflict {
                path: node.path.clone(),
            }),
            Err(e) => Err(backend(e)),
        }
    }

    async fn lookup_node(&self, path: &str) -> StoreResult<Option<NodeId>> {
        sqlx::query_scalar::<_, i64>("SELECT node_id FROM nodes WHERE props->>'path' = $1")
            .bind(path)
            .fetch_optional(&self.pool)
            .await
            .map(|id| id.map(NodeId))
            .map_err(backend)
    }

    async fn append_samples(&self, records: &[SampleRecord]) -> StoreResult<()> {
        self.write_samples(records, false).await
    }

    async fn upsert_samples(&self, records: &[SampleRecord]) -> StoreResult<()> {
        self.write_samples(records, true).await
    }

    async fn latest_before(
        &self,
        series: Series,
        time: DateTime<Utc>,
    ) -> StoreResult<Option<TimedValue>> {
        let rows = sqlx::query_as::<_, (DateTime<Utc>, Option<serde_json::Value>)>(
            "SELECT time, value FROM history
             WHERE node_id = $1 AND dataitem_id = $2 AND time < $3
             ORDER BY time DESC LIMIT 1",
        )
        .bind(series.device_id.get())
        .bind(series.dataitem_id.get())
        .bind(time)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(timed(rows).pop())
    }

    async fn earliest(&self, series: Series) -> StoreResult<Option<TimedValue>> {
        let rows = sqlx::query_as::<_, (DateTime<Utc>, Option<serde_json::Value>)>(
            "SELECT time, value FROM history
             WHERE node_id = $1 AND dataitem_id = $2
             ORDER BY time ASC LIMIT 1",
        )
        .bind(series.device_id.get())
        .bind(series.dataitem_id.get())
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(timed(rows).pop())
    }

    async fn range(
        &self,
        series: Series,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StoreResult<Vec<TimedValue>> {
        let rows = sqlx::query_as::<_, (DateTime<Utc>, Option<serde_json::Value>)>(
            "(SELECT time, value FROM history
              WHERE node_id = $1 AND dataitem_id = $2 AND time < $3
              ORDER BY time DESC LIMIT 1)
             UNION ALL
             (SELECT time, value FROM history
              WHERE node_id = $1 AND dataitem_id = $2 AND time >= $3 AND time <= $4)
             ORDER BY time ASC",
        )
        .bind(series.device_id.get())
        .bind(series.dataitem_id.get())
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?;
        Ok(timed(rows))
    }
}
