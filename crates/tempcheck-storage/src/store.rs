use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tempcheck_core::{
    discrepancy, sort_discrepancies, DiscrepancyEntry, DiscrepancyStats, ReconciledRecord,
    RecordUpdate,
};
use thiserror::Error;
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS weather_records (
    entity_key          TEXT PRIMARY KEY NOT NULL,
    temperature_scraped REAL,
    feels_like_scraped  REAL,
    temperature_api     REAL,
    feels_like_api      REAL,
    average_temperature REAL,
    updated_at          TEXT NOT NULL,
    write_seq           INTEGER NOT NULL
)
"#;

const RECORD_COLUMNS: &str = "entity_key, temperature_scraped, feels_like_scraped, \
     temperature_api, feels_like_api, average_temperature, updated_at";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entity key must not be empty")]
    EmptyKey,
    #[error("invalid database url {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: sqlx::Error,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Keyed table of reconciled readings, one row per entity.
///
/// Backed by a single-connection SQLite pool: there is one writer per run, and
/// every write happens inside a transaction so the derived average is never
/// visible next to stale temperatures.
#[derive(Debug, Clone)]
pub struct ReconciliationStore {
    pool: SqlitePool,
}

impl ReconciliationStore {
    /// Open (creating if missing) the database at `database_url`, e.g.
    /// `sqlite://weather_data.db`.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|source| StoreError::InvalidUrl {
                url: database_url.to_string(),
                source,
            })?
            .create_if_missing(true);
        Self::with_options(options).await
    }

    pub async fn connect_in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    async fn with_options(options: SqliteConnectOptions) -> Result<Self, StoreError> {
        // An in-memory database lives only as long as its connection, so the one
        // connection is never reaped.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    /// Insert or fully replace the row for `update.entity_key`.
    pub async fn upsert(&self, update: &RecordUpdate) -> Result<ReconciledRecord, StoreError> {
        if update.entity_key.trim().is_empty() {
            return Err(StoreError::EmptyKey);
        }
        let record = update.clone().into_record(Utc::now());

        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO weather_records (
                entity_key, temperature_scraped, feels_like_scraped,
                temperature_api, feels_like_api, average_temperature,
                updated_at, write_seq
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7,
                    (SELECT COALESCE(MAX(write_seq), 0) + 1 FROM weather_records))
            ON CONFLICT(entity_key) DO UPDATE SET
                temperature_scraped = excluded.temperature_scraped,
                feels_like_scraped  = excluded.feels_like_scraped,
                temperature_api     = excluded.temperature_api,
                feels_like_api      = excluded.feels_like_api,
                average_temperature = excluded.average_temperature,
                updated_at          = excluded.updated_at,
                write_seq           = excluded.write_seq
            "#,
        )
        .bind(&record.entity_key)
        .bind(record.temperature_scraped)
        .bind(record.feels_like_scraped)
        .bind(record.temperature_api)
        .bind(record.feels_like_api)
        .bind(record.average_temperature)
        .bind(record.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(entity_key = %record.entity_key, average = ?record.average_temperature, "upserted record");
        Ok(record)
    }

    /// Positional form of [`upsert`](Self::upsert).
    pub async fn upsert_values(
        &self,
        entity_key: &str,
        temperature_scraped: Option<f64>,
        feels_like_scraped: Option<f64>,
        temperature_api: Option<f64>,
        feels_like_api: Option<f64>,
    ) -> Result<ReconciledRecord, StoreError> {
        self.upsert(&RecordUpdate {
            entity_key: entity_key.to_string(),
            temperature_scraped,
            feels_like_scraped,
            temperature_api,
            feels_like_api,
        })
        .await
    }

    pub async fn get(&self, entity_key: &str) -> Result<Option<ReconciledRecord>, StoreError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM weather_records WHERE entity_key = ?1");
        let row = sqlx::query(&sql)
            .bind(entity_key)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    /// Every record, most recent write first.
    pub async fn all(&self) -> Result<Vec<ReconciledRecord>, StoreError> {
        let sql = format!("SELECT {RECORD_COLUMNS} FROM weather_records ORDER BY write_seq DESC");
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(record_from_row).collect()
    }

    /// Records whose two temperatures differ by strictly more than `threshold`,
    /// largest difference first.
    pub async fn discrepancies(&self, threshold: f64) -> Result<Vec<DiscrepancyEntry>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT entity_key, temperature_scraped, temperature_api
              FROM weather_records
             WHERE temperature_scraped IS NOT NULL
               AND temperature_api IS NOT NULL
               AND ABS(temperature_scraped - temperature_api) > ?1
             ORDER BY ABS(temperature_scraped - temperature_api) DESC, entity_key
            "#,
        )
        .bind(threshold)
        .fetch_all(&self.pool)
        .await?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let temperature_scraped: f64 = row.try_get("temperature_scraped")?;
            let temperature_api: f64 = row.try_get("temperature_api")?;
            entries.push(DiscrepancyEntry {
                entity_key: row.try_get("entity_key")?,
                temperature_scraped,
                temperature_api,
                absolute_difference: discrepancy(temperature_scraped, temperature_api),
            });
        }
        sort_discrepancies(&mut entries);
        Ok(entries)
    }

    /// Mean/max/min absolute discrepancy over rows where both sources are present.
    pub async fn statistics(&self) -> Result<DiscrepancyStats, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT temperature_scraped, temperature_api
              FROM weather_records
             WHERE temperature_scraped IS NOT NULL
               AND temperature_api IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut differences = Vec::with_capacity(rows.len());
        for row in rows {
            let scraped: f64 = row.try_get("temperature_scraped")?;
            let api: f64 = row.try_get("temperature_api")?;
            differences.push(discrepancy(scraped, api));
        }
        Ok(DiscrepancyStats::from_differences(differences))
    }

    pub async fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM weather_records")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as usize)
    }

    /// Delete every record. Reset path only.
    pub async fn clear(&self) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM weather_records")
            .execute(&self.pool)
            .await?;
        info!(deleted = result.rows_affected(), "cleared weather records");
        Ok(result.rows_affected())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn record_from_row(row: &SqliteRow) -> Result<ReconciledRecord, StoreError> {
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;
    Ok(ReconciledRecord {
        entity_key: row.try_get("entity_key")?,
        temperature_scraped: row.try_get("temperature_scraped")?,
        feels_like_scraped: row.try_get("feels_like_scraped")?,
        temperature_api: row.try_get("temperature_api")?,
        feels_like_api: row.try_get("feels_like_api")?,
        average_temperature: row.try_get("average_temperature")?,
        updated_at,
    })
}
