//! Station health snapshots.
//!
//! A snapshot is the latest reading of every metric per station plus the
//! latest device status code per station. The relational store behind it is
//! owned by the station telemetry system; this module only reads it.
//!
//! # Schema
//!
//! - `health_metrics(station, name, value, recorded_at)`: one row per reading,
//!   `value` as text (possibly null)
//! - `device_status(station, status_code, recorded_at)`: one row per status report
//!
//! `recorded_at` is a Unix timestamp in seconds.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::{debug, warn};

use crate::model::{DeviceStatusVector, HealthMetric, Severity};
use crate::persist::{self, StoreError};

/// Latest status report of one station.
#[derive(Debug, Clone, PartialEq)]
pub struct StationStatus {
    pub station: String,
    pub status: DeviceStatusVector,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HealthSnapshot {
    pub metrics: Vec<HealthMetric>,
    pub statuses: Vec<StationStatus>,
}

/// Anything that can produce a health snapshot.
#[allow(async_fn_in_trait)]
pub trait HealthSource {
    /// Short name used for the per-source health document.
    fn name(&self) -> &str;

    async fn fetch(&self) -> anyhow::Result<HealthSnapshot>;
}

/// Health source backed by a SQLite database.
#[derive(Clone)]
pub struct SqliteHealthSource {
    pool: SqlitePool,
    name: String,
}

impl SqliteHealthSource {
    /// Connect and make sure both tables exist.
    ///
    /// # Arguments
    ///
    /// * `database_url` - SQLite connection string (e.g., "sqlite:health.db?mode=rwc")
    /// * `name` - Source name used in the health document file name
    pub async fn connect(database_url: &str, name: &str) -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        let source = Self {
            pool,
            name: name.to_string(),
        };
        // Empty tables until the station logger writes its first rows.
        source.initialize_schema().await?;
        Ok(source)
    }

    async fn initialize_schema(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS health_metrics (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                station TEXT NOT NULL,
                name TEXT NOT NULL,
                value TEXT,
                recorded_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS device_status (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                station TEXT NOT NULL,
                status_code INTEGER NOT NULL,
                recorded_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_health_metrics_station_name
            ON health_metrics(station, name, recorded_at)
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// Writers for seeding readings in tests. The daemon only reads.
#[cfg(test)]
impl SqliteHealthSource {
    /// Insert one metric reading.
    pub(crate) async fn record_metric(
        &self,
        station: &str,
        name: &str,
        value: Option<&str>,
        recorded_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO health_metrics (station, name, value, recorded_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(station)
        .bind(name)
        .bind(value)
        .bind(recorded_at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert one device status report.
    pub(crate) async fn record_status(
        &self,
        station: &str,
        status_code: u32,
        recorded_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO device_status (station, status_code, recorded_at)
            VALUES (?, ?, ?)
            "#,
        )
        .bind(station)
        .bind(i64::from(status_code))
        .bind(recorded_at.timestamp())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn from_unix(ts: i64) -> anyhow::Result<DateTime<Utc>> {
    Utc.timestamp_opt(ts, 0)
        .single()
        .ok_or_else(|| anyhow::anyhow!("timestamp {ts} out of range"))
}

impl HealthSource for SqliteHealthSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> anyhow::Result<HealthSnapshot> {
        // SQLite takes bare columns from the row that holds MAX().
        let rows = sqlx::query(
            r#"
            SELECT station, name, value, MAX(recorded_at) AS recorded_at
            FROM health_metrics
            GROUP BY station, name
            ORDER BY station, name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut metrics = Vec::with_capacity(rows.len());
        for row in rows {
            metrics.push(HealthMetric {
                station: row.try_get("station")?,
                name: row.try_get("name")?,
                value: row.try_get("value")?,
                timestamp: from_unix(row.try_get("recorded_at")?)?,
                severity: Severity::Unknown,
            });
        }

        let rows = sqlx::query(
            r#"
            SELECT station, status_code, MAX(recorded_at) AS recorded_at
            FROM device_status
            GROUP BY station
            ORDER BY station
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut statuses = Vec::with_capacity(rows.len());
        for row in rows {
            let code: i64 = row.try_get("status_code")?;
            statuses.push(StationStatus {
                station: row.try_get("station")?,
                status: DeviceStatusVector::from_code((code & 0xFFFF) as u32),
                timestamp: from_unix(row.try_get("recorded_at")?)?,
            });
        }

        Ok(HealthSnapshot { metrics, statuses })
    }
}

/// Wraps a source so that failures become an absent snapshot.
pub struct HealthSnapshotReader<S> {
    source: S,
}

impl<S: HealthSource> HealthSnapshotReader<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// The current snapshot, or `None` if the source could not be read.
    pub async fn snapshot(&self) -> Option<HealthSnapshot> {
        match self.source.fetch().await {
            Ok(snapshot) => {
                debug!(
                    source = self.source.name(),
                    metrics = snapshot.metrics.len(),
                    statuses = snapshot.statuses.len(),
                    "Health snapshot read"
                );
                Some(snapshot)
            }
            Err(e) => {
                warn!(source = self.source.name(), error = %e, "Health snapshot unavailable");
                None
            }
        }
    }
}

// ============================================================================
// Health documents
// ============================================================================

#[derive(Debug, Serialize)]
struct StateRecord<'a> {
    name: &'a str,
    value: Option<&'a str>,
    problem: Severity,
}

/// Regenerate the per-source document: stations in order, each with its
/// metrics as `{name, value, problem}` records.
pub async fn write_states_document(path: &Path, snapshot: &HealthSnapshot) -> Result<(), StoreError> {
    let mut stations: BTreeMap<&str, Vec<StateRecord<'_>>> = BTreeMap::new();
    for metric in &snapshot.metrics {
        stations.entry(metric.station.as_str()).or_default().push(StateRecord {
            name: &metric.name,
            value: metric.value.as_deref(),
            problem: metric.severity,
        });
    }

    let bytes = serde_json::to_vec_pretty(&stations).map_err(|source| StoreError::Document {
        path: path.to_path_buf(),
        source,
    })?;
    persist::write_atomic(path, &bytes).await
}
