//! Alarm derivation and lifecycle.
//!
//! - [`engine`]: classifies snapshots into alarm candidates
//! - [`store`]: the persisted `ongoing`/`completed` ledger
//! - [`workflow`]: the three-step operator completion
//!
//! [`AlarmCycle`] ties them to a health source and runs on a fixed period.

pub mod engine;
pub mod store;
pub mod workflow;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{info, warn};

pub use engine::{AlarmEngine, classify};
pub use store::{AlarmStore, CompleteOutcome, UpsertOutcome, ledger_path};
pub use workflow::{CompletionResponse, CompletionStep, CompletionWorkflow};

use crate::health::{self, HealthSnapshotReader, HealthSource};
use crate::persist::StoreError;

/// Outcome of one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// False when no snapshot could be read.
    pub evaluated: bool,
    pub created: usize,
    pub refreshed: usize,
}

/// One periodic pass: snapshot, classify, upsert.
pub struct AlarmCycle<S> {
    reader: HealthSnapshotReader<S>,
    engine: AlarmEngine,
    store: Arc<Mutex<AlarmStore>>,
    states_path: PathBuf,
}

impl<S: HealthSource> AlarmCycle<S> {
    pub fn new(
        reader: HealthSnapshotReader<S>,
        engine: AlarmEngine,
        store: Arc<Mutex<AlarmStore>>,
        states_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            reader,
            engine,
            store,
            states_path: states_path.into(),
        }
    }

    /// Run a single cycle stamped with `cycle_time`.
    pub async fn run_once(&self, cycle_time: DateTime<Utc>) -> Result<CycleReport, StoreError> {
        let Some(mut snapshot) = self.reader.snapshot().await else {
            return Ok(CycleReport::default());
        };

        self.engine.annotate(&mut snapshot);
        if let Err(e) = health::write_states_document(&self.states_path, &snapshot).await {
            warn!(path = %self.states_path.display(), error = %e, "Could not write health document");
        }

        let alarms = self.engine.evaluate(&snapshot, cycle_time);
        let (created, refreshed) = self.store.lock().await.upsert_all(alarms).await?;

        if created > 0 {
            info!(created, refreshed, "Alarm cycle raised new alarms");
        }
        Ok(CycleReport {
            evaluated: true,
            created,
            refreshed,
        })
    }

    /// Run a cycle every `period` until a ledger write fails.
    pub async fn run(self, period: Duration) -> Result<(), StoreError> {
        info!(period_secs = period.as_secs(), "Alarm loop started");
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            self.run_once(Utc::now()).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::HealthSnapshot;
    use crate::model::{AlarmState, HealthMetric, Severity};
    use chrono::TimeZone;

    struct Fixed(HealthSnapshot);

    impl HealthSource for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn fetch(&self) -> anyhow::Result<HealthSnapshot> {
            Ok(self.0.clone())
        }
    }

    fn humid(reading: DateTime<Utc>) -> HealthSnapshot {
        HealthSnapshot {
            metrics: vec![HealthMetric {
                station: "SB1M".to_string(),
                name: "humidity".to_string(),
                value: Some("95".to_string()),
                timestamp: reading,
                severity: Severity::Unknown,
            }],
            statuses: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_recurring_metric_keeps_one_alarm_with_latest_cycle_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Mutex::new(
            AlarmStore::open(dir.path().join("alarms.json")).await.unwrap(),
        ));
        let reading = Utc.with_ymd_and_hms(2021, 11, 19, 4, 0, 0).unwrap();
        let cycle = AlarmCycle::new(
            HealthSnapshotReader::new(Fixed(humid(reading))),
            AlarmEngine::default(),
            store.clone(),
            dir.path().join("fixed_states.json"),
        );

        let t1 = reading + chrono::Duration::seconds(30);
        let t2 = t1 + chrono::Duration::seconds(30);
        let first = cycle.run_once(t1).await.unwrap();
        let second = cycle.run_once(t2).await.unwrap();

        assert_eq!((first.created, first.refreshed), (1, 0));
        assert_eq!((second.created, second.refreshed), (0, 1));

        let store = store.lock().await;
        let ongoing = store.list(AlarmState::Ongoing);
        assert_eq!(ongoing.len(), 1);
        assert_eq!(ongoing[0].id, "SB1M.D20211119T040000.1");
        assert_eq!(ongoing[0].datetime, t2);
        assert!(dir.path().join("fixed_states.json").exists());
    }

    #[tokio::test]
    async fn test_loop_surfaces_ledger_write_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("alarms.json");
        let store = Arc::new(Mutex::new(AlarmStore::open(&ledger).await.unwrap()));
        std::fs::create_dir(&ledger).unwrap();
        std::fs::write(ledger.join("keep"), b"x").unwrap();

        let cycle = AlarmCycle::new(
            HealthSnapshotReader::new(Fixed(humid(Utc::now()))),
            AlarmEngine::default(),
            store,
            dir.path().join("fixed_states.json"),
        );
        let mut tasks = crate::tasks::BackgroundTasks::new();
        tasks.spawn("Alarm loop", cycle.run(Duration::from_millis(10)));

        let error = tokio::time::timeout(Duration::from_secs(5), tasks.failure())
            .await
            .unwrap();
        let message = format!("{error:#}");
        assert!(message.starts_with("Alarm loop stopped"));
        assert!(message.contains("alarms.json"));
    }
}
