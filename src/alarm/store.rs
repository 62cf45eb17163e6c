//! The persisted alarm ledger.
//!
//! One JSON document per upstream server holds two ordered sections,
//! `ongoing` and `completed`. Every mutation is applied to a copy of the
//! ledger, written through a temp file and a rename, and only then becomes the
//! in-memory state. A completion (remove from `ongoing`, append to
//! `completed`) lands in a single write, or not at all.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::model::{Alarm, AlarmState, ServerAddress};
use crate::persist::{self, StoreError};

/// What an upsert did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No ongoing alarm had this id; it was appended.
    Created,
    /// An ongoing alarm with this id had its datetime refreshed.
    Refreshed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteOutcome {
    Completed,
    NotFound,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Ledger {
    #[serde(default)]
    ongoing: Vec<Alarm>,
    #[serde(default)]
    completed: Vec<Alarm>,
}

pub struct AlarmStore {
    path: PathBuf,
    ledger: Ledger,
}

/// `<log_dir>/<host>.<port>_alarms.json`
pub fn ledger_path(log_dir: &Path, server: &ServerAddress) -> PathBuf {
    log_dir.join(format!("{}.{}_alarms.json", server.host, server.port))
}

impl AlarmStore {
    /// Load the ledger at `path`; an absent file is an empty ledger.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let mut ledger: Ledger = match persist::read_optional(&path).await? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|source| StoreError::Document {
                path: path.clone(),
                source,
            })?,
            None => Ledger::default(),
        };

        // The section is the state; the documents do not repeat it per alarm.
        for alarm in &mut ledger.completed {
            alarm.status = AlarmState::Completed;
        }

        info!(
            path = %path.display(),
            ongoing = ledger.ongoing.len(),
            completed = ledger.completed.len(),
            "Alarm ledger loaded"
        );
        Ok(Self { path, ledger })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Alarms in one section, oldest first.
    pub fn list(&self, state: AlarmState) -> &[Alarm] {
        match state {
            AlarmState::Ongoing => &self.ledger.ongoing,
            AlarmState::Completed => &self.ledger.completed,
        }
    }

    pub fn ongoing(&self, id: &str) -> Option<&Alarm> {
        self.ledger.ongoing.iter().find(|a| a.id == id)
    }

    /// Create `alarm`, or refresh the datetime of the ongoing alarm with the
    /// same id. Nothing else about an existing alarm changes.
    pub async fn upsert(&mut self, alarm: Alarm) -> Result<UpsertOutcome, StoreError> {
        let (id, station) = (alarm.id.clone(), alarm.station.clone());
        let mut next = self.ledger.clone();
        let outcome = next.merge(alarm);
        self.commit(next).await?;
        if outcome == UpsertOutcome::Created {
            info!(id = %id, station = %station, "Alarm raised");
        }
        Ok(outcome)
    }

    /// Move the ongoing alarm `id` to the completed section.
    pub async fn complete(&mut self, id: &str) -> Result<CompleteOutcome, StoreError> {
        let Some(index) = self.ledger.ongoing.iter().position(|a| a.id == id) else {
            debug!(id, "No ongoing alarm to complete");
            return Ok(CompleteOutcome::NotFound);
        };

        let mut next = self.ledger.clone();
        let mut alarm = next.ongoing.remove(index);
        alarm.status = AlarmState::Completed;
        next.completed.push(alarm);
        self.commit(next).await?;

        info!(id, "Alarm completed");
        Ok(CompleteOutcome::Completed)
    }

    /// Apply a batch of upserts and persist once.
    ///
    /// # Returns
    ///
    /// `(created, refreshed)` counts.
    pub async fn upsert_all(&mut self, alarms: Vec<Alarm>) -> Result<(usize, usize), StoreError> {
        let mut next = self.ledger.clone();
        let mut created = 0;
        let mut refreshed = 0;
        for alarm in alarms {
            match next.merge(alarm) {
                UpsertOutcome::Created => created += 1,
                UpsertOutcome::Refreshed => refreshed += 1,
            }
        }

        self.commit(next).await?;
        debug!(created, refreshed, "Alarm ledger updated");
        Ok((created, refreshed))
    }

    /// Persist `next` and adopt it; on failure the current ledger stays.
    async fn commit(&mut self, next: Ledger) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(&next).map_err(|source| StoreError::Document {
            path: self.path.clone(),
            source,
        })?;
        persist::write_atomic(&self.path, &bytes).await?;
        self.ledger = next;
        Ok(())
    }
}

impl Ledger {
    fn merge(&mut self, alarm: Alarm) -> UpsertOutcome {
        match self.ongoing.iter_mut().find(|a| a.id == alarm.id) {
            Some(existing) => {
                existing.datetime = alarm.datetime;
                UpsertOutcome::Refreshed
            }
            None => {
                debug!(id = %alarm.id, station = %alarm.station, "Alarm staged");
                self.ongoing.push(Alarm {
                    status: AlarmState::Ongoing,
                    ..alarm
                });
                UpsertOutcome::Created
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Severity;
    use chrono::{DateTime, TimeZone, Utc};

    fn alarm(id: &str, datetime: DateTime<Utc>) -> Alarm {
        Alarm {
            id: id.to_string(),
            station: "SB1M".to_string(),
            name: "humidity".to_string(),
            detail: "95".to_string(),
            datetime,
            severity: Severity::Warning,
            status: AlarmState::Ongoing,
        }
    }

    #[tokio::test]
    async fn test_upsert_creates_then_refreshes() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = AlarmStore::open(dir.path().join("alarms.json")).await.unwrap();
        let t1 = Utc.with_ymd_and_hms(2021, 11, 19, 4, 0, 0).unwrap();
        let t2 = t1 + chrono::Duration::seconds(30);

        assert_eq!(store.upsert(alarm("a", t1)).await.unwrap(), UpsertOutcome::Created);
        let mut again = alarm("a", t2);
        again.detail = "96".to_string();
        assert_eq!(store.upsert(again).await.unwrap(), UpsertOutcome::Refreshed);

        let ongoing = store.list(AlarmState::Ongoing);
        assert_eq!(ongoing.len(), 1);
        assert_eq!(ongoing[0].datetime, t2);
        assert_eq!(ongoing[0].detail, "95");
    }

    #[tokio::test]
    async fn test_complete_moves_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alarms.json");
        let mut store = AlarmStore::open(&path).await.unwrap();
        store.upsert(alarm("a", Utc::now())).await.unwrap();
        store.upsert(alarm("b", Utc::now())).await.unwrap();

        assert_eq!(store.complete("a").await.unwrap(), CompleteOutcome::Completed);
        assert_eq!(store.complete("a").await.unwrap(), CompleteOutcome::NotFound);

        assert_eq!(store.list(AlarmState::Ongoing).len(), 1);
        assert_eq!(store.list(AlarmState::Completed).len(), 1);
        assert_eq!(store.list(AlarmState::Completed)[0].status, AlarmState::Completed);

        let reopened = AlarmStore::open(&path).await.unwrap();
        assert_eq!(reopened.list(AlarmState::Ongoing)[0].id, "b");
        assert_eq!(reopened.list(AlarmState::Completed)[0].id, "a");
        assert_eq!(reopened.list(AlarmState::Completed)[0].status, AlarmState::Completed);
    }

    #[tokio::test]
    async fn test_completed_id_can_recur() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = AlarmStore::open(dir.path().join("alarms.json")).await.unwrap();
        store.upsert(alarm("a", Utc::now())).await.unwrap();
        store.complete("a").await.unwrap();

        assert_eq!(store.upsert(alarm("a", Utc::now())).await.unwrap(), UpsertOutcome::Created);
        assert!(store.ongoing("a").is_some());
    }

    #[tokio::test]
    async fn test_document_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alarms.json");
        let mut store = AlarmStore::open(&path).await.unwrap();
        let t = Utc.with_ymd_and_hms(2021, 11, 19, 4, 0, 0).unwrap();
        store.upsert(alarm("SB1M.D20211119T040000.1", t)).await.unwrap();

        let doc: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        let entry = &doc["ongoing"][0];
        assert_eq!(entry["state"], "humidity");
        assert_eq!(entry["datetime"], "D20211119T040000");
        assert_eq!(entry["problem"], 1);
        assert!(doc["completed"].as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_upsert_all_counts() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = AlarmStore::open(dir.path().join("alarms.json")).await.unwrap();
        let now = Utc::now();
        store.upsert(alarm("a", now)).await.unwrap();

        let (created, refreshed) = store
            .upsert_all(vec![alarm("a", now), alarm("b", now)])
            .await
            .unwrap();
        assert_eq!((created, refreshed), (1, 1));
    }

    /// Turns the ledger file into a non-empty directory so the rename fails.
    fn block_writes(path: &Path) {
        std::fs::remove_file(path).unwrap();
        std::fs::create_dir(path).unwrap();
        std::fs::write(path.join("keep"), b"x").unwrap();
    }

    #[tokio::test]
    async fn test_failed_complete_keeps_alarm_ongoing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alarms.json");
        let mut store = AlarmStore::open(&path).await.unwrap();
        store.upsert(alarm("a", Utc::now())).await.unwrap();
        block_writes(&path);

        assert!(store.complete("a").await.is_err());
        assert!(store.ongoing("a").is_some());
        assert!(store.list(AlarmState::Completed).is_empty());
    }

    #[tokio::test]
    async fn test_failed_upserts_leave_ledger_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alarms.json");
        let mut store = AlarmStore::open(&path).await.unwrap();
        let t1 = Utc.with_ymd_and_hms(2021, 11, 19, 4, 0, 0).unwrap();
        store.upsert(alarm("a", t1)).await.unwrap();
        block_writes(&path);

        let t2 = t1 + chrono::Duration::seconds(30);
        assert!(store.upsert(alarm("a", t2)).await.is_err());
        assert!(store.upsert_all(vec![alarm("b", t2)]).await.is_err());

        let ongoing = store.list(AlarmState::Ongoing);
        assert_eq!(ongoing.len(), 1);
        assert_eq!(ongoing[0].datetime, t1);
    }

    #[test]
    fn test_ledger_path() {
        let server = ServerAddress::parse("rtserver.example.org:18000", 18000).unwrap();
        assert_eq!(
            ledger_path(Path::new("log/server"), &server),
            PathBuf::from("log/server/rtserver.example.org.18000_alarms.json")
        );
    }
}
