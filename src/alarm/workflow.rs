//! Operator completion workflow.
//!
//! Completing an alarm takes three requests for the same id: the first is
//! answered with a prompt, the second with a confirmation question, and the
//! third completes the alarm. Progress is tracked per id.

use std::collections::HashMap;

use serde::Serialize;
use tracing::info;

use super::store::{AlarmStore, CompleteOutcome};
use crate::persist::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStep {
    Prompt,
    Confirm,
    Completed,
    NotFound,
}

impl CompletionStep {
    pub fn message(self) -> &'static str {
        match self {
            CompletionStep::Prompt => "confirm?",
            CompletionStep::Confirm => "are you sure?",
            CompletionStep::Completed => "alarm completed",
            CompletionStep::NotFound => "no ongoing alarm with this id",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionResponse {
    pub id: String,
    pub step: CompletionStep,
    pub message: &'static str,
}

impl CompletionResponse {
    fn new(id: &str, step: CompletionStep) -> Self {
        Self {
            id: id.to_string(),
            step,
            message: step.message(),
        }
    }
}

/// Per-id progress through the three requests.
#[derive(Debug, Default)]
pub struct CompletionWorkflow {
    progress: HashMap<String, CompletionStep>,
}

impl CompletionWorkflow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Where `id` currently stands, if a completion is in progress.
    pub fn pending(&self, id: &str) -> Option<CompletionStep> {
        self.progress.get(id).copied()
    }

    /// Advance the workflow for `id` by one request.
    pub async fn request(
        &mut self,
        id: &str,
        store: &mut AlarmStore,
    ) -> Result<CompletionResponse, StoreError> {
        if store.ongoing(id).is_none() {
            self.progress.remove(id);
            return Ok(CompletionResponse::new(id, CompletionStep::NotFound));
        }

        let step = match self.progress.get(id) {
            None => CompletionStep::Prompt,
            Some(CompletionStep::Prompt) => CompletionStep::Confirm,
            Some(_) => CompletionStep::Completed,
        };

        if step == CompletionStep::Completed {
            self.progress.remove(id);
            return match store.complete(id).await? {
                CompleteOutcome::Completed => {
                    info!(id, "Alarm completed by operator");
                    Ok(CompletionResponse::new(id, CompletionStep::Completed))
                }
                CompleteOutcome::NotFound => Ok(CompletionResponse::new(id, CompletionStep::NotFound)),
            };
        }

        self.progress.insert(id.to_string(), step);
        Ok(CompletionResponse::new(id, step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Alarm, AlarmState, Severity};
    use chrono::Utc;

    async fn store_with(ids: &[&str]) -> (tempfile::TempDir, AlarmStore) {
        let dir = tempfile::tempdir().unwrap();
        let mut store = AlarmStore::open(dir.path().join("alarms.json")).await.unwrap();
        for id in ids {
            store
                .upsert(Alarm {
                    id: id.to_string(),
                    station: "SB1M".to_string(),
                    name: "gps_lock".to_string(),
                    detail: String::new(),
                    datetime: Utc::now(),
                    severity: Severity::Critical,
                    status: AlarmState::Ongoing,
                })
                .await
                .unwrap();
        }
        (dir, store)
    }

    #[tokio::test]
    async fn test_three_requests_complete_once() {
        let (_dir, mut store) = store_with(&["a"]).await;
        let mut workflow = CompletionWorkflow::new();

        let first = workflow.request("a", &mut store).await.unwrap();
        assert_eq!(first.step, CompletionStep::Prompt);
        assert_eq!(first.message, "confirm?");

        let second = workflow.request("a", &mut store).await.unwrap();
        assert_eq!(second.step, CompletionStep::Confirm);
        assert_eq!(second.message, "are you sure?");
        assert_eq!(store.list(AlarmState::Ongoing).len(), 1);

        let third = workflow.request("a", &mut store).await.unwrap();
        assert_eq!(third.step, CompletionStep::Completed);
        assert!(store.list(AlarmState::Ongoing).is_empty());
        assert_eq!(store.list(AlarmState::Completed).len(), 1);

        let fourth = workflow.request("a", &mut store).await.unwrap();
        assert_eq!(fourth.step, CompletionStep::NotFound);
        assert_eq!(store.list(AlarmState::Completed).len(), 1);
    }

    #[tokio::test]
    async fn test_progress_is_per_id() {
        let (_dir, mut store) = store_with(&["a", "b"]).await;
        let mut workflow = CompletionWorkflow::new();

        workflow.request("a", &mut store).await.unwrap();
        let b = workflow.request("b", &mut store).await.unwrap();
        assert_eq!(b.step, CompletionStep::Prompt);
        assert_eq!(workflow.pending("a"), Some(CompletionStep::Prompt));
    }

    #[tokio::test]
    async fn test_unknown_id_resets_progress() {
        let (_dir, mut store) = store_with(&["a"]).await;
        let mut workflow = CompletionWorkflow::new();

        let response = workflow.request("missing", &mut store).await.unwrap();
        assert_eq!(response.step, CompletionStep::NotFound);
        assert!(workflow.pending("missing").is_none());
    }

    #[test]
    fn test_step_serializes_snake_case() {
        let json = serde_json::to_value(CompletionResponse::new("a", CompletionStep::NotFound)).unwrap();
        assert_eq!(json["step"], "not_found");
    }
}
