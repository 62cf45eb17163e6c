//! Background tasks owned by the daemon.
//!
//! The alarm loop and the HTTP surface run beside the ingestion supervisor.
//! Neither is expected to return, so the first one that does (with an error,
//! cleanly, or by panicking) is reported to `main` as a failure.

use std::future::Future;

use tokio::task::JoinSet;
use tracing::info;

/// Named long-running tasks, watched as a group.
#[derive(Default)]
pub struct BackgroundTasks {
    set: JoinSet<(&'static str, anyhow::Result<()>)>,
}

impl BackgroundTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn `task` under `name`.
    pub fn spawn<F, E>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        info!(task = name, "Background task started");
        self.set
            .spawn(async move { (name, task.await.map_err(Into::into)) });
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Wait for the first task to end and describe why.
    ///
    /// Pends forever when nothing was spawned, so it can sit in a
    /// `tokio::select!` unconditionally.
    pub async fn failure(&mut self) -> anyhow::Error {
        match self.set.join_next().await {
            Some(Ok((name, Err(e)))) => e.context(format!("{name} stopped")),
            Some(Ok((name, Ok(())))) => anyhow::anyhow!("{name} exited unexpectedly"),
            Some(Err(e)) => anyhow::Error::new(e).context("background task aborted"),
            None => std::future::pending().await,
        }
    }

    /// Abort every remaining task.
    pub fn shutdown(&mut self) {
        self.set.abort_all();
    }
}
