//! Watches the subscription resource written by the UI.
//!
//! The resource is a plain text file: the first line is the upstream server
//! (`host[:port]`), every following line one channel id. The UI writes it
//! without any lock, so a read may observe a partial file. A file that is
//! empty, not newline-terminated, or whose first line is not a server spec is
//! treated exactly like a missing file, and the next poll tries again.

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::model::{ChannelId, ServerAddress, SubscriptionSet};
use crate::persist::{self, StoreError};

/// Result of one poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The published set differs from the last one read.
    Changed(SubscriptionSet),
    /// Same server and channel list as last time.
    Unchanged,
    /// No complete resource to read; back off and retry.
    Missing,
}

/// Polls the subscription resource and reports changes.
pub struct SubscriptionWatcher {
    path: PathBuf,
    default_port: u16,
    current: Option<SubscriptionSet>,
}

impl SubscriptionWatcher {
    pub fn new(path: impl Into<PathBuf>, default_port: u16) -> Self {
        Self {
            path: path.into(),
            default_port,
            current: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last set returned by a successful poll.
    pub fn current(&self) -> Option<&SubscriptionSet> {
        self.current.as_ref()
    }

    /// Read the resource and compare it against the last successful read.
    pub async fn poll(&mut self) -> WatchEvent {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %self.path.display(), error = %e, "Subscription resource unreadable");
                }
                return WatchEvent::Missing;
            }
        };

        let Some(set) = parse_resource(&text, self.default_port) else {
            debug!(path = %self.path.display(), "Subscription resource incomplete");
            return WatchEvent::Missing;
        };

        if self.current.as_ref() == Some(&set) {
            return WatchEvent::Unchanged;
        }

        self.current = Some(set.clone());
        WatchEvent::Changed(set)
    }

    /// Write `set` as the subscription resource, replacing any previous one.
    pub async fn publish(path: &Path, set: &SubscriptionSet) -> Result<(), StoreError> {
        persist::write_atomic(path, set.to_resource().as_bytes()).await
    }
}

/// Parse a complete resource; `None` when it looks partially written.
fn parse_resource(text: &str, default_port: u16) -> Option<SubscriptionSet> {
    if text.is_empty() || !text.ends_with('\n') {
        return None;
    }

    let mut lines = text.lines();
    let server = ServerAddress::parse(lines.next()?, default_port).ok()?;

    let mut channels = Vec::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.parse::<ChannelId>() {
            Ok(channel) if !channels.contains(&channel) => channels.push(channel),
            Ok(_) => {}
            Err(e) => warn!(line, error = %e, "Skipping malformed channel in subscription"),
        }
    }

    Some(SubscriptionSet::new(server, channels))
}
