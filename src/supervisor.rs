//! Ingestion supervisor: owns the upstream session and feeds the ring buffers.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──open──▶ Connected ──negotiate──▶ Streaming
//!                    ▲                        │ new subscription
//!                    └──────── Draining ◀─────┘
//! Streaming ──terminate / error / timeout──▶ Idle ──reconnect──▶ Streaming
//! ```
//!
//! A reconnect reissues the full selection and asks every station to resume
//! after the last sequence number seen from it, so a dropped session does not
//! lose records the server still holds.
//!
//! # Errors
//!
//! Upstream failures are transient: they are logged and the session is
//! re-established after a back-off. Ring buffer I/O failures are fatal and
//! returned to the caller.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::model::{ChannelId, SubscriptionSet};
use crate::persist::StoreError;
use crate::ring_buffer::RingBufferStore;
use crate::seedlink::{mseed, Frame, Packet, SeedLinkError, SessionRequest, StationKey, TimeWindow, Upstream};
use crate::signal;
use crate::subscription::{SubscriptionWatcher, WatchEvent};

/// Batches starting further back than this are dropped in live mode.
pub const DEFAULT_STALE_AFTER_SECS: i64 = 300;

/// Tunables for a supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Rate every stored batch is resampled to.
    pub target_rate: f64,
    pub stale_after: chrono::Duration,
    /// Pause between failed connection attempts and while no subscription exists.
    pub backoff: Duration,
    /// Longest silence tolerated on a streaming session.
    pub idle_timeout: Duration,
    /// Minimum time between two reads of the subscription resource.
    pub poll_interval: Duration,
    /// Connection attempts a retrieval session makes before giving up.
    pub retrieval_attempts: u32,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            target_rate: 25.0,
            stale_after: chrono::Duration::seconds(DEFAULT_STALE_AFTER_SECS),
            backoff: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            retrieval_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connected,
    Streaming,
    Draining,
}

/// What one read from the upstream amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Continue,
    /// The server signalled the end of the stream.
    Ended,
    /// The session failed and must be re-established.
    Lost,
}

/// Summary of a finished retrieval session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrievalSummary {
    pub batches: usize,
    pub samples: usize,
    /// Whether the server signalled the end of the range.
    pub complete: bool,
}

pub struct ConnectionSupervisor<U: Upstream> {
    upstream: U,
    store: RingBufferStore,
    settings: SupervisorSettings,
    state: SessionState,
    current: Option<SubscriptionSet>,
    sequences: HashMap<StationKey, u32>,
    /// Start of the last stored batch per channel, to skip records replayed
    /// after a reconnect.
    last_start: HashMap<ChannelId, DateTime<Utc>>,
    last_poll: Option<Instant>,
}

impl<U: Upstream> ConnectionSupervisor<U> {
    pub fn new(upstream: U, store: RingBufferStore, settings: SupervisorSettings) -> Self {
        Self {
            upstream,
            store,
            settings,
            state: SessionState::Idle,
            current: None,
            sequences: HashMap::new(),
            last_start: HashMap::new(),
            last_poll: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The subscription currently applied.
    pub fn current(&self) -> Option<&SubscriptionSet> {
        self.current.as_ref()
    }

    pub fn upstream(&self) -> &U {
        &self.upstream
    }

    pub fn store(&self) -> &RingBufferStore {
        &self.store
    }

    fn is_selected(&self, channel: &ChannelId) -> bool {
        self.current
            .as_ref()
            .is_some_and(|set| set.channels.contains(channel))
    }

    /// Switch to `set`.
    ///
    /// An identical set is a no-op. Otherwise the buffers of removed channels
    /// are dropped, the socket is reopened if the server changed, and the full
    /// new list is selected.
    pub async fn apply(&mut self, set: SubscriptionSet) -> Result<(), StoreError> {
        if self.current.as_ref() == Some(&set) {
            debug!("Subscription unchanged, keeping session");
            return Ok(());
        }

        let diff = SubscriptionSet::diff(self.current.as_ref(), &set);
        for channel in &diff.removed {
            self.store.drop_channel(channel).await?;
            self.last_start.remove(channel);
            info!(channel = %channel, "Channel deselected, buffer dropped");
        }
        for channel in &diff.added {
            info!(channel = %channel, "Channel selected");
        }

        let server_changed = self
            .current
            .as_ref()
            .is_none_or(|current| current.server != set.server);
        if server_changed {
            // Sequence numbers are only meaningful to the server that issued them.
            self.sequences.clear();
        } else {
            self.sequences.retain(|(network, station), _| {
                set.channels
                    .iter()
                    .any(|c| &c.network == network && &c.station == station)
            });
        }

        if self.state != SessionState::Idle {
            self.state = SessionState::Draining;
        }
        info!(
            server = %set.server,
            channels = set.channels.len(),
            server_changed,
            "Applying subscription"
        );
        self.current = Some(set);

        if let Err(e) = self.establish(server_changed, None).await {
            warn!(error = %e, "Could not establish session, will retry");
            self.upstream.close().await;
            self.state = SessionState::Idle;
        }
        Ok(())
    }

    /// Bring the session up for the current set.
    async fn establish(&mut self, reopen: bool, window: Option<TimeWindow>) -> Result<(), SeedLinkError> {
        let Some(set) = self.current.clone() else {
            return Ok(());
        };

        if set.channels.is_empty() {
            self.upstream.close().await;
            self.state = SessionState::Idle;
            info!("No channels selected, session closed");
            return Ok(());
        }

        if reopen || self.state == SessionState::Idle {
            self.upstream.open(&set.server).await?;
            self.state = SessionState::Connected;
        }

        let request = SessionRequest::from_channels(&set.channels, &self.sequences, window);
        let accepted = self.upstream.negotiate(&request).await?;
        self.state = SessionState::Streaming;
        info!(server = %set.server, stations = accepted, "Streaming");
        Ok(())
    }

    async fn reconnect(&mut self, window: Option<TimeWindow>) -> Result<(), SeedLinkError> {
        self.upstream.close().await;
        self.state = SessionState::Idle;
        self.establish(true, window).await
    }

    /// Read one frame and act on it.
    async fn step(&mut self, live: bool) -> Result<(Step, usize), StoreError> {
        let frame = match tokio::time::timeout(self.settings.idle_timeout, self.upstream.collect()).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(e)) => {
                warn!(error = %e, "Upstream read failed");
                return Ok((Step::Lost, 0));
            }
            Err(_) => {
                warn!(
                    timeout_secs = self.settings.idle_timeout.as_secs(),
                    "No data from upstream within idle timeout"
                );
                return Ok((Step::Lost, 0));
            }
        };

        match frame {
            Frame::Info => Ok((Step::Continue, 0)),
            Frame::Terminate => {
                info!("Upstream signalled end of stream");
                Ok((Step::Ended, 0))
            }
            Frame::Error(message) => {
                warn!(message = %message, "Upstream signalled an error");
                Ok((Step::Lost, 0))
            }
            Frame::Data(packet) => {
                let stored = self.ingest(packet, live).await?;
                Ok((Step::Continue, stored))
            }
        }
    }

    /// Decode, filter, condition and store one record. Returns the number of
    /// samples stored.
    async fn ingest(&mut self, packet: Packet, live: bool) -> Result<usize, StoreError> {
        let batch = match mseed::decode_record(&packet.record) {
            Ok(batch) => batch,
            Err(e) => {
                warn!(sequence = ?packet.sequence, error = %e, "Skipping undecodable record");
                return Ok(0);
            }
        };

        if let Some(sequence) = packet.sequence {
            let key = (batch.channel.network.clone(), batch.channel.station.clone());
            self.sequences.insert(key, sequence);
        }

        if batch.is_empty() || !self.is_selected(&batch.channel) {
            return Ok(0);
        }

        if live {
            let age = Utc::now() - batch.start;
            if age > self.settings.stale_after {
                warn!(
                    channel = %batch.channel,
                    start = %batch.start,
                    age_secs = age.num_seconds(),
                    "Dropping stale batch"
                );
                return Ok(0);
            }
        }

        if self
            .last_start
            .get(&batch.channel)
            .is_some_and(|last| batch.start <= *last)
        {
            debug!(channel = %batch.channel, start = %batch.start, "Skipping replayed batch");
            return Ok(0);
        }
        self.last_start.insert(batch.channel.clone(), batch.start);

        let conditioned = signal::condition(&batch, self.settings.target_rate);
        let outcome = self.store.append(&batch.channel, &conditioned).await?;
        debug!(
            channel = %batch.channel,
            samples = conditioned.len(),
            buffered = outcome.len,
            trimmed = outcome.trimmed,
            "Batch stored"
        );
        Ok(conditioned.len())
    }

    /// One iteration of live mode: maybe poll the subscription, then read one
    /// frame or recover the session.
    pub async fn tick(&mut self, watcher: &mut SubscriptionWatcher) -> Result<(), StoreError> {
        let due = self
            .last_poll
            .is_none_or(|at| at.elapsed() >= self.settings.poll_interval);
        if due {
            self.last_poll = Some(Instant::now());
            match watcher.poll().await {
                WatchEvent::Changed(set) => self.apply(set).await?,
                WatchEvent::Unchanged => {}
                WatchEvent::Missing if self.state == SessionState::Streaming => {}
                WatchEvent::Missing => {
                    debug!(path = %watcher.path().display(), "No subscription yet");
                    tokio::time::sleep(self.settings.backoff).await;
                    return Ok(());
                }
            }
        }

        if self.state != SessionState::Streaming {
            let wanted = self
                .current
                .as_ref()
                .is_some_and(|set| !set.channels.is_empty());
            if !wanted {
                tokio::time::sleep(self.settings.poll_interval).await;
                return Ok(());
            }
            if let Err(e) = self.reconnect(None).await {
                warn!(error = %e, backoff_secs = self.settings.backoff.as_secs(), "Reconnect failed");
                self.upstream.close().await;
                self.state = SessionState::Idle;
                tokio::time::sleep(self.settings.backoff).await;
            }
            return Ok(());
        }

        match self.step(true).await? {
            (Step::Continue, _) => {}
            (Step::Ended | Step::Lost, _) => {
                info!("Re-establishing session");
                if let Err(e) = self.reconnect(None).await {
                    warn!(error = %e, "Reconnect failed");
                    self.upstream.close().await;
                    self.state = SessionState::Idle;
                    tokio::time::sleep(self.settings.backoff).await;
                }
            }
        }
        Ok(())
    }

    /// Follow the subscription resource and stream until a fatal error.
    pub async fn run_live(&mut self, watcher: &mut SubscriptionWatcher) -> Result<(), StoreError> {
        info!(path = %watcher.path().display(), "Live ingestion started");
        loop {
            self.tick(watcher).await?;
        }
    }

    /// Fetch `window` for `set` and return once the server signals the end of
    /// the range, or the connection attempts are exhausted.
    pub async fn run_retrieval(
        &mut self,
        set: SubscriptionSet,
        window: TimeWindow,
    ) -> Result<RetrievalSummary, StoreError> {
        info!(
            server = %set.server,
            channels = set.channels.len(),
            begin = %window.begin,
            end = %window.end,
            "Retrieval started"
        );
        self.current = Some(set);
        self.state = SessionState::Idle;

        let mut summary = RetrievalSummary::default();
        let mut failures = 0;
        loop {
            if self.state != SessionState::Streaming {
                if let Err(e) = self.reconnect(Some(window)).await {
                    failures += 1;
                    warn!(error = %e, attempt = failures, "Retrieval connection failed");
                    if failures >= self.settings.retrieval_attempts {
                        break;
                    }
                    tokio::time::sleep(self.settings.backoff).await;
                    continue;
                }
                if self.state != SessionState::Streaming {
                    // Nothing selected.
                    break;
                }
            }

            match self.step(false).await? {
                (Step::Continue, 0) => {}
                (Step::Continue, samples) => {
                    summary.batches += 1;
                    summary.samples += samples;
                }
                (Step::Ended, _) => {
                    summary.complete = true;
                    break;
                }
                (Step::Lost, _) => {
                    failures += 1;
                    if failures >= self.settings.retrieval_attempts {
                        break;
                    }
                    self.upstream.close().await;
                    self.state = SessionState::Idle;
                    tokio::time::sleep(self.settings.backoff).await;
                }
            }
        }

        self.upstream.close().await;
        self.state = SessionState::Idle;
        info!(
            batches = summary.batches,
            samples = summary.samples,
            complete = summary.complete,
            "Retrieval finished"
        );
        Ok(summary)
    }

    /// End the session and remove the buffer of every selected channel.
    pub async fn close(&mut self) -> Result<(), StoreError> {
        self.upstream.close().await;
        self.state = SessionState::Idle;
        if let Some(set) = self.current.take() {
            for channel in &set.channels {
                self.store.drop_channel(channel).await?;
            }
            info!(channels = set.channels.len(), "Session closed, buffers removed");
        }
        self.last_start.clear();
        Ok(())
    }
}
