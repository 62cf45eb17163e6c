//! Bounded per-channel sample store backed by one file per channel.
//!
//! Each channel's buffer holds at most `capacity` samples. When an append would
//! overflow, the existing history is halved (keeping the newest ⌈len/2⌉
//! samples) rather than slid by exactly the overflow, so trims happen rarely
//! and the file is rewritten with a large batch of headroom.
//!
//! # File format
//!
//! Little endian, columnar:
//!
//! | field | type |
//! |---|---|
//! | magic | `b"SWRB"` |
//! | version | `u16` |
//! | count | `u32` |
//! | timestamps | `count × i64` (µs since epoch) |
//! | values | `count × f64` |

use std::collections::HashMap;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::DateTime;
use tracing::debug;

use crate::model::{ChannelId, Sample, SampleBatch};
use crate::persist::{self, StoreError};

const MAGIC: [u8; 4] = *b"SWRB";
const VERSION: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 4;

/// Result of a single append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Buffer length after the append.
    pub len: usize,
    /// Whether history was halved to make room.
    pub trimmed: bool,
}

/// File-backed ring buffers, one per channel.
///
/// Cloning is cheap; clones share the per-channel locks so there is a single
/// writer per channel across the whole process.
#[derive(Clone)]
pub struct RingBufferStore {
    dir: PathBuf,
    capacity: usize,
    locks: Arc<Mutex<HashMap<ChannelId, Arc<tokio::sync::Mutex<()>>>>>,
}

impl RingBufferStore {
    pub fn new(dir: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            dir: dir.into(),
            capacity,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the file holding `channel`.
    pub fn path_for(&self, channel: &ChannelId) -> PathBuf {
        self.dir.join(channel.file_name())
    }

    fn lock_for(&self, channel: &ChannelId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks.entry(channel.clone()).or_default().clone()
    }

    /// Load the channel's buffer, make room, append `batch` and persist.
    pub async fn append(
        &self,
        channel: &ChannelId,
        batch: &SampleBatch,
    ) -> Result<AppendOutcome, StoreError> {
        let lock = self.lock_for(channel);
        let _guard = lock.lock().await;

        let path = self.path_for(channel);
        let history = match persist::read_optional(&path).await? {
            Some(bytes) => decode(&bytes).map_err(|reason| StoreError::CorruptBuffer {
                path: path.clone(),
                reason,
            })?,
            None => Vec::new(),
        };

        let pre_len = history.len();
        let (buffer, trimmed) = make_room(history, &batch.samples(), self.capacity);
        persist::write_atomic(&path, &encode(&buffer)).await?;

        debug!(
            channel = %channel,
            pre_len,
            len = buffer.len(),
            trimmed,
            "Ring buffer appended"
        );

        Ok(AppendOutcome {
            len: buffer.len(),
            trimmed,
        })
    }

    /// Read the channel's samples in order, or `None` if it has no buffer.
    pub async fn read(&self, channel: &ChannelId) -> Result<Option<Vec<Sample>>, StoreError> {
        let path = self.path_for(channel);
        match persist::read_optional(&path).await? {
            Some(bytes) => decode(&bytes)
                .map(Some)
                .map_err(|reason| StoreError::CorruptBuffer { path, reason }),
            None => Ok(None),
        }
    }

    /// Delete the channel's buffer. Returns whether a file was removed.
    pub async fn drop_channel(&self, channel: &ChannelId) -> Result<bool, StoreError> {
        let lock = self.lock_for(channel);
        let removed = {
            let _guard = lock.lock().await;
            persist::remove_optional(&self.path_for(channel)).await?
        };

        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(channel);

        Ok(removed)
    }

    /// Channels that currently have a buffer file, sorted.
    pub async fn channels(&self) -> Result<Vec<ChannelId>, StoreError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(&self.dir, e)),
        };

        let mut channels = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.dir, e))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            // Other files (the subscription resource, temp files) do not parse.
            if let Some(stem) = name.strip_suffix(".data") {
                if let Ok(channel) = stem.parse::<ChannelId>() {
                    channels.push(channel);
                }
            }
        }

        channels.sort();
        Ok(channels)
    }
}

/// Halve `history` until `incoming` fits within `capacity`, then append it.
///
/// A single halving keeps ⌈len/2⌉ samples. Batches larger than the whole
/// capacity keep only their newest `capacity` samples.
fn make_room(mut history: Vec<Sample>, incoming: &[Sample], capacity: usize) -> (Vec<Sample>, bool) {
    let incoming = &incoming[incoming.len().saturating_sub(capacity)..];
    let mut trimmed = false;

    while !history.is_empty() && history.len() + incoming.len() > capacity {
        let keep = if history.len() == 1 {
            0
        } else {
            history.len().div_ceil(2)
        };
        history.drain(..history.len() - keep);
        trimmed = true;
    }

    history.extend_from_slice(incoming);
    (history, trimmed)
}

fn encode(samples: &[Sample]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + samples.len() * 16);
    out.extend_from_slice(&MAGIC);
    // Writes into a Vec cannot fail.
    let _ = out.write_u16::<LittleEndian>(VERSION);
    let _ = out.write_u32::<LittleEndian>(samples.len() as u32);
    for sample in samples {
        let _ = out.write_i64::<LittleEndian>(sample.timestamp.timestamp_micros());
    }
    for sample in samples {
        let _ = out.write_f64::<LittleEndian>(sample.value);
    }
    out
}

fn decode(bytes: &[u8]) -> Result<Vec<Sample>, String> {
    let mut cursor = Cursor::new(bytes);

    let mut magic = [0u8; 4];
    cursor
        .read_exact(&mut magic)
        .map_err(|_| "truncated header".to_string())?;
    if magic != MAGIC {
        return Err("bad magic".to_string());
    }

    let version = cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| "truncated header".to_string())?;
    if version != VERSION {
        return Err(format!("unsupported version {version}"));
    }

    let count = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| "truncated header".to_string())? as usize;
    if bytes.len() != HEADER_LEN + count * 16 {
        return Err(format!(
            "expected {} bytes for {count} samples, found {}",
            HEADER_LEN + count * 16,
            bytes.len()
        ));
    }

    let mut timestamps = Vec::with_capacity(count);
    for _ in 0..count {
        let micros = cursor
            .read_i64::<LittleEndian>()
            .map_err(|e| e.to_string())?;
        let ts = DateTime::from_timestamp_micros(micros)
            .ok_or_else(|| format!("timestamp out of range: {micros}"))?;
        timestamps.push(ts);
    }

    let mut samples = Vec::with_capacity(count);
    for timestamp in timestamps {
        let value = cursor
            .read_f64::<LittleEndian>()
            .map_err(|e| e.to_string())?;
        samples.push(Sample { timestamp, value });
    }

    Ok(samples)
}
