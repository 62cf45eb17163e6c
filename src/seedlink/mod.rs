//! SeedLink client plumbing.
//!
//! SeedLink is a push protocol: after a short command negotiation (`HELLO`,
//! then `STATION`/`SELECT`/`DATA` per station, then `END`) the server streams
//! 520-byte frames, each an `SL` header with a sequence number followed by one
//! 512-byte miniSEED record.
//!
//! - [`protocol`]: commands, session requests and frame classification
//! - [`mseed`]: miniSEED record decoding into [`SampleBatch`](crate::model::SampleBatch)
//! - [`client`]: the TCP transport
//!
//! The [`Upstream`] trait is the seam the supervisor drives, so sessions can be
//! scripted in tests without a socket.

pub mod client;
pub mod mseed;
pub mod protocol;

use std::io;

pub use client::TcpUpstream;
pub use protocol::{Frame, Packet, SessionRequest, StationKey, StationRequest, TimeWindow};

use crate::model::ServerAddress;

/// Errors from the SeedLink transport and record decoding.
#[derive(Debug, thiserror::Error)]
pub enum SeedLinkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("timed out while {0}")]
    Timeout(&'static str),

    #[error("connection closed by server")]
    Closed,

    #[error("not connected")]
    NotConnected,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("server rejected '{command}': {reply}")]
    Rejected { command: String, reply: String },

    #[error("unsupported data encoding {0}")]
    UnsupportedEncoding(u8),

    #[error("invalid miniSEED record: {0}")]
    InvalidRecord(String),
}

/// A connection to an upstream data server.
///
/// Implementations hold at most one session. `negotiate` may be called again
/// on an open connection to replace the selection.
#[allow(async_fn_in_trait)]
pub trait Upstream {
    /// Connect (or reconnect) to `server`.
    async fn open(&mut self, server: &ServerAddress) -> Result<(), SeedLinkError>;

    /// Send the selection for every station in `request` and start streaming.
    ///
    /// Returns how many stations the server accepted.
    async fn negotiate(&mut self, request: &SessionRequest) -> Result<usize, SeedLinkError>;

    /// Block until the next frame arrives.
    async fn collect(&mut self) -> Result<Frame, SeedLinkError>;

    /// End the session. Never fails; errors while saying goodbye are ignored.
    async fn close(&mut self);
}
