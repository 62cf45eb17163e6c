//! Seiswatch - live seismic channel ingestion and station health alarms.
//!
//! # Overview
//!
//! Seiswatch keeps a SeedLink session open to an upstream data server and
//! writes every subscribed channel into a bounded, file-backed ring buffer
//! that a dashboard plots. The channel list is published by the dashboard
//! through a subscription resource and can change at any time; the session is
//! reselected without a reconnect when the server stays the same.
//!
//! Alongside, a periodic cycle reads station health snapshots, classifies
//! metrics against fixed bands, compares device status bits with per-station
//! baselines, and keeps a deduplicated alarm ledger that operators clear
//! through a three-step completion.
//!
//! # Modules
//!
//! - [`model`]: Channel ids, samples, severities, alarms
//! - [`persist`]: Atomic file writes shared by the stores
//! - [`ring_buffer`]: Per-channel bounded sample buffers
//! - [`subscription`]: Reads the subscription resource
//! - [`seedlink`]: Protocol client and miniSEED decoding
//! - [`signal`]: Resampling and mean removal
//! - [`supervisor`]: The ingestion session lifecycle
//! - [`health`]: Station health snapshots
//! - [`alarm`]: Alarm engine, ledger and completion workflow
//! - [`config`]: Command line, environment and station baselines
//! - [`api`]: HTTP handlers for the dashboard
//! - [`tasks`]: Background tasks watched by the daemon

pub mod alarm;
pub mod api;
pub mod config;
pub mod health;
pub mod model;
pub mod persist;
pub mod ring_buffer;
pub mod seedlink;
pub mod signal;
pub mod subscription;
pub mod supervisor;
pub mod tasks;
