//! End-to-end ingestion: subscription resource in, ring buffer out.
//!
//! A scripted upstream stands in for the SeedLink server and hands out one
//! INT32 miniSEED record.

use std::collections::VecDeque;
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder};
use chrono::{DateTime, Datelike, Timelike, Utc};

use seiswatch::model::{ChannelId, ServerAddress};
use seiswatch::ring_buffer::RingBufferStore;
use seiswatch::seedlink::mseed::RECORD_LEN;
use seiswatch::seedlink::{Frame, Packet, SeedLinkError, SessionRequest, Upstream};
use seiswatch::subscription::SubscriptionWatcher;
use seiswatch::supervisor::{ConnectionSupervisor, SessionState, SupervisorSettings};

#[derive(Default)]
struct ScriptedUpstream {
    frames: VecDeque<Frame>,
    negotiated: Vec<SessionRequest>,
}

impl Upstream for ScriptedUpstream {
    async fn open(&mut self, _server: &ServerAddress) -> Result<(), SeedLinkError> {
        Ok(())
    }

    async fn negotiate(&mut self, request: &SessionRequest) -> Result<usize, SeedLinkError> {
        self.negotiated.push(request.clone());
        Ok(request.stations.len())
    }

    async fn collect(&mut self) -> Result<Frame, SeedLinkError> {
        match self.frames.pop_front() {
            Some(frame) => Ok(frame),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self) {}
}

/// A big-endian INT32 record at 25 Hz.
fn int32_record(channel: &ChannelId, start: DateTime<Utc>, values: &[i32]) -> Vec<u8> {
    let mut rec = vec![0u8; RECORD_LEN];
    rec[0..8].copy_from_slice(b"000001D ");
    let fields = [
        (8..13, channel.station.as_str()),
        (13..15, channel.location.as_str()),
        (15..18, channel.channel.as_str()),
        (18..20, channel.network.as_str()),
    ];
    for (range, text) in fields {
        let mut padded = text.as_bytes().to_vec();
        padded.resize(range.len(), b' ');
        rec[range].copy_from_slice(&padded);
    }

    BigEndian::write_u16(&mut rec[20..22], start.year() as u16);
    BigEndian::write_u16(&mut rec[22..24], start.ordinal() as u16);
    rec[24] = start.hour() as u8;
    rec[25] = start.minute() as u8;
    rec[26] = start.second() as u8;
    BigEndian::write_u16(&mut rec[28..30], (start.timestamp_subsec_micros() / 100) as u16);
    BigEndian::write_u16(&mut rec[30..32], values.len() as u16);
    BigEndian::write_i16(&mut rec[32..34], 25);
    BigEndian::write_i16(&mut rec[34..36], 1);
    rec[39] = 1;
    BigEndian::write_u16(&mut rec[44..46], 64);
    BigEndian::write_u16(&mut rec[46..48], 48);

    // Blockette 1000: INT32, big endian, 512-byte record.
    BigEndian::write_u16(&mut rec[48..50], 1000);
    rec[52] = 3;
    rec[53] = 1;
    rec[54] = 9;

    for (i, v) in values.iter().enumerate() {
        BigEndian::write_i32(&mut rec[64 + i * 4..68 + i * 4], *v);
    }
    rec
}

#[tokio::test]
async fn test_subscribe_ingest_unsubscribe() {
    let dir = tempfile::tempdir().unwrap();
    let resource = dir.path().join("streams.data");
    let channel = ChannelId::new("NET", "STA1", "", "CHA");

    std::fs::write(&resource, "seis.example.org:18000\nNET.STA1..CHA\n").unwrap();

    let values: Vec<i32> = (0..40).map(|i| 1000 + i * 2).collect();
    let mut upstream = ScriptedUpstream::default();
    upstream.frames.push_back(Frame::Data(Packet {
        sequence: Some(1),
        record: int32_record(&channel, Utc::now(), &values),
    }));

    let settings = SupervisorSettings {
        target_rate: 25.0,
        backoff: Duration::from_millis(1),
        idle_timeout: Duration::from_millis(50),
        poll_interval: Duration::ZERO,
        ..SupervisorSettings::default()
    };
    let store = RingBufferStore::new(dir.path(), 25 * 180);
    let mut supervisor = ConnectionSupervisor::new(upstream, store.clone(), settings);
    let mut watcher = SubscriptionWatcher::new(&resource, 18000);

    // Subscription applied and the record stored.
    supervisor.tick(&mut watcher).await.unwrap();
    assert_eq!(supervisor.state(), SessionState::Streaming);
    let negotiated = &supervisor.upstream().negotiated;
    assert_eq!(negotiated.len(), 1);
    assert_eq!(negotiated[0].stations.len(), 1);
    assert_eq!(negotiated[0].stations[0].selectors, vec!["CHA"]);

    let samples = store.read(&channel).await.unwrap().unwrap();
    assert_eq!(samples.len(), 40);
    let mean = samples.iter().map(|s| s.value).sum::<f64>() / samples.len() as f64;
    assert!(mean.abs() < 1e-9);
    assert!(store.path_for(&channel).exists());

    // Channel removed from the resource.
    std::fs::write(&resource, "seis.example.org:18000\n").unwrap();
    supervisor.tick(&mut watcher).await.unwrap();

    assert!(!store.path_for(&channel).exists());
    assert!(supervisor.current().unwrap().channels.is_empty());
    assert_eq!(supervisor.state(), SessionState::Idle);
}
