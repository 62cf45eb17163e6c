//! SeedLink commands and frame classification.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use super::SeedLinkError;
use super::mseed::RECORD_LEN;
use crate::model::ChannelId;

/// Length of the `SL` + sequence header preceding each record.
pub const FRAME_HEADER_LEN: usize = 8;

/// One unit read from the data stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A data record.
    Data(Packet),
    /// An in-stream `SLINFO` record; not used.
    Info,
    /// The server ended the stream (`END`).
    Terminate,
    /// The server reported an error (`ERROR`).
    Error(String),
}

/// A raw miniSEED record and the sequence number the server assigned to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub sequence: Option<u32>,
    pub record: Vec<u8>,
}

/// Bounded `[begin, end)` range for a retrieval session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub begin: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// `(network, station)` pair, the unit SeedLink selects by.
pub type StationKey = (String, String);

/// Selection for one station.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StationRequest {
    pub network: String,
    pub station: String,
    /// `LLCCC` selectors, one per channel.
    pub selectors: Vec<String>,
    /// Sequence number to resume after, if one was seen before.
    pub resume_after: Option<u32>,
}

/// Everything sent during one negotiation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRequest {
    pub stations: Vec<StationRequest>,
    pub window: Option<TimeWindow>,
}

impl SessionRequest {
    /// Group `channels` by station, keeping first-seen order.
    pub fn from_channels(
        channels: &[ChannelId],
        last_sequences: &HashMap<StationKey, u32>,
        window: Option<TimeWindow>,
    ) -> Self {
        let mut stations: Vec<StationRequest> = Vec::new();
        for channel in channels {
            let selector = channel.selector();
            match stations
                .iter_mut()
                .find(|s| s.network == channel.network && s.station == channel.station)
            {
                Some(existing) => {
                    if !existing.selectors.contains(&selector) {
                        existing.selectors.push(selector);
                    }
                }
                None => {
                    let key = (channel.network.clone(), channel.station.clone());
                    stations.push(StationRequest {
                        network: channel.network.clone(),
                        station: channel.station.clone(),
                        selectors: vec![selector],
                        resume_after: last_sequences.get(&key).copied(),
                    });
                }
            }
        }

        Self { stations, window }
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    /// The command lines for one station, without the closing `END`.
    pub fn commands_for(&self, station: &StationRequest) -> Vec<String> {
        let mut lines = vec![format!("STATION {} {}", station.station, station.network)];
        lines.extend(station.selectors.iter().map(|s| format!("SELECT {s}")));

        let resume = station
            .resume_after
            .map(|seq| format!("{:06X}", (seq + 1) & 0xFF_FFFF));
        // A time window always restarts from its beginning; records already
        // seen are filtered out by the supervisor.
        let data = match (&self.window, resume) {
            (Some(window), _) => {
                format!("TIME {} {}", time_arg(window.begin), time_arg(window.end))
            }
            (None, Some(seq)) => format!("DATA {seq}"),
            (None, None) => "DATA".to_string(),
        };
        lines.push(data);
        lines
    }
}

fn time_arg(dt: DateTime<Utc>) -> String {
    dt.format("%Y,%m,%d,%H,%M,%S").to_string()
}

/// Read and classify the next frame.
pub async fn read_frame<R>(reader: &mut R) -> Result<Frame, SeedLinkError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = [0u8; 2];
    read_exact(reader, &mut head).await?;

    match &head {
        b"SL" => {
            let mut rest = [0u8; FRAME_HEADER_LEN - 2];
            read_exact(reader, &mut rest).await?;
            let mut record = vec![0u8; RECORD_LEN];
            read_exact(reader, &mut record).await?;

            if &rest[..4] == b"INFO" {
                return Ok(Frame::Info);
            }
            let sequence = std::str::from_utf8(&rest)
                .ok()
                .and_then(|s| u32::from_str_radix(s, 16).ok());
            Ok(Frame::Data(Packet { sequence, record }))
        }
        b"EN" => {
            let mut d = [0u8; 1];
            read_exact(reader, &mut d).await?;
            if &d == b"D" {
                Ok(Frame::Terminate)
            } else {
                Err(SeedLinkError::Protocol("truncated END".to_string()))
            }
        }
        b"ER" => {
            let mut line = String::from("ER");
            reader.read_line(&mut line).await?;
            Ok(Frame::Error(line.trim_end().to_string()))
        }
        other => Err(SeedLinkError::Protocol(format!(
            "unexpected frame header {:?}",
            String::from_utf8_lossy(other)
        ))),
    }
}

async fn read_exact<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), SeedLinkError>
where
    R: AsyncBufRead + Unpin,
{
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(SeedLinkError::Closed),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn channels(ids: &[&str]) -> Vec<ChannelId> {
        ids.iter().map(|s| s.parse().unwrap()).collect()
    }

    #[test]
    fn test_groups_channels_by_station() {
        let request = SessionRequest::from_channels(
            &channels(&["G.SSB.00.BHZ", "G.SSB.00.BHN", "NET.STA1..CHA"]),
            &HashMap::new(),
            None,
        );

        assert_eq!(request.stations.len(), 2);
        assert_eq!(request.stations[0].selectors, vec!["00BHZ", "00BHN"]);
        assert_eq!(
            request.commands_for(&request.stations[1]),
            vec!["STATION STA1 NET", "SELECT CHA", "DATA"]
        );
    }

    #[test]
    fn test_resume_and_time_window_commands() {
        let mut seqs = HashMap::new();
        seqs.insert(("NET".to_string(), "STA1".to_string()), 0x1A);
        let window = TimeWindow {
            begin: Utc.with_ymd_and_hms(2021, 11, 19, 4, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2021, 11, 19, 4, 0, 30).unwrap(),
        };

        let live = SessionRequest::from_channels(&channels(&["NET.STA1..CHA"]), &seqs, None);
        assert_eq!(live.commands_for(&live.stations[0])[2], "DATA 00001B");

        let fresh =
            SessionRequest::from_channels(&channels(&["NET.STA1..CHA"]), &seqs, Some(window));
        assert_eq!(
            fresh.commands_for(&fresh.stations[0])[2],
            "TIME 2021,11,19,04,00,00 2021,11,19,04,00,30"
        );
    }

    #[tokio::test]
    async fn test_read_frame_classifies() {
        let mut bytes = b"SL00002A".to_vec();
        bytes.extend(vec![0u8; RECORD_LEN]);
        bytes.extend(b"SLINFO  ");
        bytes.extend(vec![0u8; RECORD_LEN]);
        bytes.extend(b"ERROR\r\nEND");

        let mut reader = tokio::io::BufReader::new(bytes.as_slice());

        match read_frame(&mut reader).await.unwrap() {
            Frame::Data(packet) => {
                assert_eq!(packet.sequence, Some(0x2A));
                assert_eq!(packet.record.len(), RECORD_LEN);
            }
            other => panic!("expected data, got {other:?}"),
        }
        assert_eq!(read_frame(&mut reader).await.unwrap(), Frame::Info);
        assert_eq!(
            read_frame(&mut reader).await.unwrap(),
            Frame::Error("ERROR".to_string())
        );
        assert_eq!(read_frame(&mut reader).await.unwrap(), Frame::Terminate);
        assert!(matches!(
            read_frame(&mut reader).await,
            Err(SeedLinkError::Closed)
        ));
    }
}
