//! Data model for seiswatch.
//!
//! Two families of types live here:
//!
//! - **Ingestion**: [`ChannelId`], [`ServerAddress`], [`SubscriptionSet`],
//!   [`SampleBatch`] and [`Sample`], which flow from the subscription resource
//!   through the SeedLink session into the ring buffers.
//! - **Alarms**: [`Severity`], [`HealthMetric`], [`DeviceStatusVector`] and
//!   [`Alarm`], which flow from the health-state source into the alarm ledger.
//!
//! Everything that crosses a process boundary (ledger, ring buffer listing,
//! subscription resource) uses the string forms defined here.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Port used when a server spec does not carry one.
pub const DEFAULT_SEEDLINK_PORT: u16 = 18000;

/// Number of bits in a station's device status word.
pub const STATUS_WIDTH: usize = 16;

/// Fault condition for each index of a [`DeviceStatusVector`], in bit order.
pub const FAULT_NAMES: [&str; STATUS_WIDTH] = [
    "gps_lock",
    "clock_sync",
    "mass_position",
    "main_power",
    "charger",
    "backup_battery",
    "disk_full",
    "disk_error",
    "network_link",
    "digitizer",
    "sensor_calibration",
    "enclosure_door",
    "enclosure_temperature",
    "enclosure_humidity",
    "recording",
    "telemetry",
];

/// Errors raised while parsing the textual forms of model types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModelError {
    #[error("invalid channel id '{0}'")]
    InvalidChannelId(String),

    #[error("invalid server address '{0}'")]
    InvalidServer(String),

    #[error("invalid datetime token '{0}'")]
    InvalidDatetime(String),

    #[error("unknown alarm state '{0}'")]
    InvalidAlarmState(String),
}

// ============================================================================
// Ingestion types
// ============================================================================

/// Identifies one data stream: network, station, location and channel code.
///
/// The canonical string form is dot-joined, with an empty location collapsing
/// to two consecutive dots (`NET.STA..CHA`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ChannelId {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
}

impl ChannelId {
    pub fn new(network: &str, station: &str, location: &str, channel: &str) -> Self {
        Self {
            network: network.to_string(),
            station: station.to_string(),
            location: location.to_string(),
            channel: channel.to_string(),
        }
    }

    /// Name of the ring buffer file holding this channel.
    pub fn file_name(&self) -> String {
        format!("{self}.data")
    }

    /// The `LLCCC` selector sent in a SeedLink `SELECT` command.
    pub fn selector(&self) -> String {
        format!("{}{}", self.location, self.channel)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.network, self.station, self.location, self.channel
        )
    }
}

impl FromStr for ChannelId {
    type Err = ModelError;

    /// Accepts `NET.STA.LOC.CHA`, `NET.STA..CHA` and the short `NET.STA.CHA`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let parts: Vec<&str> = trimmed.split('.').collect();
        let (network, station, location, channel) = match parts.as_slice() {
            [net, sta, cha] => (*net, *sta, "", *cha),
            [net, sta, loc, cha] => (*net, *sta, *loc, *cha),
            _ => return Err(ModelError::InvalidChannelId(s.to_string())),
        };

        let valid = |part: &str, allow_empty: bool| {
            (allow_empty || !part.is_empty()) && part.chars().all(|c| c.is_ascii_alphanumeric())
        };
        if !valid(network, false)
            || !valid(station, false)
            || !valid(location, true)
            || !valid(channel, false)
        {
            return Err(ModelError::InvalidChannelId(s.to_string()));
        }

        Ok(Self::new(network, station, location, channel))
    }
}

impl TryFrom<String> for ChannelId {
    type Error = ModelError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ChannelId> for String {
    fn from(id: ChannelId) -> Self {
        id.to_string()
    }
}

/// Address of an upstream SeedLink server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    /// Parse a `host[:port]` spec, falling back to `default_port`.
    pub fn parse(spec: &str, default_port: u16) -> Result<Self, ModelError> {
        let spec = spec.trim();
        let (host, port) = match spec.split_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| ModelError::InvalidServer(spec.to_string()))?;
                (host, port)
            }
            None => (spec, default_port),
        };

        if host.is_empty() || host.chars().any(char::is_whitespace) || port == 0 {
            return Err(ModelError::InvalidServer(spec.to_string()));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// The desired upstream server and ordered channel list, as published by the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionSet {
    pub server: ServerAddress,
    pub channels: Vec<ChannelId>,
}

/// Channels added and removed between two subscription sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionDiff {
    pub added: Vec<ChannelId>,
    pub removed: Vec<ChannelId>,
}

impl SubscriptionDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

impl SubscriptionSet {
    pub fn new(server: ServerAddress, channels: Vec<ChannelId>) -> Self {
        Self { server, channels }
    }

    /// Compute what changes when `next` replaces `previous`.
    ///
    /// With no previous set every channel of `next` counts as added.
    pub fn diff(previous: Option<&SubscriptionSet>, next: &SubscriptionSet) -> SubscriptionDiff {
        let old: &[ChannelId] = previous.map(|p| p.channels.as_slice()).unwrap_or(&[]);

        SubscriptionDiff {
            added: next
                .channels
                .iter()
                .filter(|c| !old.contains(c))
                .cloned()
                .collect(),
            removed: old
                .iter()
                .filter(|c| !next.channels.contains(c))
                .cloned()
                .collect(),
        }
    }

    /// Render the set in the subscription resource format.
    pub fn to_resource(&self) -> String {
        let mut out = format!("{}\n", self.server);
        for channel in &self.channels {
            out.push_str(&channel.to_string());
            out.push('\n');
        }
        out
    }
}

/// One stored sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Evenly spaced samples for one channel, produced by one ingestion event.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleBatch {
    pub channel: ChannelId,
    pub start: DateTime<Utc>,
    /// Samples per second.
    pub sampling_rate: f64,
    pub values: Vec<f64>,
}

impl SampleBatch {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Timestamp of the sample at `index`.
    pub fn time_of(&self, index: usize) -> DateTime<Utc> {
        let offset_ns = (index as f64 * 1e9 / self.sampling_rate).round() as i64;
        self.start + Duration::nanoseconds(offset_ns)
    }

    /// Expand into timestamped samples.
    pub fn samples(&self) -> Vec<Sample> {
        self.values
            .iter()
            .enumerate()
            .map(|(i, &value)| Sample {
                timestamp: self.time_of(i),
                value,
            })
            .collect()
    }
}

// ============================================================================
// Alarm types
// ============================================================================

/// Classification of a metric or fault.
///
/// The integer form (`-1..=2`) is what the ledger and health documents carry
/// in their `problem` attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub enum Severity {
    Unknown,
    Ok,
    Warning,
    Critical,
}

impl Severity {
    pub fn problem(self) -> i8 {
        match self {
            Severity::Unknown => -1,
            Severity::Ok => 0,
            Severity::Warning => 1,
            Severity::Critical => 2,
        }
    }

    /// Whether this severity produces an alarm.
    pub fn is_alarming(self) -> bool {
        matches!(self, Severity::Warning | Severity::Critical)
    }

    pub fn label(self) -> &'static str {
        match self {
            Severity::Unknown => "Unknown",
            Severity::Ok => "OK",
            Severity::Warning => "Warning",
            Severity::Critical => "Critical",
        }
    }
}

impl TryFrom<i8> for Severity {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Severity::Unknown),
            0 => Ok(Severity::Ok),
            1 => Ok(Severity::Warning),
            2 => Ok(Severity::Critical),
            other => Err(format!("invalid severity {other}")),
        }
    }
}

impl From<Severity> for i8 {
    fn from(severity: Severity) -> Self {
        severity.problem()
    }
}

/// One health reading for a station.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthMetric {
    pub station: String,
    pub name: String,
    /// Raw value as stored by the source; `None` when the source had no value.
    pub value: Option<String>,
    /// When the source recorded this reading.
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
}

/// Fixed-width device status bits for one station.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceStatusVector {
    bits: u16,
}

impl DeviceStatusVector {
    /// Decode an integer status code. Bits above [`STATUS_WIDTH`] are ignored.
    pub fn from_code(code: u32) -> Self {
        Self {
            bits: (code & 0xFFFF) as u16,
        }
    }

    pub fn code(&self) -> u32 {
        u32::from(self.bits)
    }

    pub fn bit(&self, index: usize) -> bool {
        index < STATUS_WIDTH && (self.bits >> index) & 1 == 1
    }

    /// Indices where `self` and `baseline` disagree, in ascending order.
    pub fn differing_indices(&self, baseline: &DeviceStatusVector) -> Vec<usize> {
        let diff = self.bits ^ baseline.bits;
        (0..STATUS_WIDTH).filter(|i| (diff >> i) & 1 == 1).collect()
    }
}

/// Which ledger section an alarm lives in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlarmState {
    #[default]
    Ongoing,
    Completed,
}

impl FromStr for AlarmState {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ongoing" => Ok(AlarmState::Ongoing),
            "completed" => Ok(AlarmState::Completed),
            other => Err(ModelError::InvalidAlarmState(other.to_string())),
        }
    }
}

/// An operator-facing alarm record.
///
/// Field names on the wire follow the ledger document: `state` carries the
/// metric or fault name and `problem` the severity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub id: String,
    pub station: String,
    #[serde(rename = "state")]
    pub name: String,
    pub detail: String,
    #[serde(with = "datetime_token")]
    pub datetime: DateTime<Utc>,
    #[serde(rename = "problem")]
    pub severity: Severity,
    #[serde(skip)]
    pub status: AlarmState,
}

/// Id of an alarm raised by a metric threshold.
///
/// The metric name is not part of the id. Metrics of one station read at the
/// same time with the same severity share one ledger record, and only the
/// first of them is shown; this keeps ids compatible with existing ledgers.
pub fn threshold_alarm_id(station: &str, trigger: DateTime<Utc>, severity: Severity) -> String {
    format!(
        "{}.{}.{}",
        station,
        datetime_token::format(trigger),
        severity.problem()
    )
}

/// Id of an alarm raised by a device status bit. Carries no timestamp, so a
/// recurring fault maps onto the same record.
pub fn bitfield_alarm_id(station: &str, fault: &str, severity: Severity) -> String {
    format!("{}.{}.{}", station, fault, severity.problem())
}

/// The fixed-width `D{year}{month}{day}T{hour}{minute}{second}` token.
pub mod datetime_token {
    use chrono::{DateTime, NaiveDate, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    use super::ModelError;

    pub const LEN: usize = 16;

    pub fn format(dt: DateTime<Utc>) -> String {
        dt.format("D%Y%m%dT%H%M%S").to_string()
    }

    /// Parse by position; the token carries no separators besides `D` and `T`.
    pub fn parse(token: &str) -> Result<DateTime<Utc>, ModelError> {
        let err = || ModelError::InvalidDatetime(token.to_string());
        if token.len() != LEN || !token.is_ascii() {
            return Err(err());
        }
        if &token[0..1] != "D" || &token[9..10] != "T" {
            return Err(err());
        }

        let field = |range: std::ops::Range<usize>| token[range].parse::<u32>().map_err(|_| err());
        let year = token[1..5].parse::<i32>().map_err(|_| err())?;
        let month = field(5..7)?;
        let day = field(7..9)?;
        let hour = field(10..12)?;
        let minute = field(12..14)?;
        let second = field(14..16)?;

        NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|d| d.and_hms_opt(hour, minute, second))
            .map(|naive| naive.and_utc())
            .ok_or_else(err)
    }

    pub fn serialize<S: Serializer>(dt: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format(*dt))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).map_err(serde::de::Error::custom)
    }
}
