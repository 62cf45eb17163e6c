//! Runtime configuration.
//!
//! Command-line flags (with environment fallbacks) select the upstream server,
//! directories and optional subsystems. Tunables that rarely change are read
//! from the environment only. Per-station status baselines live in a YAML file:
//!
//! ```yaml
//! baselines:
//!   SB1M: 0
//!   SB2M: 4
//! ```

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, NaiveDateTime, Utc};
use clap::Parser;
use serde::Deserialize;
use tracing::{info, warn};

use crate::model::{DEFAULT_SEEDLINK_PORT, DeviceStatusVector, ServerAddress};
use crate::seedlink::TimeWindow;

/// Default resampling target in Hz.
pub const DEFAULT_SAMPLING_RATE: f64 = 25.0;

/// Default ring buffer span in seconds.
pub const DEFAULT_QUEUE_SECONDS: u64 = 180;

pub const DEFAULT_ALARM_PERIOD_SECS: u64 = 30;

pub const DEFAULT_API_PORT: u16 = 8050;

/// Name of the subscription resource inside the buffer directory.
pub const SUBSCRIPTION_FILE: &str = "streams.data";

#[derive(Debug, Parser)]
#[command(name = "seiswatch")]
#[command(about = "Live SeedLink ingestion into ring buffers, with station health alarms.")]
pub struct Cli {
    /// Upstream SeedLink server, `host[:port]`.
    #[arg(long, value_name = "HOST[:PORT]")]
    pub server: String,

    /// Port used when the server spec has none.
    #[arg(long, value_name = "PORT", env = "SEISWATCH_SEEDLINK_PORT", default_value_t = DEFAULT_SEEDLINK_PORT)]
    pub port: u16,

    #[arg(long, value_name = "DIR", env = "SEISWATCH_BUFFER_DIR", default_value = "data")]
    pub buffer_dir: PathBuf,

    #[arg(long, value_name = "DIR", env = "SEISWATCH_LOG_DIR", default_value = "log/server")]
    pub log_dir: PathBuf,

    #[arg(long, value_name = "PATH", env = "SEISWATCH_STATIONS", default_value = "stations.yaml")]
    pub stations: PathBuf,

    /// SQLite URL of the station health database; alarms are off without it.
    #[arg(long, value_name = "URL", env = "SEISWATCH_HEALTH_DB")]
    pub health_db: Option<String>,

    /// Port of the HTTP surface for the UI; 0 disables it.
    #[arg(long, value_name = "PORT", env = "SEISWATCH_API_PORT", default_value_t = DEFAULT_API_PORT)]
    pub api_port: u16,

    /// Start of a one-off retrieval (UTC), instead of live streaming.
    #[arg(long, value_name = "TIME", value_parser = parse_utc, requires = "end")]
    pub begin: Option<DateTime<Utc>>,

    #[arg(long, value_name = "TIME", value_parser = parse_utc, requires = "begin")]
    pub end: Option<DateTime<Utc>>,
}

/// Accepts RFC 3339 or a bare `YYYY-MM-DDTHH:MM:SS` taken as UTC.
fn parse_utc(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("invalid time '{s}': {e}"))
}

/// Fully resolved settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerAddress,
    pub default_port: u16,
    pub buffer_dir: PathBuf,
    pub log_dir: PathBuf,
    pub stations_file: PathBuf,
    pub health_db: Option<String>,
    pub api_port: u16,
    pub sampling_rate: f64,
    pub queue_seconds: u64,
    pub alarm_period: Duration,
    pub window: Option<TimeWindow>,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    /// Resolve the command line and environment.
    ///
    /// # Errors
    ///
    /// Fails on a malformed server spec or an empty retrieval window.
    pub fn from_cli(cli: Cli) -> anyhow::Result<Self> {
        let server = ServerAddress::parse(&cli.server, cli.port)
            .with_context(|| format!("invalid --server '{}'", cli.server))?;

        let window = match (cli.begin, cli.end) {
            (Some(begin), Some(end)) if begin < end => Some(TimeWindow { begin, end }),
            (Some(begin), Some(end)) => anyhow::bail!("retrieval window is empty: {begin} >= {end}"),
            _ => None,
        };

        let sampling_rate: f64 = env_or("SEISWATCH_SAMPLING_RATE", DEFAULT_SAMPLING_RATE);
        let sampling_rate = if sampling_rate > 0.0 {
            sampling_rate
        } else {
            warn!(sampling_rate, "Ignoring non-positive sampling rate");
            DEFAULT_SAMPLING_RATE
        };

        Ok(Self {
            server,
            default_port: cli.port,
            buffer_dir: cli.buffer_dir,
            log_dir: cli.log_dir,
            stations_file: cli.stations,
            health_db: cli.health_db,
            api_port: cli.api_port,
            sampling_rate,
            queue_seconds: env_or("SEISWATCH_QUEUE_SECONDS", DEFAULT_QUEUE_SECONDS),
            alarm_period: Duration::from_secs(
                env_or("SEISWATCH_ALARM_PERIOD_SECS", DEFAULT_ALARM_PERIOD_SECS).max(1),
            ),
            window,
        })
    }

    /// Ring buffer capacity in samples.
    pub fn capacity(&self) -> usize {
        ((self.sampling_rate * self.queue_seconds as f64).round() as usize).max(1)
    }

    pub fn subscription_path(&self) -> PathBuf {
        self.buffer_dir.join(SUBSCRIPTION_FILE)
    }
}

#[derive(Debug, Default, Deserialize)]
struct StationsFile {
    #[serde(default)]
    baselines: HashMap<String, u32>,
}

/// Load per-station status baselines. A missing file yields none.
pub fn load_baselines(path: &Path) -> anyhow::Result<HashMap<String, DeviceStatusVector>> {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "No stations file, status alarms disabled");
            return Ok(HashMap::new());
        }
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };

    let file: StationsFile = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing {}", path.display()))?;
    info!(path = %path.display(), stations = file.baselines.len(), "Station baselines loaded");

    Ok(file
        .baselines
        .into_iter()
        .map(|(station, code)| (station, DeviceStatusVector::from_code(code)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cli_defaults() {
        let cli = Cli::try_parse_from(["seiswatch", "--server", "seis.example.org"]).unwrap();
        let settings = Settings::from_cli(cli).unwrap();

        assert_eq!(settings.server.port, settings.default_port);
        assert_eq!(settings.subscription_path(), PathBuf::from("data/streams.data"));
        assert!(settings.window.is_none());
        assert!(settings.capacity() > 0);
    }

    #[test]
    fn test_malformed_server_rejected() {
        let cli = Cli::try_parse_from(["seiswatch", "--server", "host:notaport"]).unwrap();
        assert!(Settings::from_cli(cli).is_err());
    }

    #[test]
    fn test_retrieval_window() {
        let cli = Cli::try_parse_from([
            "seiswatch",
            "--server",
            "seis.example.org:18000",
            "--begin",
            "2021-11-19T04:00:00",
            "--end",
            "2021-11-19T04:00:30Z",
        ])
        .unwrap();
        let settings = Settings::from_cli(cli).unwrap();
        let window = settings.window.unwrap();
        assert_eq!(window.begin, Utc.with_ymd_and_hms(2021, 11, 19, 4, 0, 0).unwrap());
        assert_eq!(window.end, Utc.with_ymd_and_hms(2021, 11, 19, 4, 0, 30).unwrap());

        assert!(Cli::try_parse_from(["seiswatch", "--server", "h", "--begin", "2021-11-19T04:00:00"]).is_err());
    }

    #[test]
    fn test_load_baselines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stations.yaml");
        std::fs::write(&path, "baselines:\n  SB1M: 0\n  SB2M: 4\n").unwrap();

        let baselines = load_baselines(&path).unwrap();
        assert_eq!(baselines["SB2M"].code(), 4);
        assert_eq!(baselines["SB1M"].code(), 0);

        assert!(load_baselines(&dir.path().join("absent.yaml")).unwrap().is_empty());
    }
}
