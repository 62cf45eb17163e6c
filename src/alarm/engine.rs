//! Derives alarms from a health snapshot.
//!
//! Two pipelines feed the same alarm shape:
//!
//! - **Thresholds**: each metric is classified by the band table of its name.
//!   Warning and Critical readings raise an alarm whose id carries the
//!   reading's timestamp.
//! - **Status bits**: each station's status vector is compared with its
//!   configured baseline. Every differing bit raises a Critical alarm named
//!   after the fault; the id carries no timestamp, so a persisting fault keeps
//!   refreshing the same record.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::health::HealthSnapshot;
use crate::model::{
    bitfield_alarm_id, threshold_alarm_id, Alarm, AlarmState, DeviceStatusVector, Severity,
    FAULT_NAMES,
};

/// Outer (Critical) and inner (Warning) acceptable ranges for a metric.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Bands {
    critical_below: f64,
    critical_above: f64,
    warning_below: f64,
    warning_above: f64,
}

impl Bands {
    fn classify(&self, value: f64) -> Severity {
        if value < self.critical_below || value > self.critical_above {
            Severity::Critical
        } else if value < self.warning_below || value > self.warning_above {
            Severity::Warning
        } else {
            Severity::Ok
        }
    }
}

const HUMIDITY: Bands = Bands {
    critical_below: 5.0,
    critical_above: 99.0,
    warning_below: 10.0,
    warning_above: 90.0,
};

const BATTERY_VOLTAGE: Bands = Bands {
    critical_below: 11.0,
    critical_above: 17.0,
    warning_below: 12.0,
    warning_above: 14.92,
};

const TEMPERATURE: Bands = Bands {
    critical_below: -20.0,
    critical_above: 60.0,
    warning_below: -10.0,
    warning_above: 50.0,
};

fn bands_for(metric: &str) -> Option<Bands> {
    let normalized = metric.trim().to_ascii_lowercase().replace([' ', '-'], "_");
    match normalized.as_str() {
        "humidity" => Some(HUMIDITY),
        "battery_voltage" | "battery" => Some(BATTERY_VOLTAGE),
        "temperature" => Some(TEMPERATURE),
        _ => None,
    }
}

/// Classify one reading.
///
/// Unknown metric names and values that are missing or not numeric are
/// [`Severity::Unknown`].
pub fn classify(metric: &str, value: Option<&str>) -> Severity {
    let Some(bands) = bands_for(metric) else {
        return Severity::Unknown;
    };
    match value.map(str::trim).and_then(|v| v.parse::<f64>().ok()) {
        Some(v) if v.is_finite() => bands.classify(v),
        _ => Severity::Unknown,
    }
}

/// Turns snapshots into alarm candidates.
#[derive(Debug, Clone, Default)]
pub struct AlarmEngine {
    baselines: HashMap<String, DeviceStatusVector>,
}

impl AlarmEngine {
    pub fn new(baselines: HashMap<String, DeviceStatusVector>) -> Self {
        Self { baselines }
    }

    /// Set each metric's severity from its value.
    pub fn annotate(&self, snapshot: &mut HealthSnapshot) {
        for metric in &mut snapshot.metrics {
            metric.severity = classify(&metric.name, metric.value.as_deref());
        }
    }

    /// Alarms raised by `snapshot`, stamped with `cycle_time`.
    ///
    /// # Arguments
    ///
    /// * `snapshot` - Latest health readings and status vectors
    /// * `cycle_time` - Time of this evaluation cycle; becomes each alarm's datetime
    ///
    /// # Returns
    ///
    /// Alarm candidates in snapshot order, thresholds first. Stations with a
    /// status vector but no baseline are skipped with a warning.
    pub fn evaluate(&self, snapshot: &HealthSnapshot, cycle_time: DateTime<Utc>) -> Vec<Alarm> {
        let mut alarms = Vec::new();

        for metric in &snapshot.metrics {
            let severity = classify(&metric.name, metric.value.as_deref());
            if !severity.is_alarming() {
                continue;
            }
            let detail = metric.value.clone().unwrap_or_default();
            alarms.push(Alarm {
                id: threshold_alarm_id(&metric.station, metric.timestamp, severity),
                station: metric.station.clone(),
                name: metric.name.clone(),
                detail,
                datetime: cycle_time,
                severity,
                status: AlarmState::Ongoing,
            });
        }

        for report in &snapshot.statuses {
            let Some(baseline) = self.baselines.get(&report.station) else {
                warn!(station = %report.station, "No status baseline configured, skipping");
                continue;
            };

            for index in report.status.differing_indices(baseline) {
                let fault = FAULT_NAMES[index];
                let severity = Severity::Critical;
                alarms.push(Alarm {
                    id: bitfield_alarm_id(&report.station, fault, severity),
                    station: report.station.clone(),
                    name: fault.to_string(),
                    detail: fault_detail(report.status.bit(index), baseline.bit(index)),
                    datetime: cycle_time,
                    severity,
                    status: AlarmState::Ongoing,
                });
            }
        }

        debug!(
            metrics = snapshot.metrics.len(),
            statuses = snapshot.statuses.len(),
            alarms = alarms.len(),
            "Snapshot evaluated"
        );
        alarms
    }
}

fn fault_detail(actual: bool, expected: bool) -> String {
    format!(
        "status bit is {} (baseline {})",
        u8::from(actual),
        u8::from(expected)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::StationStatus;
    use crate::model::HealthMetric;
    use chrono::TimeZone;

    fn metric(name: &str, value: Option<&str>, ts: DateTime<Utc>) -> HealthMetric {
        HealthMetric {
            station: "SB1M".to_string(),
            name: name.to_string(),
            value: value.map(str::to_string),
            timestamp: ts,
            severity: Severity::Unknown,
        }
    }

    #[test]
    fn test_classify_humidity_bands() {
        assert_eq!(classify("humidity", Some("4")), Severity::Critical);
        assert_eq!(classify("humidity", Some("99.5")), Severity::Critical);
        assert_eq!(classify("humidity", Some("9")), Severity::Warning);
        assert_eq!(classify("humidity", Some("95")), Severity::Warning);
        assert_eq!(classify("humidity", Some("50")), Severity::Ok);
        assert_eq!(classify("humidity", Some("10")), Severity::Ok);
    }

    #[test]
    fn test_classify_battery_and_temperature() {
        assert_eq!(classify("battery_voltage", Some("10.9")), Severity::Critical);
        assert_eq!(classify("Battery Voltage", Some("15")), Severity::Warning);
        assert_eq!(classify("battery_voltage", Some("13.2")), Severity::Ok);
        assert_eq!(classify("temperature", Some("-25")), Severity::Critical);
        assert_eq!(classify("temperature", Some("55")), Severity::Warning);
    }

    #[test]
    fn test_classify_unknowns() {
        assert_eq!(classify("humidity", None), Severity::Unknown);
        assert_eq!(classify("humidity", Some("n/a")), Severity::Unknown);
        assert_eq!(classify("wind_speed", Some("3")), Severity::Unknown);
    }

    #[test]
    fn test_threshold_alarm_shape() {
        let ts = Utc.with_ymd_and_hms(2021, 11, 19, 4, 0, 0).unwrap();
        let cycle = ts + chrono::Duration::seconds(30);
        let snapshot = HealthSnapshot {
            metrics: vec![metric("humidity", Some("95"), ts), metric("humidity", Some("50"), ts)],
            statuses: Vec::new(),
        };

        let alarms = AlarmEngine::default().evaluate(&snapshot, cycle);
        assert_eq!(alarms.len(), 1);
        assert_eq!(alarms[0].id, "SB1M.D20211119T040000.1");
        assert_eq!(alarms[0].name, "humidity");
        assert_eq!(alarms[0].detail, "95");
        assert_eq!(alarms[0].datetime, cycle);
    }

    #[test]
    fn test_metrics_read_together_share_an_id() {
        let ts = Utc.with_ymd_and_hms(2021, 11, 19, 4, 0, 0).unwrap();
        let snapshot = HealthSnapshot {
            metrics: vec![
                metric("humidity", Some("95"), ts),
                metric("temperature", Some("55"), ts),
            ],
            statuses: Vec::new(),
        };

        let alarms = AlarmEngine::default().evaluate(&snapshot, ts);
        assert_eq!(alarms.len(), 2);
        assert_eq!(alarms[0].id, alarms[1].id);
    }

    #[test]
    fn test_status_equal_to_baseline_raises_nothing() {
        let mut baselines = HashMap::new();
        baselines.insert("SB1M".to_string(), DeviceStatusVector::from_code(0b1010));
        let engine = AlarmEngine::new(baselines);

        let snapshot = HealthSnapshot {
            metrics: Vec::new(),
            statuses: vec![StationStatus {
                station: "SB1M".to_string(),
                status: DeviceStatusVector::from_code(0b1010),
                timestamp: Utc::now(),
            }],
        };
        assert!(engine.evaluate(&snapshot, Utc::now()).is_empty());
    }

    #[test]
    fn test_flipped_bit_raises_named_critical() {
        let mut baselines = HashMap::new();
        baselines.insert("SB1M".to_string(), DeviceStatusVector::from_code(0));
        let engine = AlarmEngine::new(baselines);

        for k in [0usize, 3, 15] {
            let snapshot = HealthSnapshot {
                metrics: Vec::new(),
                statuses: vec![StationStatus {
                    station: "SB1M".to_string(),
                    status: DeviceStatusVector::from_code(1 << k),
                    timestamp: Utc::now(),
                }],
            };
            let alarms = engine.evaluate(&snapshot, Utc::now());
            assert_eq!(alarms.len(), 1);
            assert_eq!(alarms[0].name, FAULT_NAMES[k]);
            assert_eq!(alarms[0].severity, Severity::Critical);
            assert_eq!(alarms[0].id, format!("SB1M.{}.2", FAULT_NAMES[k]));
        }
    }

    #[test]
    fn test_station_without_baseline_skipped() {
        let snapshot = HealthSnapshot {
            metrics: Vec::new(),
            statuses: vec![StationStatus {
                station: "SB9M".to_string(),
                status: DeviceStatusVector::from_code(0xFF),
                timestamp: Utc::now(),
            }],
        };
        assert!(AlarmEngine::default().evaluate(&snapshot, Utc::now()).is_empty());
    }

    #[test]
    fn test_annotate_sets_severity() {
        let mut snapshot = HealthSnapshot {
            metrics: vec![metric("battery_voltage", Some("11.5"), Utc::now())],
            statuses: Vec::new(),
        };
        AlarmEngine::default().annotate(&mut snapshot);
        assert_eq!(snapshot.metrics[0].severity, Severity::Warning);
    }
}
