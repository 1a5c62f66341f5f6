//! Receiver mode, tuning and per-device statistics

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Serialize, Serializer};

use crate::config::Config;

/// Operating mode of the shared receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiverMode {
    /// Narrowband FM with RDS decoding
    Fm,
    /// DAB/DAB+ reception through welle-cli
    DigitalBroadcast,
}

impl ReceiverMode {
    /// Settle delay required before this mode may claim the device.
    ///
    /// The DAB tool releases its USB claim more slowly than rtl_fm, so entering
    /// digital mode waits longer than returning to FM.
    pub fn settle_delay(self, config: &Config) -> Duration {
        match self {
            Self::Fm => config.fm_settle,
            Self::DigitalBroadcast => config.digital_settle,
        }
    }
}

impl fmt::Display for ReceiverMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fm => write!(f, "FM"),
            Self::DigitalBroadcast => write!(f, "DAB"),
        }
    }
}

impl FromStr for ReceiverMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fm" | "rds" => Ok(Self::Fm),
            "dab" | "digital" | "digital_broadcast" => Ok(Self::DigitalBroadcast),
            other => Err(format!("unknown receiver mode `{}`", other)),
        }
    }
}

/// Tuner gain: automatic or a fixed value in dB
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Gain {
    Auto,
    Db(f32),
}

impl fmt::Display for Gain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Db(db) => write!(f, "{}", db),
        }
    }
}

impl FromStr for Gain {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        s.parse::<f32>()
            .ok()
            .filter(|db| db.is_finite())
            .map(Self::Db)
            .ok_or_else(|| format!("invalid gain `{}`", s))
    }
}

impl Serialize for Gain {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Auto => serializer.serialize_str("auto"),
            Self::Db(db) => serializer.serialize_f32(*db),
        }
    }
}

/// Current tuning of the receiver
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Tuning {
    pub frequency_mhz: f64,
    pub gain: Gain,
}

impl Tuning {
    pub fn new(frequency_mhz: f64, gain: Gain) -> Self {
        Self {
            frequency_mhz,
            gain,
        }
    }

    /// Same gain, different frequency
    pub fn retuned(self, frequency_mhz: f64) -> Self {
        Self {
            frequency_mhz,
            ..self
        }
    }
}

/// Statistics for the receiver
#[derive(Debug, Default)]
pub struct DeviceStats {
    pub messages_decoded: AtomicU64,
    pub malformed_lines: AtomicU64,
    pub spawn_retries: AtomicU64,
}

impl DeviceStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_decoded(&self) {
        self.messages_decoded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed_lines.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_spawn_retry(&self) {
        self.spawn_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_decoded(&self) -> u64 {
        self.messages_decoded.load(Ordering::Relaxed)
    }

    pub fn get_malformed(&self) -> u64 {
        self.malformed_lines.load(Ordering::Relaxed)
    }

    pub fn get_spawn_retries(&self) -> u64 {
        self.spawn_retries.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_decoded: self.get_decoded(),
            malformed_lines: self.get_malformed(),
            spawn_retries: self.get_spawn_retries(),
        }
    }
}

/// Point-in-time copy of [`DeviceStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub messages_decoded: u64,
    pub malformed_lines: u64,
    pub spawn_retries: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain_parse() {
        assert_eq!("auto".parse::<Gain>().unwrap(), Gain::Auto);
        assert_eq!("AUTO".parse::<Gain>().unwrap(), Gain::Auto);
        assert_eq!("".parse::<Gain>().unwrap(), Gain::Auto);
        assert_eq!("49.6".parse::<Gain>().unwrap(), Gain::Db(49.6));
        assert!("loud".parse::<Gain>().is_err());
        assert!("NaN".parse::<Gain>().is_err());
    }

    #[test]
    fn test_gain_serializes_as_auto_or_number() {
        assert_eq!(serde_json::to_string(&Gain::Auto).unwrap(), "\"auto\"");
        assert_eq!(serde_json::to_string(&Gain::Db(20.0)).unwrap(), "20.0");
    }

    #[test]
    fn test_mode_parse_and_settle() {
        assert_eq!("fm".parse::<ReceiverMode>().unwrap(), ReceiverMode::Fm);
        assert_eq!(
            "DAB".parse::<ReceiverMode>().unwrap(),
            ReceiverMode::DigitalBroadcast
        );
        assert!("am".parse::<ReceiverMode>().is_err());

        let config = Config::default();
        assert!(
            ReceiverMode::DigitalBroadcast.settle_delay(&config)
                > ReceiverMode::Fm.settle_delay(&config)
        );
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = DeviceStats::new();
        stats.record_decoded();
        stats.record_decoded();
        stats.record_malformed();
        let snap = stats.snapshot();
        assert_eq!(snap.messages_decoded, 2);
        assert_eq!(snap.malformed_lines, 1);
        assert_eq!(snap.spawn_retries, 0);
    }
}
