//! Configuration loaded from environment variables
//!
//! Callers go through a [`ConfigSource`] at the start of every operation (tune,
//! sweep, mode switch) instead of caching a [`Config`], so a changed setting
//! takes effect on the next action.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::device::{Gain, ReceiverMode};
use crate::sweep::DEFAULT_GUARD_MHZ;

/// Paths of the external radio tools
#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub rtl_fm: String,
    pub redsea: String,
    pub rtl_power: String,
    pub welle_cli: String,
    pub ffmpeg: String,
}

impl Default for ToolPaths {
    fn default() -> Self {
        Self {
            rtl_fm: "rtl_fm".to_string(),
            redsea: "redsea".to_string(),
            rtl_power: "rtl_power".to_string(),
            welle_cli: "welle-cli".to_string(),
            ffmpeg: "ffmpeg".to_string(),
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// RTL-SDR device index
    pub device_index: u32,

    /// Gain used when a tune request does not name one
    pub default_gain: Gain,

    /// PPM frequency correction
    pub ppm_error: i32,

    /// Frequency monitored after startup
    pub start_frequency_mhz: f64,

    /// Mode entered at startup
    pub start_mode: ReceiverMode,

    /// Start a band search right after the monitor comes up
    pub search_on_start: bool,

    pub tools: ToolPaths,

    /// Sweep samples below this power are never candidates
    pub squelch_db: f64,

    /// FM band covered by sweeps and seek
    pub band_start_mhz: f64,
    pub band_end_mhz: f64,

    /// rtl_power bin width
    pub sweep_step_khz: u32,

    /// rtl_power integration interval
    pub sweep_integration_secs: u32,

    /// Whole-sweep deadline
    pub sweep_timeout: Duration,

    /// Candidates closer than this to the previous kept one are merged
    pub peak_guard_mhz: f64,

    /// Listen window per search candidate
    pub candidate_timeout: Duration,

    /// Hardware settle after releasing the device for a retune
    pub tune_settle: Duration,

    /// Hardware settle before FM claims the device on a mode switch
    pub fm_settle: Duration,

    /// Hardware settle before welle-cli claims the device on a mode switch
    pub digital_settle: Duration,

    /// SIGTERM grace period before SIGKILL
    pub termination_grace: Duration,

    /// Deadline for the group to disappear after SIGKILL
    pub kill_deadline: Duration,

    /// Window in which early stderr is checked for busy-device markers
    pub startup_probe: Duration,

    /// Spawn attempts before a failure is surfaced
    pub spawn_attempts: u32,

    /// Linear backoff between spawn attempts
    pub spawn_backoff: Duration,

    /// Output poll interval of listen loops (bounds cancellation latency)
    pub poll_interval: Duration,

    /// Upper bound for stopping a worker
    pub stop_timeout: Duration,

    /// DAB channel used when entering digital mode
    pub dab_channel: String,

    /// Host of the welle-cli web server
    pub dab_web_host: String,

    /// welle-cli web server port
    pub dab_web_port: u16,

    /// How often the ensemble's service list is fetched from welle-cli
    pub dab_poll_interval: Duration,

    /// Per-request timeout for the welle-cli web API
    pub dab_api_timeout: Duration,

    /// Capacity of the decoded-message queue in front of the sinks
    pub sink_queue: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            device_index: 0,
            default_gain: Gain::Auto,
            ppm_error: 0,
            start_frequency_mhz: 88.5,
            start_mode: ReceiverMode::Fm,
            search_on_start: false,
            tools: ToolPaths::default(),
            squelch_db: -30.0,
            band_start_mhz: 87.5,
            band_end_mhz: 108.0,
            sweep_step_khz: 25,
            sweep_integration_secs: 2,
            sweep_timeout: Duration::from_secs(30),
            peak_guard_mhz: DEFAULT_GUARD_MHZ,
            candidate_timeout: Duration::from_millis(2500),
            tune_settle: Duration::from_millis(500),
            fm_settle: Duration::from_millis(1000),
            digital_settle: Duration::from_millis(3000),
            termination_grace: Duration::from_millis(2000),
            kill_deadline: Duration::from_millis(2000),
            startup_probe: Duration::from_millis(500),
            spawn_attempts: 3,
            spawn_backoff: Duration::from_millis(500),
            poll_interval: Duration::from_millis(200),
            stop_timeout: Duration::from_secs(10),
            dab_channel: "12B".to_string(),
            dab_web_host: "localhost".to_string(),
            dab_web_port: 7979,
            dab_poll_interval: Duration::from_secs(3),
            dab_api_timeout: Duration::from_secs(5),
            sink_queue: 1000,
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_string(key: &str, default: String) -> String {
    std::env::var(key)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let tools = defaults.tools.clone();

        Self {
            device_index: env_parse("DEVICE_INDEX", defaults.device_index),
            default_gain: env_parse("DEVICE_GAIN", defaults.default_gain),
            ppm_error: env_parse("PPM_ERROR", defaults.ppm_error),
            start_frequency_mhz: env_parse("START_FREQUENCY_MHZ", defaults.start_frequency_mhz),
            start_mode: env_parse("RECEIVER_MODE", defaults.start_mode),
            search_on_start: env_parse("SEARCH_ON_START", defaults.search_on_start),

            tools: ToolPaths {
                rtl_fm: env_string("RTL_FM_PATH", tools.rtl_fm),
                redsea: env_string("REDSEA_PATH", tools.redsea),
                rtl_power: env_string("RTL_POWER_PATH", tools.rtl_power),
                welle_cli: env_string("WELLE_CLI_PATH", tools.welle_cli),
                ffmpeg: env_string("FFMPEG_PATH", tools.ffmpeg),
            },

            squelch_db: env_parse("SQUELCH_DB", defaults.squelch_db),
            band_start_mhz: env_parse("BAND_START_MHZ", defaults.band_start_mhz),
            band_end_mhz: env_parse("BAND_END_MHZ", defaults.band_end_mhz),
            sweep_step_khz: env_parse("SWEEP_STEP_KHZ", defaults.sweep_step_khz),
            sweep_integration_secs: env_parse(
                "SWEEP_INTEGRATION_SECS",
                defaults.sweep_integration_secs,
            ),
            sweep_timeout: std::env::var("SWEEP_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.sweep_timeout),
            peak_guard_mhz: env_parse("PEAK_GUARD_MHZ", defaults.peak_guard_mhz),

            candidate_timeout: env_millis("CANDIDATE_TIMEOUT_MS", defaults.candidate_timeout),
            tune_settle: env_millis("TUNE_SETTLE_MS", defaults.tune_settle),
            fm_settle: env_millis("FM_SETTLE_MS", defaults.fm_settle),
            digital_settle: env_millis("DIGITAL_SETTLE_MS", defaults.digital_settle),
            termination_grace: env_millis("TERMINATION_GRACE_MS", defaults.termination_grace),
            kill_deadline: env_millis("KILL_DEADLINE_MS", defaults.kill_deadline),
            startup_probe: env_millis("STARTUP_PROBE_MS", defaults.startup_probe),
            spawn_attempts: env_parse("SPAWN_ATTEMPTS", defaults.spawn_attempts).max(1),
            spawn_backoff: env_millis("SPAWN_BACKOFF_MS", defaults.spawn_backoff),
            // Cancellation latency must stay under a second
            poll_interval: env_millis("POLL_INTERVAL_MS", defaults.poll_interval)
                .min(Duration::from_secs(1)),
            stop_timeout: env_millis("STOP_TIMEOUT_MS", defaults.stop_timeout),

            dab_channel: env_string("DAB_CHANNEL", defaults.dab_channel),
            dab_web_host: env_string("DAB_WEB_HOST", defaults.dab_web_host),
            dab_web_port: env_parse("DAB_WEB_PORT", defaults.dab_web_port),
            dab_poll_interval: env_millis("DAB_POLL_INTERVAL_MS", defaults.dab_poll_interval),
            dab_api_timeout: env_millis("DAB_API_TIMEOUT_MS", defaults.dab_api_timeout),
            sink_queue: env_parse("SINK_QUEUE", defaults.sink_queue).max(1),
        }
    }

    /// Process names that may hold the receiver, for the system-wide force release
    pub fn receiver_tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = [
            &self.tools.rtl_fm,
            &self.tools.rtl_power,
            &self.tools.welle_cli,
        ]
        .iter()
        .map(|path| {
            Path::new(path.as_str())
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.to_string())
        })
        .collect();

        for extra in ["rtl_sdr", "rtl_tcp"] {
            if !names.iter().any(|n| n == extra) {
                names.push(extra.to_string());
            }
        }
        names
    }
}

/// Read-only access to the current configuration
pub trait ConfigSource: Send + Sync {
    fn load(&self) -> Config;
}

/// Re-reads the environment on every load
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvConfig;

impl ConfigSource for EnvConfig {
    fn load(&self) -> Config {
        Config::from_env()
    }
}

impl ConfigSource for Config {
    fn load(&self) -> Config {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.start_frequency_mhz, 88.5);
        assert_eq!(config.default_gain, Gain::Auto);
        assert_eq!(config.candidate_timeout, Duration::from_millis(2500));
        assert_eq!(config.peak_guard_mhz, 0.15);
        assert_eq!(config.spawn_attempts, 3);
        assert!(config.digital_settle > config.fm_settle);
    }

    #[test]
    fn test_from_env_overrides() {
        // Keys unique to this test so parallel tests do not interfere
        std::env::set_var("DAB_WEB_PORT", "8080");
        std::env::set_var("WELLE_CLI_PATH", "/opt/welle/bin/welle-cli");
        std::env::set_var("POLL_INTERVAL_MS", "5000");
        std::env::set_var("DAB_POLL_INTERVAL_MS", "750");
        let config = Config::from_env();
        assert_eq!(config.dab_web_port, 8080);
        assert_eq!(config.tools.welle_cli, "/opt/welle/bin/welle-cli");
        assert_eq!(config.poll_interval, Duration::from_secs(1));
        assert_eq!(config.dab_poll_interval, Duration::from_millis(750));
        assert!(config
            .receiver_tool_names()
            .contains(&"welle-cli".to_string()));
        std::env::remove_var("DAB_WEB_PORT");
        std::env::remove_var("WELLE_CLI_PATH");
        std::env::remove_var("POLL_INTERVAL_MS");
        std::env::remove_var("DAB_POLL_INTERVAL_MS");
    }

    #[test]
    fn test_receiver_tool_names() {
        let names = Config::default().receiver_tool_names();
        assert_eq!(
            names,
            vec!["rtl_fm", "rtl_power", "welle-cli", "rtl_sdr", "rtl_tcp"]
        );
    }
}
