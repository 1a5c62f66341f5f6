//! Test doubles: a command provider that stands small `sh` scripts in for the
//! radio tools, and a sink that collects what it is given.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;

use crate::config::Config;
use crate::decoder::DecodedMessage;
use crate::error;
use crate::process::{CommandProvider, CommandSpec, PipelineSpec, ProcessHandle, SpawnOptions};
use crate::sink::MessageSink;
use crate::tools::parse_mhz;

/// Short delays so end-to-end tests finish quickly
pub fn test_config() -> Config {
    Config {
        tune_settle: Duration::from_millis(20),
        fm_settle: Duration::from_millis(20),
        digital_settle: Duration::from_millis(80),
        candidate_timeout: Duration::from_millis(400),
        startup_probe: Duration::from_millis(100),
        poll_interval: Duration::from_millis(20),
        termination_grace: Duration::from_millis(500),
        kill_deadline: Duration::from_millis(500),
        spawn_backoff: Duration::from_millis(10),
        sweep_timeout: Duration::from_secs(5),
        stop_timeout: Duration::from_secs(3),
        ..Config::default()
    }
}

const BAND_START_HZ: u64 = 88_000_000;
const BAND_STEP_HZ: u64 = 25_000;
const BAND_BINS: u64 = 801;
const BINS_PER_ROW: u64 = 80;

/// rtl_power rows covering 88-108 MHz: -40 dB floor with a 5-bin hump
/// (-10 dB centre) at each station
pub fn band_rows(stations: &[f64]) -> Vec<String> {
    let centres: Vec<i64> = stations
        .iter()
        .map(|f| ((f * 1e6 - BAND_START_HZ as f64) / BAND_STEP_HZ as f64).round() as i64)
        .collect();

    let power = |bin: i64| -> f64 {
        centres
            .iter()
            .map(|c| match (bin - c).abs() {
                0 => -10.0,
                1 => -18.0,
                2 => -26.0,
                _ => -40.0,
            })
            .fold(-40.0, f64::max)
    };

    (0..BAND_BINS)
        .step_by(BINS_PER_ROW as usize)
        .map(|first| {
            let last = (first + BINS_PER_ROW).min(BAND_BINS);
            let low = BAND_START_HZ + first * BAND_STEP_HZ;
            let high = BAND_START_HZ + last * BAND_STEP_HZ;
            let values: Vec<String> = (first..last)
                .map(|bin| format!("{:.1}", power(bin as i64)))
                .collect();
            format!(
                "2024-01-01, 12:00:00, {}, {}, {}, 8, {}",
                low,
                high,
                BAND_STEP_HZ,
                values.join(", ")
            )
        })
        .collect()
}

#[derive(Debug, Clone)]
enum SweepScript {
    Rows(Vec<String>),
    Hanging,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProviderCall {
    Spawn {
        program: String,
        frequency_mhz: Option<f64>,
        pgid: Option<i32>,
    },
    ForceRelease,
}

/// One provider call, with how many earlier process groups were still alive
#[derive(Debug, Clone)]
pub struct ProviderEvent {
    pub call: ProviderCall,
    pub at: Instant,
    pub live_groups: usize,
}

/// Runs real process groups through [`ProcessHandle`], with scripts standing
/// in for the radio tools
#[derive(Debug, Clone)]
pub struct ScriptedProvider {
    sweep: SweepScript,
    stations: Vec<(f64, String)>,
    decoder_exits: bool,
    busy_receiver: bool,
    digital_fails: bool,
    events: Arc<Mutex<Vec<ProviderEvent>>>,
}

impl Default for ScriptedProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self {
            sweep: SweepScript::Rows(band_rows(&[])),
            stations: Vec::new(),
            decoder_exits: false,
            busy_receiver: false,
            digital_fails: false,
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_sweep_rows(mut self, rows: Vec<String>) -> Self {
        self.sweep = SweepScript::Rows(rows);
        self
    }

    /// rtl_power never produces output
    pub fn with_hanging_sweep(mut self) -> Self {
        self.sweep = SweepScript::Hanging;
        self
    }

    /// The decoder emits one identifying group on this frequency
    pub fn with_station(mut self, frequency_mhz: f64, ps: &str) -> Self {
        self.stations.push((frequency_mhz, ps.to_string()));
        self
    }

    /// The decoder pipeline exits right after starting
    pub fn with_exiting_decoder(mut self) -> Self {
        self.decoder_exits = true;
        self
    }

    /// Every decoder start reports a busy device on stderr
    pub fn with_busy_receiver(mut self) -> Self {
        self.busy_receiver = true;
        self
    }

    /// welle-cli cannot be launched
    pub fn with_failing_digital(mut self) -> Self {
        self.digital_fails = true;
        self
    }

    pub fn events(&self) -> Vec<ProviderEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Spawns of one program, in order
    pub fn spawns(&self, program: &str) -> Vec<ProviderEvent> {
        self.events()
            .into_iter()
            .filter(|e| matches!(&e.call, ProviderCall::Spawn { program: p, .. } if p == program))
            .collect()
    }

    fn live_groups(&self) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter_map(|e| match e.call {
                ProviderCall::Spawn { pgid: Some(pgid), .. } => Some(pgid),
                _ => None,
            })
            .filter(|pgid| crate::process::group_alive(*pgid))
            .count()
    }

    fn record(&self, call: ProviderCall, live_groups: usize) {
        self.events.lock().unwrap().push(ProviderEvent {
            call,
            at: Instant::now(),
            live_groups,
        });
    }

    fn script(&self, spec: &PipelineSpec) -> (String, Option<f64>) {
        let Some(first) = spec.first() else {
            return ("exit 1".to_string(), None);
        };
        let audio = spec.stages().iter().any(|s| s.name() == "ffmpeg");

        match first.name() {
            "rtl_power" => match &self.sweep {
                SweepScript::Rows(rows) if rows.is_empty() => ("true".to_string(), None),
                SweepScript::Rows(rows) => {
                    let quoted: Vec<String> = rows.iter().map(|r| format!("'{}'", r)).collect();
                    (format!("printf '%s\\n' {}", quoted.join(" ")), None)
                }
                SweepScript::Hanging => ("exec sleep 30".to_string(), None),
            },
            "rtl_fm" => {
                let frequency = first.flag_value("-f").and_then(parse_mhz);
                if audio {
                    return ("printf 'ID3audio'; exec sleep 30".to_string(), frequency);
                }
                if self.busy_receiver {
                    return (
                        "echo 'usb_claim_interface error -6' >&2; exec sleep 30".to_string(),
                        frequency,
                    );
                }
                if self.decoder_exits {
                    return ("echo 'decoder chatter'; exit 0".to_string(), frequency);
                }
                let station = frequency.and_then(|f| {
                    self.stations
                        .iter()
                        .position(|(s, _)| (s - f).abs() < 0.01)
                        .map(|i| (i, &self.stations[i].1))
                });
                let script = match station {
                    Some((index, ps)) => format!(
                        "echo 'redsea: sync acquired'; echo '{{\"pi\":\"0x62{:02X}\",\"ps\":\"{}\",\"pty\":10}}'; exec sleep 30",
                        index, ps
                    ),
                    None => "exec sleep 30".to_string(),
                };
                (script, frequency)
            }
            "welle-cli" => ("echo 'welle-cli ready'; exec sleep 30".to_string(), None),
            _ => ("exec sleep 30".to_string(), None),
        }
    }
}

#[async_trait]
impl CommandProvider for ScriptedProvider {
    async fn run(&self, spec: &PipelineSpec, options: &SpawnOptions) -> error::Result<ProcessHandle> {
        if self.digital_fails && spec.first().is_some_and(|s| s.name() == "welle-cli") {
            return Err(error::ReceiverError::Spawn {
                command: spec.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "welle-cli not installed"),
            });
        }
        let (script, frequency_mhz) = self.script(spec);
        let mut real = PipelineSpec::single(CommandSpec::new("sh").args(["-c", script.as_str()]));
        if spec.stages().len() > 1 {
            real = real.pipe(CommandSpec::new("cat"));
        }

        let live_groups = self.live_groups();
        let handle = ProcessHandle::start(&real, options).await?;
        let program = spec.first().map(|s| s.name().to_string()).unwrap_or_default();
        self.record(
            ProviderCall::Spawn {
                program,
                frequency_mhz,
                pgid: handle.process_group(),
            },
            live_groups,
        );
        Ok(handle)
    }

    async fn force_release(&self, _tool_names: &[String]) {
        let live_groups = self.live_groups();
        self.record(ProviderCall::ForceRelease, live_groups);
    }
}

/// Collects accepted messages; optionally blocks until released
#[derive(Debug, Clone)]
pub struct CollectingSink {
    messages: Arc<Mutex<Vec<DecodedMessage>>>,
    gate: Arc<(Mutex<bool>, Condvar)>,
}

impl Default for CollectingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl CollectingSink {
    pub fn new() -> Self {
        Self {
            messages: Arc::new(Mutex::new(Vec::new())),
            gate: Arc::new((Mutex::new(true), Condvar::new())),
        }
    }

    /// A sink whose `accept` waits until [`CollectingSink::unblock`]
    pub fn blocked() -> Self {
        let sink = Self::new();
        *sink.gate.0.lock().unwrap() = false;
        sink
    }

    pub fn unblock(&self) {
        let (open, cond) = &*self.gate;
        *open.lock().unwrap() = true;
        cond.notify_all();
    }

    pub fn frequencies(&self) -> Vec<f64> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .map(|m| m.frequency_mhz)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().unwrap().len()
    }

    /// Poll until at least `count` messages arrived
    pub fn wait_for(&self, count: usize, limit: Duration) -> bool {
        let deadline = std::time::Instant::now() + limit;
        while std::time::Instant::now() < deadline {
            if self.len() >= count {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        self.len() >= count
    }
}

impl MessageSink for CollectingSink {
    fn name(&self) -> &str {
        "collecting"
    }

    fn accept(&mut self, message: &DecodedMessage) -> Result<()> {
        let (open, cond) = &*self.gate;
        let mut guard = open.lock().unwrap();
        while !*guard {
            guard = cond.wait(guard).unwrap();
        }
        drop(guard);
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_band_rows_shape() {
        let rows = band_rows(&[95.0]);
        assert_eq!(rows.len(), 11);
        let samples: Vec<_> = rows
            .iter()
            .flat_map(|r| crate::sweep::parse_power_row(r).unwrap())
            .collect();
        assert_eq!(samples.len(), BAND_BINS as usize);
        let loudest = samples
            .iter()
            .max_by(|a, b| a.power_db.total_cmp(&b.power_db))
            .unwrap();
        assert_eq!(loudest.frequency_mhz, 95.0);
    }
}
