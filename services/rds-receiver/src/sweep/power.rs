//! rtl_power sweep adapter
//!
//! Runs a single-shot `rtl_power` over the configured band and turns its CSV
//! rows into ascending [`PowerSample`]s.

use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::peaks::PowerSample;
use crate::config::Config;
use crate::device::{DeviceStats, Gain};
use crate::error::{ReceiverError, Result};
use crate::process::{spawn_with_retry, CommandProvider, ReadOutcome, SpawnOptions};
use crate::tools::sweep_pipeline;

/// Leading columns before the dB values: date, time, hz_low, hz_high, hz_step, samples
const HEADER_FIELDS: usize = 6;

/// Parse one rtl_power CSV row into samples at `hz_low + i * hz_step`
pub fn parse_power_row(line: &str) -> Result<Vec<PowerSample>> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() <= HEADER_FIELDS {
        return Err(ReceiverError::MalformedOutput(format!(
            "rtl_power row has {} fields",
            fields.len()
        )));
    }

    let number = |index: usize| -> Result<f64> {
        fields[index]
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| {
                ReceiverError::MalformedOutput(format!(
                    "rtl_power field {} is not a number: `{}`",
                    index, fields[index]
                ))
            })
    };

    let hz_low = number(2)?;
    let hz_step = number(4)?;
    if hz_step <= 0.0 {
        return Err(ReceiverError::MalformedOutput(format!(
            "rtl_power step {} is not positive",
            hz_step
        )));
    }

    (HEADER_FIELDS..fields.len())
        .enumerate()
        .map(|(i, index)| {
            let power_db = number(index)?;
            Ok(PowerSample::new((hz_low + i as f64 * hz_step) / 1e6, power_db))
        })
        .collect()
}

/// Sort by frequency and collapse duplicate bins from overlapping hops
pub fn merge_samples(mut samples: Vec<PowerSample>) -> Vec<PowerSample> {
    samples.sort_by(|a, b| a.frequency_mhz.total_cmp(&b.frequency_mhz));
    samples.dedup_by(|next, kept| (next.frequency_mhz - kept.frequency_mhz).abs() < 1e-9);
    samples
}

/// Run one sweep and return the merged samples.
///
/// The whole sweep is bounded by `config.sweep_timeout`. Malformed rows are
/// dropped and counted. The sweep process is always terminated before return.
pub async fn run_sweep(
    provider: &dyn CommandProvider,
    config: &Config,
    gain: Gain,
    cancel: &CancellationToken,
    stats: &DeviceStats,
) -> Result<Vec<PowerSample>> {
    let spec = sweep_pipeline(config, gain);
    info!("[Sweep] {:.1}-{:.1} MHz, step {} kHz", config.band_start_mhz, config.band_end_mhz, config.sweep_step_khz);

    let mut handle = spawn_with_retry(
        provider,
        &spec,
        &SpawnOptions::lines(config.startup_probe),
        config.spawn_attempts,
        config.spawn_backoff,
        stats,
        cancel,
    )
    .await?;

    let deadline = Instant::now() + config.sweep_timeout;
    let mut samples = Vec::new();

    let result = loop {
        let read = tokio::select! {
            _ = cancel.cancelled() => break Err(ReceiverError::Cancelled),
            read = timeout_at(deadline, handle.read_line(config.poll_interval)) => read,
        };

        match read {
            Err(_) => break Err(ReceiverError::SweepTimeout(config.sweep_timeout)),
            Ok(ReadOutcome::Item(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match parse_power_row(&line) {
                    Ok(row) => samples.extend(row),
                    Err(e) => {
                        stats.record_malformed();
                        debug!("[Sweep] Dropping row: {}", e);
                    }
                }
            }
            Ok(ReadOutcome::Timeout) => {}
            Ok(ReadOutcome::EndOfStream) => break Ok(()),
        }
    };

    handle
        .terminate(config.termination_grace, config.kill_deadline)
        .await;
    result?;

    let samples = merge_samples(samples);
    if samples.is_empty() {
        warn!("[Sweep] No power samples");
        return Err(ReceiverError::EmptySweep);
    }
    info!("[Sweep] {} power samples", samples.len());
    Ok(samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_power_row() {
        let row = "2024-01-01, 12:00:00, 100000000, 100100000, 25000.00, 10, -50.1, -48.0, -20.5, -49.9";
        let samples = parse_power_row(row).unwrap();
        assert_eq!(samples.len(), 4);
        assert!((samples[0].frequency_mhz - 100.0).abs() < 1e-9);
        assert!((samples[2].frequency_mhz - 100.05).abs() < 1e-9);
        assert_eq!(samples[2].power_db, -20.5);
    }

    #[test]
    fn test_malformed_rows_are_rejected() {
        assert!(matches!(
            parse_power_row("not,a,row"),
            Err(ReceiverError::MalformedOutput(_))
        ));
        assert!(parse_power_row("d, t, abc, 1, 2, 3, -40").is_err());
        assert!(parse_power_row("d, t, 1, 2, 0, 3, -40").is_err());
        assert!(parse_power_row("d, t, 1, 2, 5, 3, -40, nan").is_err());
    }

    #[test]
    fn test_merge_sorts_and_dedupes() {
        let merged = merge_samples(vec![
            PowerSample::new(100.1, -40.0),
            PowerSample::new(100.0, -41.0),
            PowerSample::new(100.1, -39.0),
        ]);
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].frequency_mhz, 100.0);
        assert_eq!(merged[1].frequency_mhz, 100.1);
    }
}

#[cfg(all(test, unix))]
mod sweep_tests {
    use super::*;
    use crate::testing::{test_config, ScriptedProvider};
    use std::time::Duration;

    #[tokio::test]
    async fn test_run_sweep_parses_rows() {
        let provider = ScriptedProvider::new().with_sweep_rows(vec![
            "d, t, 100000000, 100050000, 25000, 1, -40.0, -30.0, -40.0".to_string(),
            "garbage".to_string(),
            "d, t, 100075000, 100125000, 25000, 1, -41.0, -42.0, -43.0".to_string(),
        ]);
        let stats = DeviceStats::new();
        let samples = run_sweep(&provider, &test_config(), Gain::Auto, &CancellationToken::new(), &stats)
            .await
            .unwrap();
        assert_eq!(samples.len(), 6);
        assert_eq!(stats.get_malformed(), 1);
    }

    #[tokio::test]
    async fn test_empty_sweep() {
        let provider = ScriptedProvider::new().with_sweep_rows(Vec::new());
        let result = run_sweep(
            &provider,
            &test_config(),
            Gain::Auto,
            &CancellationToken::new(),
            &DeviceStats::new(),
        )
        .await;
        assert!(matches!(result, Err(ReceiverError::EmptySweep)));
    }

    #[tokio::test]
    async fn test_sweep_timeout() {
        let provider = ScriptedProvider::new().with_hanging_sweep();
        let config = Config {
            sweep_timeout: Duration::from_millis(200),
            ..test_config()
        };
        let result = run_sweep(&provider, &config, Gain::Auto, &CancellationToken::new(), &DeviceStats::new()).await;
        assert!(matches!(result, Err(ReceiverError::SweepTimeout(_))));
    }

    #[tokio::test]
    async fn test_sweep_cancelled() {
        let provider = ScriptedProvider::new().with_hanging_sweep();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let result = run_sweep(&provider, &test_config(), Gain::Auto, &cancel, &DeviceStats::new()).await;
        assert!(matches!(result, Err(ReceiverError::Cancelled)));
    }
}
