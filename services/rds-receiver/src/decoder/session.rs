//! Listen session - runs rtl_fm | redsea on one frequency and forwards decoded
//! groups to the sink

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::message::DecodedMessage;
use crate::config::Config;
use crate::device::{DeviceStats, Tuning};
use crate::error::Result;
use crate::process::{spawn_with_retry, CommandProvider, ProcessHandle, ReadOutcome, SpawnOptions};
use crate::sink::SinkDispatcher;
use crate::tools::listen_pipeline;

/// Why a listen session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEnd {
    Cancelled,
    /// The decoder pipeline closed its output
    EndOfStream,
    /// The time box ran out
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ListenReport {
    pub frequency_mhz: f64,
    pub messages: u64,
    /// At least one message carried a non-empty PI or PS
    pub confirmed: bool,
    pub end: SessionEnd,
}

/// A running decoder pipeline at one frequency
pub struct ListenSession {
    handle: ProcessHandle,
    tuning: Tuning,
    sink: SinkDispatcher,
    stats: Arc<DeviceStats>,
    poll_interval: Duration,
    grace: Duration,
    kill_deadline: Duration,
}

impl ListenSession {
    /// Start the decoder pipeline, retrying busy or failed spawns until
    /// `cancel` fires
    pub async fn open(
        provider: &dyn CommandProvider,
        config: &Config,
        tuning: Tuning,
        sink: SinkDispatcher,
        stats: Arc<DeviceStats>,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let spec = listen_pipeline(config, &tuning);
        let handle = spawn_with_retry(
            provider,
            &spec,
            &SpawnOptions::lines(config.startup_probe),
            config.spawn_attempts,
            config.spawn_backoff,
            &stats,
            cancel,
        )
        .await?;

        debug!("[Listen] {:.1} MHz, gain {}", tuning.frequency_mhz, tuning.gain);
        Ok(Self {
            handle,
            tuning,
            sink,
            stats,
            poll_interval: config.poll_interval,
            grace: config.termination_grace,
            kill_deadline: config.kill_deadline,
        })
    }

    pub fn tuning(&self) -> Tuning {
        self.tuning
    }

    pub fn process_group(&self) -> Option<i32> {
        self.handle.process_group()
    }

    /// Decode until cancelled or until the pipeline exits
    pub async fn run_continuous(self, cancel: &CancellationToken) -> ListenReport {
        info!("[Monitor] Listening on {:.1} MHz", self.tuning.frequency_mhz);
        self.run(None, cancel).await
    }

    /// Decode for exactly `budget` (no early exit on confirmation)
    pub async fn run_timeboxed(self, budget: Duration, cancel: &CancellationToken) -> ListenReport {
        self.run(Some(Instant::now() + budget), cancel).await
    }

    async fn run(mut self, deadline: Option<Instant>, cancel: &CancellationToken) -> ListenReport {
        let frequency_mhz = self.tuning.frequency_mhz;
        let mut messages = 0u64;
        let mut confirmed = false;

        let end = loop {
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break SessionEnd::Expired;
                    }
                    self.poll_interval.min(deadline - now)
                }
                None => self.poll_interval,
            };

            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => break SessionEnd::Cancelled,
                read = self.handle.read_line(wait) => read,
            };

            match read {
                ReadOutcome::Item(line) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match DecodedMessage::from_line(&line, frequency_mhz) {
                        Ok(message) => {
                            messages += 1;
                            self.stats.record_decoded();
                            if !confirmed && message.is_identifying() {
                                confirmed = true;
                                debug!(
                                    "[Listen] {:.1} MHz identified: PI={} PS={}",
                                    frequency_mhz,
                                    message.pi().unwrap_or("-"),
                                    message.ps().unwrap_or("-")
                                );
                            }
                            self.sink.submit(message);
                        }
                        Err(e) => {
                            self.stats.record_malformed();
                            debug!("[Listen] {}", e);
                        }
                    }
                }
                ReadOutcome::Timeout => {}
                ReadOutcome::EndOfStream => {
                    if deadline.is_none() {
                        warn!("[Monitor] Decoder pipeline exited on {:.1} MHz", frequency_mhz);
                    }
                    break SessionEnd::EndOfStream;
                }
            }
        };

        self.handle.terminate(self.grace, self.kill_deadline).await;

        ListenReport {
            frequency_mhz,
            messages,
            confirmed,
            end,
        }
    }
}
