//! Command execution provider

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::handle::{ProcessHandle, SpawnOptions};
use super::pipeline::PipelineSpec;
use crate::device::DeviceStats;
use crate::error::{ReceiverError, Result};

const PKILL_TIMEOUT: Duration = Duration::from_secs(2);

/// Launches pipelines and performs the last-resort cross-process cleanup
#[async_trait]
pub trait CommandProvider: Send + Sync {
    /// Start a pipeline as one process group
    async fn run(&self, spec: &PipelineSpec, options: &SpawnOptions) -> Result<ProcessHandle>;

    /// Best-effort kill of every process with one of these names.
    /// Missing tools and "nothing matched" are not errors.
    async fn force_release(&self, tool_names: &[String]);
}

/// Native processes on the local machine
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandProvider;

#[async_trait]
impl CommandProvider for SystemCommandProvider {
    async fn run(&self, spec: &PipelineSpec, options: &SpawnOptions) -> Result<ProcessHandle> {
        ProcessHandle::start(spec, options).await
    }

    async fn force_release(&self, tool_names: &[String]) {
        for name in tool_names {
            let status = tokio::time::timeout(
                PKILL_TIMEOUT,
                Command::new("pkill")
                    .args(["-KILL", "-x", name.as_str()])
                    .kill_on_drop(true)
                    .status(),
            )
            .await;

            match status {
                Ok(Ok(status)) if status.success() => {
                    info!("[ForceRelease] Killed stray {} processes", name);
                }
                Ok(Ok(_)) => debug!("[ForceRelease] No {} processes running", name),
                Ok(Err(e)) => debug!("[ForceRelease] pkill unavailable for {}: {}", name, e),
                Err(_) => warn!("[ForceRelease] pkill {} timed out", name),
            }
        }
    }
}

/// Spawn with a capped number of attempts and linear backoff.
/// Only `Spawn` and `DeviceBusy` failures are retried. Cancellation wins over
/// both a pending start and the backoff sleep and yields `Cancelled`.
pub async fn spawn_with_retry(
    provider: &dyn CommandProvider,
    spec: &PipelineSpec,
    options: &SpawnOptions,
    attempts: u32,
    backoff: Duration,
    stats: &DeviceStats,
    cancel: &CancellationToken,
) -> Result<ProcessHandle> {
    let attempts = attempts.max(1);
    let mut attempt = 1;

    loop {
        let run = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ReceiverError::Cancelled),
            run = provider.run(spec, options) => run,
        };

        match run {
            Ok(handle) => return Ok(handle),
            Err(e) if e.is_retryable() && attempt < attempts => {
                warn!(
                    "[Spawn] Attempt {}/{} failed: {}. Retrying in {:?}...",
                    attempt,
                    attempts,
                    e,
                    backoff * attempt
                );
                stats.record_spawn_retry();
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(ReceiverError::Cancelled),
                    _ = tokio::time::sleep(backoff * attempt) => {}
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::{CommandSpec, ReadOutcome};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Reports busy for the first `busy` runs, then runs `printf ok`
    struct FlakyProvider {
        busy: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CommandProvider for FlakyProvider {
        async fn run(&self, _spec: &PipelineSpec, options: &SpawnOptions) -> Result<ProcessHandle> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let script = if call < self.busy {
                "echo 'usb_claim_interface error -6' >&2; exec sleep 5"
            } else {
                "printf 'ok\\n'"
            };
            let real = PipelineSpec::single(CommandSpec::new("sh").args(["-c", script]));
            ProcessHandle::start(&real, options).await
        }

        async fn force_release(&self, _tool_names: &[String]) {}
    }

    fn options() -> SpawnOptions {
        SpawnOptions::lines(Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_retries_device_busy_then_succeeds() {
        let provider = FlakyProvider {
            busy: 2,
            calls: AtomicU32::new(0),
        };
        let stats = DeviceStats::new();
        let spec = PipelineSpec::single(CommandSpec::new("rtl_fm"));
        let mut handle = spawn_with_retry(
            &provider,
            &spec,
            &options(),
            3,
            Duration::from_millis(10),
            &stats,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        assert_eq!(stats.get_spawn_retries(), 2);
        assert_eq!(
            handle.read_line(Duration::from_secs(2)).await,
            ReadOutcome::Item("ok".to_string())
        );
    }

    #[tokio::test]
    async fn test_retry_is_capped() {
        let provider = FlakyProvider {
            busy: 10,
            calls: AtomicU32::new(0),
        };
        let stats = DeviceStats::new();
        let spec = PipelineSpec::single(CommandSpec::new("rtl_fm"));
        let result = spawn_with_retry(
            &provider,
            &spec,
            &options(),
            3,
            Duration::from_millis(10),
            &stats,
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(ReceiverError::DeviceBusy { .. })));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_retry_backoff() {
        let provider = FlakyProvider {
            busy: u32::MAX,
            calls: AtomicU32::new(0),
        };
        let stats = DeviceStats::new();
        let spec = PipelineSpec::single(CommandSpec::new("rtl_fm"));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let result = spawn_with_retry(
            &provider,
            &spec,
            &options(),
            10,
            Duration::from_millis(500),
            &stats,
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(ReceiverError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(provider.calls.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let provider = FlakyProvider {
            busy: 0,
            calls: AtomicU32::new(0),
        };
        let cancel = CancellationToken::new();
        cancel.cancel();
        let spec = PipelineSpec::single(CommandSpec::new("rtl_fm"));
        let result = spawn_with_retry(
            &provider,
            &spec,
            &options(),
            3,
            Duration::from_millis(10),
            &DeviceStats::new(),
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(ReceiverError::Cancelled)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_force_release_tolerates_absent_tools() {
        SystemCommandProvider
            .force_release(&["rds-receiver-no-such-tool".to_string()])
            .await;
    }
}
