//! Decoded message sinks
//!
//! Listen loops hand messages to a [`SinkDispatcher`], which never blocks: a
//! dedicated thread drains a bounded queue into every registered sink.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, info, warn};

use crate::decoder::{pty_name, DecodedMessage};

/// Consumer of decoded messages (store, telemetry publisher, log)
pub trait MessageSink: Send {
    fn name(&self) -> &str;

    /// Failures are logged by the dispatcher and never stop reception
    fn accept(&mut self, message: &DecodedMessage) -> Result<()>;
}

/// Logs station identity and text as it is decoded
#[derive(Debug, Default)]
pub struct TracingSink;

impl MessageSink for TracingSink {
    fn name(&self) -> &str {
        "tracing"
    }

    fn accept(&mut self, message: &DecodedMessage) -> Result<()> {
        if let Some(text) = message.radiotext() {
            info!(
                "[RDS] {:.1} MHz PI={} PS={} RT=\"{}\"",
                message.frequency_mhz,
                message.pi().unwrap_or("-"),
                message.ps().unwrap_or("-"),
                text
            );
        } else if message.is_identifying() {
            debug!(
                "[RDS] {:.1} MHz PI={} PS={} PTY={}",
                message.frequency_mhz,
                message.pi().unwrap_or("-"),
                message.ps().unwrap_or("-"),
                message.pty().map(pty_name).unwrap_or_else(|| "-".to_string())
            );
        }
        Ok(())
    }
}

/// Non-blocking fan-out of decoded messages to the sinks
#[derive(Clone)]
pub struct SinkDispatcher {
    tx: Sender<DecodedMessage>,
    dropped: Arc<AtomicU64>,
}

impl SinkDispatcher {
    /// Spawn the sink thread. It exits once every dispatcher clone is dropped.
    pub fn start(sinks: Vec<Box<dyn MessageSink>>, capacity: usize) -> Result<Self> {
        let (tx, rx) = bounded::<DecodedMessage>(capacity.max(1));

        thread::Builder::new()
            .name("message-sink".to_string())
            .spawn(move || run_sinks(sinks, rx))
            .context("Failed to spawn message sink thread")?;

        Ok(Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Queue a message; a full queue drops it. Returns whether it was queued.
    pub fn submit(&self, message: DecodedMessage) -> bool {
        match self.tx.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 100 == 0 {
                    warn!("[Sink] Queue full, {} messages dropped", dropped);
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn run_sinks(mut sinks: Vec<Box<dyn MessageSink>>, rx: Receiver<DecodedMessage>) {
    let names: Vec<String> = sinks.iter().map(|s| s.name().to_string()).collect();
    info!("[Sink] Dispatching to: {}", names.join(", "));

    for message in rx.iter() {
        for sink in sinks.iter_mut() {
            if let Err(e) = sink.accept(&message) {
                warn!("[Sink] {} rejected message: {:#}", sink.name(), e);
            }
        }
    }
    debug!("[Sink] Queue closed");
}
