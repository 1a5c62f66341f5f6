//! Band search: sweep → peak candidates → confirmatory listen per candidate
//!
//! The search task owns the receiver for its whole run. Progress is written only
//! by the search task and read through [`SearchProgress::snapshot`].

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::decoder::{ListenSession, SessionEnd};
use crate::device::{DeviceStats, DeviceToken, Tuning};
use crate::error::ReceiverError;
use crate::process::CommandProvider;
use crate::sink::SinkDispatcher;
use crate::sweep::{detect_peaks, run_sweep, PeakCandidate, PeakParams};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    Idle,
    Sweeping,
    Evaluating,
    Aborted,
    Complete,
}

impl SearchStatus {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Sweeping | Self::Evaluating)
    }
}

/// Observable state of the current (or last) search
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchSession {
    pub status: SearchStatus,
    pub candidates: Vec<PeakCandidate>,
    /// Candidates evaluated so far
    pub progress_index: usize,
    pub total_candidates: usize,
    pub stations_confirmed: usize,
    pub confirmed_frequencies: Vec<f64>,
    pub message: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
}

impl Default for SearchSession {
    fn default() -> Self {
        Self {
            status: SearchStatus::Idle,
            candidates: Vec::new(),
            progress_index: 0,
            total_candidates: 0,
            stations_confirmed: 0,
            confirmed_frequencies: Vec::new(),
            message: None,
            started_at: None,
        }
    }
}

/// Shared handle on the search progress
#[derive(Debug, Clone, Default)]
pub struct SearchProgress {
    inner: Arc<Mutex<SearchSession>>,
}

impl SearchProgress {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard(&self) -> MutexGuard<'_, SearchSession> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> SearchSession {
        self.guard().clone()
    }

    pub fn status(&self) -> SearchStatus {
        self.guard().status
    }

    /// Fresh session in `Sweeping`
    pub fn begin(&self) {
        *self.guard() = SearchSession {
            status: SearchStatus::Sweeping,
            message: Some("Sweeping band".to_string()),
            started_at: Some(Utc::now()),
            ..SearchSession::default()
        };
    }

    pub fn update<F: FnOnce(&mut SearchSession)>(&self, f: F) {
        f(&mut self.guard());
    }

    /// Terminal transition with a status text
    pub fn finish(&self, status: SearchStatus, message: impl Into<String>) {
        let mut session = self.guard();
        session.status = status;
        session.message = Some(message.into());
    }
}

/// Everything a search run needs besides the receiver token
#[derive(Clone)]
pub struct SearchContext {
    pub provider: Arc<dyn CommandProvider>,
    pub config: Config,
    pub sink: SinkDispatcher,
    pub stats: Arc<DeviceStats>,
    pub progress: SearchProgress,
}

/// Result of a search run and where the monitor should resume
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchOutcome {
    pub status: SearchStatus,
    pub resume: Tuning,
}

/// Run one full search. `origin` is the tuning before the search started.
///
/// Terminal states: `Complete` after every candidate was evaluated (resume on
/// the last confirmed station), `Aborted` when cancelled, `Idle` on zero
/// candidates or on a sweep/spawn failure (resume on `origin`).
pub async fn run_search(
    ctx: SearchContext,
    token: DeviceToken,
    origin: Tuning,
    cancel: CancellationToken,
) -> SearchOutcome {
    let SearchContext {
        provider,
        config,
        sink,
        stats,
        progress,
    } = ctx;

    info!("===========================================");
    info!("  Band search {:.1}-{:.1} MHz", config.band_start_mhz, config.band_end_mhz);
    info!("===========================================");
    debug!("[Search] Receiver held by {}", token.owner());

    let idle = |message: String| {
        warn!("[Search] {}", message);
        progress.finish(SearchStatus::Idle, message);
        SearchOutcome {
            status: SearchStatus::Idle,
            resume: origin,
        }
    };
    let aborted = || {
        info!("[Search] Aborted");
        progress.finish(SearchStatus::Aborted, "Search aborted");
        SearchOutcome {
            status: SearchStatus::Aborted,
            resume: origin,
        }
    };

    let samples = match run_sweep(provider.as_ref(), &config, origin.gain, &cancel, &stats).await {
        Ok(samples) => samples,
        Err(ReceiverError::Cancelled) => return aborted(),
        Err(e) => return idle(format!("Sweep failed: {}", e)),
    };

    let params = PeakParams {
        guard_mhz: config.peak_guard_mhz,
        ..PeakParams::new(config.squelch_db)
    };
    let candidates = detect_peaks(&samples, &params);
    info!(
        "[Search] {} candidates above {} dB",
        candidates.len(),
        config.squelch_db
    );

    if candidates.is_empty() {
        progress.finish(SearchStatus::Idle, "No stations found above squelch");
        token.release();
        return SearchOutcome {
            status: SearchStatus::Idle,
            resume: origin,
        };
    }

    progress.update(|s| {
        s.status = SearchStatus::Evaluating;
        s.total_candidates = candidates.len();
        s.candidates = candidates.clone();
        s.message = Some(format!("Evaluating {} candidates", candidates.len()));
    });

    let mut last_confirmed: Option<f64> = None;
    for (index, candidate) in candidates.iter().enumerate() {
        if cancel.is_cancelled() {
            return aborted();
        }

        tokio::select! {
            _ = cancel.cancelled() => return aborted(),
            _ = tokio::time::sleep(config.tune_settle) => {}
        }

        let tuning = origin.retuned(candidate.frequency_mhz);
        let opened =
            ListenSession::open(provider.as_ref(), &config, tuning, sink.clone(), stats.clone(), &cancel).await;
        let session = match opened {
            Ok(session) => session,
            Err(ReceiverError::Cancelled) => return aborted(),
            Err(e) => return idle(format!("Listen failed at {:.1} MHz: {}", candidate.frequency_mhz, e)),
        };

        let report = session.run_timeboxed(config.candidate_timeout, &cancel).await;
        if report.end == SessionEnd::Cancelled {
            return aborted();
        }

        if report.confirmed {
            info!(
                "[Search] Station at {:.1} MHz ({} messages)",
                candidate.frequency_mhz, report.messages
            );
            last_confirmed = Some(candidate.frequency_mhz);
        }

        progress.update(|s| {
            s.progress_index = index + 1;
            if report.confirmed {
                s.stations_confirmed += 1;
                s.confirmed_frequencies.push(candidate.frequency_mhz);
            }
        });
    }

    let session = progress.snapshot();
    info!(
        "[Search] Complete: {} of {} candidates confirmed",
        session.stations_confirmed, session.total_candidates
    );
    progress.finish(
        SearchStatus::Complete,
        format!("Found {} stations", session.stations_confirmed),
    );
    token.release();

    SearchOutcome {
        status: SearchStatus::Complete,
        resume: last_confirmed.map_or(origin, |f| origin.retuned(f)),
    }
}
