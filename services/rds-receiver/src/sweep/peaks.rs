//! Station candidate extraction from a wideband power sweep
//!
//! A bin is a candidate when it clears the squelch and is strictly louder than
//! its two neighbours on each side (5-wide window). Bins without two neighbours
//! on both sides are never candidates. Candidates closer than the guard band to
//! the previously kept one are sidebands of the same station and are dropped.

use serde::Serialize;

/// Default merge distance between candidates
pub const DEFAULT_GUARD_MHZ: f64 = 0.15;

/// Neighbours compared on each side of a bin
const HALF_WINDOW: usize = 2;

/// One sweep bin
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PowerSample {
    pub frequency_mhz: f64,
    pub power_db: f64,
}

impl PowerSample {
    pub fn new(frequency_mhz: f64, power_db: f64) -> Self {
        Self {
            frequency_mhz,
            power_db,
        }
    }
}

/// A frequency that may carry a station
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PeakCandidate {
    pub frequency_mhz: f64,
    pub power_db: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakParams {
    pub squelch_db: f64,
    pub guard_mhz: f64,
}

impl PeakParams {
    pub fn new(squelch_db: f64) -> Self {
        Self {
            squelch_db,
            guard_mhz: DEFAULT_GUARD_MHZ,
        }
    }
}

/// Find station candidates in `samples` (ascending frequency, uniform step).
/// Output is ascending by frequency.
pub fn detect_peaks(samples: &[PowerSample], params: &PeakParams) -> Vec<PeakCandidate> {
    if samples.len() < 2 * HALF_WINDOW + 1 {
        return Vec::new();
    }

    let mut peaks: Vec<PeakCandidate> = (HALF_WINDOW..samples.len() - HALF_WINDOW)
        .filter_map(|i| {
            let sample = samples[i];
            if !(sample.power_db >= params.squelch_db) {
                return None;
            }

            let loudest_neighbour = samples[i - HALF_WINDOW..i]
                .iter()
                .chain(&samples[i + 1..=i + HALF_WINDOW])
                .map(|s| s.power_db)
                .fold(f64::NEG_INFINITY, f64::max);

            (sample.power_db > loudest_neighbour).then_some(PeakCandidate {
                frequency_mhz: sample.frequency_mhz,
                power_db: sample.power_db,
            })
        })
        .collect();

    peaks.sort_by(|a, b| a.frequency_mhz.total_cmp(&b.frequency_mhz));

    let mut kept: Vec<PeakCandidate> = Vec::with_capacity(peaks.len());
    for peak in peaks {
        match kept.last() {
            Some(last) if peak.frequency_mhz - last.frequency_mhz < params.guard_mhz => {}
            _ => kept.push(peak),
        }
    }
    kept
}
