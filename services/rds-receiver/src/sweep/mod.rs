//! Wideband power sweep and station candidate detection

mod peaks;
mod power;

pub use peaks::{detect_peaks, PeakCandidate, PeakParams, DEFAULT_GUARD_MHZ};
pub use power::run_sweep;
#[cfg(test)]
pub use power::parse_power_row;
