//! RDS Receiver - shared RTL-SDR arbitration for FM/RDS and DAB
//!
//! Supervises rtl_fm | redsea, rtl_power, welle-cli and rtl_fm | ffmpeg
//! pipelines on a single receiver, runs band searches and forwards decoded RDS
//! groups to the configured sinks. [`controller::ReceiverController`] is the
//! entry point; everything else is exposed for embedding and tests.

pub mod config;
pub mod console;
pub mod controller;
pub mod dab;
pub mod decoder;
pub mod device;
pub mod error;
pub mod process;
pub mod search;
pub mod sink;
pub mod sweep;
#[cfg(all(test, unix))]
mod testing;
pub mod tools;
