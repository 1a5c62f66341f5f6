//! External process supervision
//!
//! Radio tools (rtl_fm, redsea, rtl_power, welle-cli, ffmpeg) run as opaque
//! line- or byte-emitting pipelines. This module owns their lifecycle.

mod handle;
mod pipeline;
mod provider;

#[cfg(unix)]
pub use handle::group_alive;
pub use handle::{ProcessHandle, ReadOutcome, SpawnOptions};
pub use pipeline::{CommandSpec, PipelineSpec};
pub use provider::{spawn_with_retry, CommandProvider, SystemCommandProvider};
