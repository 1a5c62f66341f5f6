//! Receiver ownership and state

mod lock;
mod state;

pub use lock::{DeviceLock, DeviceOwner, DeviceToken};
pub use state::{DeviceStats, Gain, ReceiverMode, StatsSnapshot, Tuning};
