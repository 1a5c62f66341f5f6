//! Exclusive ownership of the physical receiver
//!
//! There is no OS-level broker for the RTL-SDR, so every activity that wants the
//! tuner takes a [`DeviceToken`] first. Dropping the token releases the device.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{ReceiverError, Result};

/// Who is using the receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceOwner {
    Monitor,
    Search,
    Digital,
    AudioPassthrough,
}

impl fmt::Display for DeviceOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Monitor => write!(f, "monitor"),
            Self::Search => write!(f, "search"),
            Self::Digital => write!(f, "digital receiver"),
            Self::AudioPassthrough => write!(f, "audio pass-through"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Free,
    HeldBy { owner: DeviceOwner, token_id: u64 },
}

#[derive(Debug)]
struct Shared {
    state: LockState,
    next_token: u64,
}

/// Process-wide guard for the receiver. Clones share the same lock.
#[derive(Debug, Clone)]
pub struct DeviceLock {
    shared: Arc<Mutex<Shared>>,
}

impl Default for DeviceLock {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceLock {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                state: LockState::Free,
                next_token: 1,
            })),
        }
    }

    fn guard(&self) -> MutexGuard<'_, Shared> {
        // State is a plain enum; a panic elsewhere cannot leave it half-written.
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take the receiver, failing loudly if someone already holds it
    pub fn acquire(&self, owner: DeviceOwner) -> Result<DeviceToken> {
        let mut shared = self.guard();
        if let LockState::HeldBy { owner: held_by, .. } = shared.state {
            return Err(ReceiverError::ExclusivityViolation {
                requested: owner,
                held_by,
            });
        }

        let token_id = shared.next_token;
        shared.next_token += 1;
        shared.state = LockState::HeldBy { owner, token_id };
        debug!("[DeviceLock] acquired by {} (token {})", owner, token_id);

        Ok(DeviceToken {
            lock: self.clone(),
            owner,
            token_id,
        })
    }

    /// Current holder, if any
    pub fn holder(&self) -> Option<DeviceOwner> {
        match self.guard().state {
            LockState::Free => None,
            LockState::HeldBy { owner, .. } => Some(owner),
        }
    }

    pub fn is_free(&self) -> bool {
        self.holder().is_none()
    }

    /// Recovery path for the arbiter: free the device whoever holds it.
    /// The stale token becomes inert and will not free a later holder.
    pub fn force_release(&self) -> Option<DeviceOwner> {
        let mut shared = self.guard();
        match std::mem::replace(&mut shared.state, LockState::Free) {
            LockState::Free => None,
            LockState::HeldBy { owner, token_id } => {
                warn!(
                    "[DeviceLock] force-released from {} (token {})",
                    owner, token_id
                );
                Some(owner)
            }
        }
    }

    fn release_token(&self, token_id: u64, owner: DeviceOwner) {
        let mut shared = self.guard();
        match shared.state {
            LockState::HeldBy { token_id: held, .. } if held == token_id => {
                shared.state = LockState::Free;
                debug!("[DeviceLock] released by {} (token {})", owner, token_id);
            }
            _ => {
                debug!(
                    "[DeviceLock] stale token {} from {} ignored",
                    token_id, owner
                );
            }
        }
    }
}

/// Proof of ownership. Releases the device when dropped.
#[derive(Debug)]
pub struct DeviceToken {
    lock: DeviceLock,
    owner: DeviceOwner,
    token_id: u64,
}

impl DeviceToken {
    pub fn owner(&self) -> DeviceOwner {
        self.owner
    }

    /// Explicit release; equivalent to dropping the token
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for DeviceToken {
    fn drop(&mut self) {
        self.lock.release_token(self.token_id, self.owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_second_acquire_fails() {
        let lock = DeviceLock::new();
        let token = lock.acquire(DeviceOwner::Monitor).unwrap();
        assert_eq!(lock.holder(), Some(DeviceOwner::Monitor));

        match lock.acquire(DeviceOwner::Search) {
            Err(ReceiverError::ExclusivityViolation { requested, held_by }) => {
                assert_eq!(requested, DeviceOwner::Search);
                assert_eq!(held_by, DeviceOwner::Monitor);
            }
            other => panic!("expected exclusivity violation, got {:?}", other),
        }

        token.release();
        assert!(lock.is_free());
        assert!(lock.acquire(DeviceOwner::Search).is_ok());
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        let lock = DeviceLock::new();
        let barrier = Arc::new(Barrier::new(16));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let lock = lock.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let result = lock.acquire(DeviceOwner::Search);
                    // Hold a winning token until every thread has tried
                    barrier.wait();
                    result.is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert!(lock.is_free());
    }

    #[test]
    fn test_stale_token_does_not_release_new_holder() {
        let lock = DeviceLock::new();
        let stale = lock.acquire(DeviceOwner::Monitor).unwrap();
        assert_eq!(lock.force_release(), Some(DeviceOwner::Monitor));
        assert_eq!(lock.force_release(), None);

        let _digital = lock.acquire(DeviceOwner::Digital).unwrap();
        drop(stale);
        assert_eq!(lock.holder(), Some(DeviceOwner::Digital));
    }
}
