//! Channel lifecycle bookkeeping
//!
//! ```text
//! Absent --create--> Creating --opened--> Ready --destroy--> Destroying --closed--> Absent
//!                       |                                       ^
//!                       +------------failed--> Absent            |
//!                       +------------------destroy---------------+
//! ```
//!
//! Completions carry the generation handed out when the request started,
//! so a late completion for a channel that was torn down in the meantime
//! is ignored.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{EngineError, EngineResult};
use crate::types::{ChannelKey, StreamType, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelState {
    Absent,
    Creating,
    Ready,
    Destroying,
}

#[derive(Debug, Clone, Copy)]
struct ChannelEntry {
    state: ChannelState,
    generation: u64,
}

#[derive(Default)]
pub struct ChannelManager {
    entries: Mutex<HashMap<ChannelKey, ChannelEntry>>,
    next_generation: AtomicU64,
}

impl ChannelManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `Absent -> Creating`; returns the generation the completion must carry
    pub fn begin_create(&self, key: &ChannelKey) -> EngineResult<u64> {
        let mut entries = self.entries.lock();
        if let Some(existing) = entries.get(key) {
            return Err(match key {
                ChannelKey::Send(StreamType::VideoAux) => EngineError::invalid_operation(
                    "a screen-share send channel already exists in this room",
                ),
                _ => EngineError::invalid_operation(format!(
                    "channel {key} already exists ({:?})",
                    existing.state
                )),
            });
        }
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            key.clone(),
            ChannelEntry {
                state: ChannelState::Creating,
                generation,
            },
        );
        Ok(generation)
    }

    /// Apply an open completion; false when it is stale
    pub fn complete_create(&self, key: &ChannelKey, generation: u64, opened: bool) -> bool {
        let mut entries = self.entries.lock();
        let current = matches!(
            entries.get(key),
            Some(e) if e.generation == generation && e.state == ChannelState::Creating
        );
        if !current {
            return false;
        }
        if opened {
            if let Some(entry) = entries.get_mut(key) {
                entry.state = ChannelState::Ready;
            }
        } else {
            entries.remove(key);
        }
        true
    }

    /// `Ready | Creating -> Destroying`
    pub fn begin_destroy(&self, key: &ChannelKey) -> EngineResult<u64> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if matches!(entry.state, ChannelState::Ready | ChannelState::Creating) => {
                entry.state = ChannelState::Destroying;
                Ok(entry.generation)
            }
            Some(entry) => Err(EngineError::invalid_operation(format!(
                "channel {key} is {:?}",
                entry.state
            ))),
            None => Err(EngineError::invalid_operation(format!(
                "channel {key} does not exist"
            ))),
        }
    }

    /// `Destroying -> Absent`; false when it is stale
    pub fn complete_destroy(&self, key: &ChannelKey, generation: u64) -> bool {
        let mut entries = self.entries.lock();
        let current = matches!(
            entries.get(key),
            Some(e) if e.generation == generation && e.state == ChannelState::Destroying
        );
        if current {
            entries.remove(key);
        }
        current
    }

    #[must_use]
    pub fn state(&self, key: &ChannelKey) -> ChannelState {
        self.entries
            .lock()
            .get(key)
            .map_or(ChannelState::Absent, |e| e.state)
    }

    #[must_use]
    pub fn is_ready(&self, key: &ChannelKey) -> bool {
        self.state(key) == ChannelState::Ready
    }

    /// Fail fast unless frames may flow on the channel
    pub fn ensure_ready(&self, key: &ChannelKey) -> EngineResult<()> {
        match self.state(key) {
            ChannelState::Ready => Ok(()),
            state => Err(EngineError::invalid_operation(format!(
                "channel {key} is {state:?}, not Ready"
            ))),
        }
    }

    /// Receive channels currently tracked for a remote user
    #[must_use]
    pub fn keys_of_user(&self, user_id: &UserId) -> Vec<ChannelKey> {
        self.entries
            .lock()
            .keys()
            .filter(|k| k.remote_user() == Some(user_id))
            .cloned()
            .collect()
    }

    /// Drop a channel immediately, whatever its state
    pub fn remove(&self, key: &ChannelKey) -> Option<ChannelState> {
        self.entries.lock().remove(key).map(|e| e.state)
    }

    /// Forget every channel, returning what was tracked
    pub fn drain(&self) -> Vec<(ChannelKey, ChannelState)> {
        self.entries
            .lock()
            .drain()
            .map(|(k, e)| (k, e.state))
            .collect()
    }

    #[must_use]
    pub fn ready_send_channels(&self) -> Vec<StreamType> {
        let mut types: Vec<_> = self
            .entries
            .lock()
            .iter()
            .filter_map(|(k, e)| match k {
                ChannelKey::Send(t) if e.state == ChannelState::Ready => Some(*t),
                _ => None,
            })
            .collect();
        types.sort();
        types
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
