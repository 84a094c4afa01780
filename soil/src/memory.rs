//! In-memory state bucket.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use forest_types::Revision;
use futures::StreamExt;
use observability_deps::tracing::debug;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::core::{
    key_matches, Soil, SoilConfig, SoilEntry, SoilError, SoilEvent, WatchStream,
};

/// An in-memory [`Soil`] bucket with per-key revision chains.
#[derive(Debug)]
pub struct MemorySoil {
    config: SoilConfig,
    state: Arc<Mutex<BucketState>>,
}

#[derive(Debug, Default)]
struct BucketState {
    keys: HashMap<String, KeyState>,
    watchers: Vec<Watcher>,
}

#[derive(Debug)]
struct KeyState {
    /// Highest revision ever assigned to this key; never reused, even after
    /// delete and re-create.
    last_revision: u64,
    /// Retained revisions, oldest first; `None` marks a delete.
    history: VecDeque<SoilEntry>,
}

impl KeyState {
    fn live_value(&self) -> Option<(&Value, Revision)> {
        let latest = self.history.back()?;
        latest.value.as_ref().map(|v| (v, latest.revision))
    }
}

#[derive(Debug)]
struct Watcher {
    pattern: String,
    tx: mpsc::UnboundedSender<SoilEvent>,
}

impl MemorySoil {
    /// Create an empty bucket.
    pub fn new(config: SoilConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(BucketState::default())),
        }
    }

    fn check_key(key: &str) -> Result<(), SoilError> {
        if key.is_empty() {
            return Err(SoilError::invalid_input("empty key"));
        }
        Ok(())
    }

    /// Record a mutation under the already-held lock and fan the event out.
    fn commit(
        &self,
        state: &mut BucketState,
        key: &str,
        value: Option<Value>,
    ) -> Revision {
        let key_state = state.keys.entry(key.to_string()).or_insert_with(|| KeyState {
            last_revision: 0,
            history: VecDeque::new(),
        });
        key_state.last_revision += 1;
        let revision = Revision::new(key_state.last_revision);
        key_state.history.push_back(SoilEntry {
            revision,
            value: value.clone(),
        });
        while key_state.history.len() > self.config.history_depth {
            key_state.history.pop_front();
        }

        let event = match value {
            Some(value) => SoilEvent::Put {
                key: key.to_string(),
                value,
                revision,
            },
            None => SoilEvent::Delete {
                key: key.to_string(),
                revision,
            },
        };
        state.watchers.retain(|watcher| {
            if !key_matches(&watcher.pattern, key) {
                return true;
            }
            watcher.tx.send(event.clone()).is_ok()
        });

        revision
    }
}

#[async_trait]
impl Soil for MemorySoil {
    async fn dig(&self, key: &str) -> Result<(Value, Revision), SoilError> {
        Self::check_key(key)?;
        let state = self.state.lock();
        state
            .keys
            .get(key)
            .and_then(|k| k.live_value())
            .map(|(value, revision)| (value.clone(), revision))
            .ok_or_else(|| SoilError::not_found(key))
    }

    async fn bury(
        &self,
        key: &str,
        value: Value,
        expected: Revision,
    ) -> Result<Revision, SoilError> {
        Self::check_key(key)?;
        let mut state = self.state.lock();

        let current = state.keys.get(key).and_then(|k| k.live_value()).map(|(_, r)| r);
        match (expected.is_zero(), current) {
            // Create: the key must not be live.
            (true, Some(current)) => Err(SoilError::already_exists(key, current)),
            (true, None) => Ok(self.commit(&mut state, key, Some(value))),
            // Update: the caller's view must still be current.
            (false, None) => Err(SoilError::not_found(key)),
            (false, Some(current)) if current != expected => {
                Err(SoilError::revision_mismatch(key, expected, current))
            }
            (false, Some(_)) => Ok(self.commit(&mut state, key, Some(value))),
        }
    }

    async fn put(&self, key: &str, value: Value) -> Result<Revision, SoilError> {
        Self::check_key(key)?;
        let mut state = self.state.lock();
        Ok(self.commit(&mut state, key, Some(value)))
    }

    async fn delete(&self, key: &str) -> Result<(), SoilError> {
        Self::check_key(key)?;
        let mut state = self.state.lock();
        if state
            .keys
            .get(key)
            .and_then(|k| k.live_value())
            .is_none()
        {
            return Err(SoilError::not_found(key));
        }
        let revision = self.commit(&mut state, key, None);
        debug!(key, %revision, "soil key deleted");
        Ok(())
    }

    async fn watch(&self, pattern: &str) -> Result<WatchStream, SoilError> {
        if pattern.is_empty() {
            return Err(SoilError::invalid_input("empty watch pattern"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().watchers.push(Watcher {
            pattern: pattern.to_string(),
            tx,
        });
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn keys(&self) -> Result<Vec<String>, SoilError> {
        let state = self.state.lock();
        let mut keys: Vec<_> = state
            .keys
            .iter()
            .filter(|(_, k)| k.live_value().is_some())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn history(&self, key: &str) -> Result<Vec<SoilEntry>, SoilError> {
        Self::check_key(key)?;
        let state = self.state.lock();
        let key_state = state.keys.get(key).ok_or_else(|| SoilError::not_found(key))?;
        Ok(key_state.history.iter().rev().cloned().collect())
    }
}
