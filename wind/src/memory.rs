//! In-process bus implementation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use forest_types::{subject_matches, validate_pattern, Leaf};
use observability_deps::tracing::{error, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::codec;
use crate::core::{LeafHandler, Subscription, Wind, WindError};

/// In-memory [`Wind`]: subscribers live in this process and receive leaves
/// over unbounded channels, one delivery task per subscription.
#[derive(Debug, Default)]
pub struct MemoryWind {
    state: Mutex<BusState>,
}

#[derive(Debug, Default)]
struct BusState {
    /// Plain catches; every matching one receives a copy.
    catches: Vec<Arc<Receiver>>,
    /// Queue groups keyed by (pattern, group); one member per leaf.
    groups: HashMap<(String, String), GroupState>,
}

#[derive(Debug)]
struct GroupState {
    members: Vec<Arc<Receiver>>,
    next: AtomicUsize,
}

#[derive(Debug)]
struct Receiver {
    pattern: String,
    tx: mpsc::UnboundedSender<Vec<u8>>,
    token: CancellationToken,
}

impl Receiver {
    fn live(&self) -> bool {
        !self.token.is_cancelled()
    }
}

impl MemoryWind {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Route encoded payload bytes to current subscribers.
    fn publish_bytes(&self, subject: &str, payload: &[u8]) {
        let mut state = self.state.lock();

        state.catches.retain(|receiver| receiver.live());
        for receiver in &state.catches {
            if subject_matches(&receiver.pattern, subject) {
                // Send failures mean the delivery task is gone; the retain
                // above picks the entry up next time.
                let _ = receiver.tx.send(payload.to_vec());
            }
        }

        state.groups.retain(|_, group| {
            group.members.retain(|member| member.live());
            !group.members.is_empty()
        });
        for ((pattern, _), group) in &state.groups {
            if !subject_matches(pattern, subject) {
                continue;
            }
            let n = group.members.len();
            let start = group.next.fetch_add(1, Ordering::Relaxed);
            for i in 0..n {
                let member = &group.members[(start + i) % n];
                if member.tx.send(payload.to_vec()).is_ok() {
                    break;
                }
            }
        }
    }

    fn spawn_receiver(
        pattern: &str,
        handler: Arc<dyn LeafHandler>,
    ) -> (Arc<Receiver>, Subscription) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let token = CancellationToken::new();

        let task_token = token.clone();
        let task_pattern = pattern.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    msg = rx.recv() => {
                        let Some(payload) = msg else { break };
                        deliver(&task_pattern, &handler, &payload).await;
                    }
                }
            }
        });

        let receiver = Arc::new(Receiver {
            pattern: pattern.to_string(),
            tx,
            token: token.clone(),
        });
        (receiver, Subscription::new(token))
    }
}

/// Decode, re-validate and hand one payload to a handler. Never propagates;
/// bad payloads and handler failures are logged and dropped.
async fn deliver(pattern: &str, handler: &Arc<dyn LeafHandler>, payload: &[u8]) {
    let leaf = match codec::decode_leaf(payload) {
        Ok(leaf) => leaf,
        Err(e) => {
            warn!(pattern, %e, "dropping undecodable leaf payload");
            return;
        }
    };
    if let Err(e) = leaf.validate() {
        warn!(pattern, subject = %leaf.subject, %e, "dropping invalid inbound leaf");
        return;
    }
    if let Err(e) = handler.handle(leaf).await {
        error!(pattern, %e, "leaf handler failed");
    }
}

#[async_trait]
impl Wind for MemoryWind {
    async fn drop(&self, leaf: Leaf) -> Result<(), WindError> {
        leaf.validate()?;
        let payload = codec::encode_leaf(&leaf)?;
        self.publish_bytes(&leaf.subject, &payload);
        Ok(())
    }

    async fn catch(
        &self,
        pattern: &str,
        handler: Arc<dyn LeafHandler>,
    ) -> Result<Subscription, WindError> {
        validate_pattern(pattern).map_err(WindError::invalid_leaf)?;

        let (receiver, subscription) = Self::spawn_receiver(pattern, handler);
        self.state.lock().catches.push(receiver);
        Ok(subscription)
    }

    async fn catch_with_queue(
        &self,
        pattern: &str,
        group: &str,
        handler: Arc<dyn LeafHandler>,
    ) -> Result<Subscription, WindError> {
        validate_pattern(pattern).map_err(WindError::invalid_leaf)?;
        if group.is_empty() {
            return Err(WindError::internal("empty queue group name"));
        }

        let (receiver, subscription) = Self::spawn_receiver(pattern, handler);
        self.state
            .lock()
            .groups
            .entry((pattern.to_string(), group.to_string()))
            .or_insert_with(|| GroupState {
                members: Vec::new(),
                next: AtomicUsize::new(0),
            })
            .members
            .push(receiver);
        Ok(subscription)
    }
}
