//! The tree contract: river → wind.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use forest_types::{Leaf, RiverData};
use observability_deps::tracing::{info, warn};
use parking_lot::Mutex;
use river::{ObserverHandle, River, RiverHandler};
use wind::{Wind, WindErrorKind};

use crate::GroveError;

/// A parser from raw river records to leaves.
#[async_trait]
pub trait Tree: Debug + Send + Sync + 'static {
    /// Unique component name; also the default `source` of emitted leaves.
    fn name(&self) -> &str;

    /// River subject patterns this tree observes.
    fn patterns(&self) -> Vec<String>;

    /// Parse one record. `Ok(Some(leaf))` drops the leaf onto the wind,
    /// `Ok(None)` skips the record, `Err` is logged and the record is still
    /// consumed (re-parsing raw bytes will not go differently).
    async fn parse(
        &self,
        data: RiverData,
    ) -> Result<Option<Leaf>, Box<dyn std::error::Error + Send + Sync>>;
}

/// Drives a [`Tree`]: one durable river observer per pattern, each parsed
/// leaf dropped onto the wind.
#[derive(Debug)]
pub struct TreeRunner {
    tree: Arc<dyn Tree>,
    river: River,
    wind: Arc<dyn Wind>,
    observers: Mutex<Vec<ObserverHandle>>,
    running: AtomicBool,
}

impl TreeRunner {
    /// Wire a tree between the river and the wind.
    pub fn new(tree: Arc<dyn Tree>, river: River, wind: Arc<dyn Wind>) -> Self {
        Self {
            tree,
            river,
            wind,
            observers: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// The wrapped tree's name.
    pub fn name(&self) -> &str {
        self.tree.name()
    }

    /// Attach the observers. Fails if already running.
    pub async fn start(&self) -> Result<(), GroveError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(GroveError::AlreadyRunning);
        }

        let patterns = self.tree.patterns();
        let mut observers = Vec::with_capacity(patterns.len());
        for (i, pattern) in patterns.iter().enumerate() {
            let handler = Arc::new(TreeHandler {
                tree: Arc::clone(&self.tree),
                wind: Arc::clone(&self.wind),
            });
            // One durable name per pattern: observers with different
            // patterns must not share a work queue.
            let consumer = format!("tree-{}-{i}", self.tree.name());
            let observer = self
                .river
                .observe_with_consumer(pattern, &consumer, handler)
                .await?;
            observers.push(observer);
        }
        *self.observers.lock() = observers;

        info!(tree = %self.tree.name(), "tree started");
        Ok(())
    }

    /// Detach the observers and drain in-flight parses. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let observers = std::mem::take(&mut *self.observers.lock());
        for observer in &observers {
            observer.stop().await;
        }
        info!(tree = %self.tree.name(), "tree stopped");
    }

    /// True while the observers are attached.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct TreeHandler {
    tree: Arc<dyn Tree>,
    wind: Arc<dyn Wind>,
}

#[async_trait]
impl RiverHandler for TreeHandler {
    async fn handle(
        &self,
        data: RiverData,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let subject = data.subject.clone();
        let mut leaf = match self.tree.parse(data).await {
            Ok(Some(leaf)) => leaf,
            Ok(None) => return Ok(()),
            Err(e) => {
                // Raw bytes will not parse differently on redelivery.
                warn!(tree = %self.tree.name(), %subject, %e, "tree failed to parse record");
                return Ok(());
            }
        };

        if leaf.source.is_empty() {
            leaf.source = self.tree.name().to_string();
        }

        match Wind::drop(&*self.wind, leaf).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == WindErrorKind::InvalidLeaf => {
                warn!(tree = %self.tree.name(), %subject, %e, "tree emitted an invalid leaf");
                Ok(())
            }
            // Transport trouble is worth a redelivery.
            Err(e) => Err(e.into()),
        }
    }
}
