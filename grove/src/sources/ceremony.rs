//! Interval-beat ceremony source.
//!
//! Ceremonies keep time off the runtime heartbeat instead of a wall clock:
//! they count beat leaves on the wind and flow a ceremony record every
//! configured number of beats.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use forest_types::{Leaf, DANCE_BEAT_SUBJECT};
use observability_deps::tracing::{info, warn};
use parking_lot::Mutex;
use serde_json::json;
use wind::{LeafHandler, Subscription, Wind};

use crate::source::{Source, SourceContext};
use crate::GroveError;

/// Configuration of a ceremony.
#[derive(Debug, Clone)]
pub struct CeremonyConfig {
    /// Fire every this many beats; 0 is treated as 1.
    pub every_beats: u64,
    /// Subject the heartbeat is published under.
    pub beat_subject: String,
}

impl Default for CeremonyConfig {
    fn default() -> Self {
        Self {
            every_beats: 10,
            beat_subject: DANCE_BEAT_SUBJECT.to_string(),
        }
    }
}

/// A source that fires on a cadence counted in bus heartbeats.
#[derive(Debug)]
pub struct CeremonySource {
    name: String,
    config: CeremonyConfig,
    wind: Arc<dyn Wind>,
    beats: Arc<AtomicU64>,
    subscription: Mutex<Option<Subscription>>,
    running: AtomicBool,
}

impl CeremonySource {
    /// Build a ceremony listening for beats on `wind`.
    pub fn new(name: impl Into<String>, wind: Arc<dyn Wind>, config: CeremonyConfig) -> Self {
        Self {
            name: name.into(),
            config,
            wind,
            beats: Arc::new(AtomicU64::new(0)),
            subscription: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    /// Beats observed since start.
    pub fn beats(&self) -> u64 {
        self.beats.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
struct BeatHandler {
    name: String,
    every_beats: u64,
    beats: Arc<AtomicU64>,
    ctx: SourceContext,
}

#[async_trait]
impl LeafHandler for BeatHandler {
    async fn handle(
        &self,
        leaf: Leaf,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let count = self.beats.fetch_add(1, Ordering::Relaxed) + 1;
        if count % self.every_beats != 0 {
            return Ok(());
        }

        let payload = json!({
            "ceremony": self.name,
            "beat": count,
            "ts": leaf.timestamp.to_rfc3339(),
        });
        match self.ctx.flow(None, serde_json::to_vec(&payload)?).await {
            Ok(slot) => {
                info!(source = %self.name, beat = count, %slot, "ceremony fired");
                Ok(())
            }
            Err(e) => {
                warn!(source = %self.name, beat = count, %e, "ceremony failed to flow");
                Err(e.into())
            }
        }
    }
}

#[async_trait]
impl Source for CeremonySource {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_type(&self) -> &str {
        "ceremony"
    }

    async fn start(&self, ctx: SourceContext) -> Result<(), GroveError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(GroveError::AlreadyRunning);
        }

        let handler = Arc::new(BeatHandler {
            name: self.name.clone(),
            every_beats: self.config.every_beats.max(1),
            beats: Arc::clone(&self.beats),
            ctx,
        });

        let subscription = match self.wind.catch(&self.config.beat_subject, handler).await {
            Ok(subscription) => subscription,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        *self.subscription.lock() = Some(subscription);

        info!(
            source = %self.name,
            beat_subject = %self.config.beat_subject,
            every_beats = self.config.every_beats,
            "ceremony listening"
        );
        Ok(())
    }

    async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(subscription) = self.subscription.lock().take() {
            subscription.cancel();
        }
        info!(source = %self.name, "ceremony stopped");
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
