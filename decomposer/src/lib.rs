//! The decomposer: a single worker (per durable consumer name) that
//! consumes the change log in slot order and projects every compost into
//! the state store.
//!
//! Projection is idempotent: replaying any prefix of the change log from
//! slot 0 converges the soil to the same state a single forward run would
//! have produced. Conflicts that can only arise from replay or from
//! concurrent writers (`AlreadyExists`, `NotFound`, `RevisionMismatch`) are
//! logged and skipped; the change log remains the source of truth for the
//! next slot.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use forest_types::{Action, Compost, Revision};
use humus::{Humus, HumusError, PendingCompost};
use observability_deps::tracing::{debug, error, info, warn};
use parking_lot::Mutex;
use soil::{Soil, SoilError, SoilErrorKind};
use tokio_util::sync::CancellationToken;

/// Errors surfaced by the projector lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum DecomposerError {
    /// `start` was called while the worker was not stopped.
    #[error("decomposer is already running")]
    AlreadyRunning,

    /// The change log rejected the consumer attach.
    #[error("change log error: {0}")]
    Humus(#[from] HumusError),
}

/// Configuration of the projector.
#[derive(Debug, Clone)]
pub struct DecomposerConfig {
    /// Durable consumer name; distinct names project independently.
    pub consumer_name: String,
    /// Stop the worker on unexpected soil errors instead of advancing past
    /// them. The failing compost is nak'd so a restarted projector sees it
    /// again.
    pub halt_on_failure: bool,
}

impl Default for DecomposerConfig {
    fn default() -> Self {
        Self {
            consumer_name: humus::DECOMPOSER_CONSUMER.to_string(),
            halt_on_failure: false,
        }
    }
}

/// Lifecycle state of the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecomposerState {
    /// No worker task exists.
    Stopped,
    /// `start` is attaching the consumer.
    Starting,
    /// The worker task is consuming.
    Running,
    /// `stop` is draining the in-flight compost.
    Stopping,
}

/// The change-log-to-state-store projector.
#[derive(Debug)]
pub struct Decomposer {
    humus: Humus,
    soil: Arc<dyn Soil>,
    config: DecomposerConfig,
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

#[derive(Debug)]
struct Shared {
    state: Mutex<DecomposerState>,
    /// Highest slot projected so far, for lag inspection.
    last_projected: AtomicU64,
}

#[derive(Debug)]
struct Worker {
    token: CancellationToken,
    join: tokio::task::JoinHandle<()>,
}

impl Decomposer {
    /// Build a projector over the given change log and state store.
    pub fn new(humus: Humus, soil: Arc<dyn Soil>, config: DecomposerConfig) -> Self {
        Self {
            humus,
            soil,
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(DecomposerState::Stopped),
                last_projected: AtomicU64::new(0),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DecomposerState {
        *self.shared.state.lock()
    }

    /// Attach the durable consumer and start the worker.
    ///
    /// Fails with [`DecomposerError::AlreadyRunning`] unless the worker is
    /// stopped.
    pub async fn start(&self) -> Result<(), DecomposerError> {
        {
            let mut state = self.shared.state.lock();
            if *state != DecomposerState::Stopped {
                return Err(DecomposerError::AlreadyRunning);
            }
            *state = DecomposerState::Starting;
        }

        let mut consumer = match self.humus.consumer(&self.config.consumer_name).await {
            Ok(consumer) => consumer,
            Err(e) => {
                *self.shared.state.lock() = DecomposerState::Stopped;
                return Err(e.into());
            }
        };

        let token = CancellationToken::new();
        let loop_token = token.clone();
        let soil = Arc::clone(&self.soil);
        let shared = Arc::clone(&self.shared);
        let halt_on_failure = self.config.halt_on_failure;
        let name = self.config.consumer_name.clone();

        // Transition before the worker exists so a worker that halts
        // immediately cannot be overwritten back to Running.
        *self.shared.state.lock() = DecomposerState::Running;

        let join = tokio::spawn(async move {
            info!(consumer = %name, "decomposer running");
            loop {
                let pending = tokio::select! {
                    _ = loop_token.cancelled() => break,
                    result = consumer.next() => match result {
                        Ok(pending) => pending,
                        Err(e) => {
                            error!(consumer = %name, %e, "change log consumer failed");
                            tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                            continue;
                        }
                    },
                };

                let slot = pending.compost().slot;
                match project(soil.as_ref(), pending.compost()).await {
                    Ok(()) => {
                        settle(&name, pending).await;
                        shared.last_projected.store(slot.get(), Ordering::Relaxed);
                    }
                    Err(e) if halt_on_failure => {
                        error!(
                            consumer = %name,
                            %slot,
                            %e,
                            "soil mutation failed, halting projector"
                        );
                        pending.nak();
                        break;
                    }
                    Err(e) => {
                        error!(
                            consumer = %name,
                            %slot,
                            %e,
                            "soil mutation failed, advancing anyway"
                        );
                        settle(&name, pending).await;
                        shared.last_projected.store(slot.get(), Ordering::Relaxed);
                    }
                }
            }
            *shared.state.lock() = DecomposerState::Stopped;
            info!(consumer = %name, "decomposer stopped");
        });

        *self.worker.lock() = Some(Worker { token, join });
        Ok(())
    }

    /// Cancel the worker and wait for the in-flight compost to finish.
    /// Idempotent.
    pub async fn stop(&self) {
        let worker = {
            let mut state = self.shared.state.lock();
            match *state {
                DecomposerState::Stopped => return,
                _ => *state = DecomposerState::Stopping,
            }
            self.worker.lock().take()
        };

        if let Some(worker) = worker {
            worker.token.cancel();
            if let Err(e) = worker.join.await {
                error!(%e, "decomposer task panicked");
            }
        }
        *self.shared.state.lock() = DecomposerState::Stopped;
    }

    /// How many appended composts the projector has not applied yet.
    pub async fn lag(&self) -> Result<u64, DecomposerError> {
        let watermark = self.humus.high_watermark().await?.get();
        let projected = self.shared.last_projected.load(Ordering::Relaxed);
        Ok(watermark.saturating_sub(1).saturating_sub(projected))
    }
}

async fn settle(name: &str, pending: PendingCompost) {
    if let Err(e) = pending.ack().await {
        error!(consumer = %name, %e, "compost ack failed");
    }
}

/// Apply one compost to the soil.
///
/// Benign replay/concurrency conflicts are logged and swallowed here; only
/// unexpected store failures surface to the worker loop.
async fn project(soil: &dyn Soil, compost: &Compost) -> Result<(), SoilError> {
    let entity = compost.entity.as_str();
    match compost.action {
        Action::Create => {
            let data = match &compost.data {
                Some(data) => data.clone(),
                None => {
                    warn!(entity, slot = %compost.slot, "create compost without payload, skipping");
                    return Ok(());
                }
            };
            match soil.bury(entity, data, Revision::ZERO).await {
                Ok(revision) => {
                    debug!(entity, %revision, "projected create");
                    Ok(())
                }
                Err(e) if e.kind() == SoilErrorKind::AlreadyExists => {
                    info!(entity, slot = %compost.slot, "create replayed onto existing key");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        Action::Update => {
            let data = match &compost.data {
                Some(data) => data.clone(),
                None => {
                    warn!(entity, slot = %compost.slot, "update compost without payload, skipping");
                    return Ok(());
                }
            };
            let expected = match soil.dig(entity).await {
                Ok((_, revision)) => revision,
                Err(e) if e.kind() == SoilErrorKind::NotFound => {
                    // Promote to create; the entity never made it into the
                    // soil (or was deleted since).
                    return match soil.bury(entity, data, Revision::ZERO).await {
                        Ok(revision) => {
                            debug!(entity, %revision, "projected update as create");
                            Ok(())
                        }
                        Err(e) if e.kind() == SoilErrorKind::AlreadyExists => {
                            info!(entity, slot = %compost.slot, "lost create race, log stays authoritative");
                            Ok(())
                        }
                        Err(e) => Err(e),
                    };
                }
                Err(e) => return Err(e),
            };
            match soil.bury(entity, data, expected).await {
                Ok(revision) => {
                    debug!(entity, %revision, "projected update");
                    Ok(())
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        SoilErrorKind::RevisionMismatch | SoilErrorKind::NotFound
                    ) =>
                {
                    // Another writer ran between dig and bury; the next slot
                    // will see the store's current shape.
                    info!(entity, slot = %compost.slot, "concurrent writer beat update, skipping");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        Action::Delete => match soil.delete(entity).await {
            Ok(()) => {
                debug!(entity, "projected delete");
                Ok(())
            }
            Err(e) if e.kind() == SoilErrorKind::NotFound => {
                info!(entity, slot = %compost.slot, "delete replayed onto absent key");
                Ok(())
            }
            Err(e) => Err(e),
        },
    }
}
