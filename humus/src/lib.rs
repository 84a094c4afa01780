//! The humus: a strictly ordered, durable log of state-change records.
//!
//! Nims append composts; the log assigns each one a gap-free slot and files
//! it under `humus.<producer>.<action>`. A single consumer (per durable
//! name) observes records in slot order, which is what lets the decomposer
//! project them into the soil deterministically.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod codec;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use forest_stream::{Log, LogRecord, LogRetention, StreamError};
use forest_time::TimeProvider;
use forest_types::{Action, Compost, Slot, ValidationError};
use observability_deps::tracing::{error, info, warn};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Default durable consumer name of the decomposer.
pub const DECOMPOSER_CONSUMER: &str = "decomposer";

/// Errors surfaced by the change log.
#[derive(Debug, thiserror::Error)]
pub enum HumusError {
    /// The compost failed validation before it reached the log.
    #[error("invalid compost: {0}")]
    InvalidCompost(#[from] ValidationError),

    /// The backing log rejected the operation.
    #[error("change log error: {0}")]
    Stream(#[from] StreamError),
}

/// Configuration of the change log.
#[derive(Debug, Clone, Copy)]
pub struct HumusConfig {
    /// Retention of the backing log; overflow discards oldest.
    pub retention: LogRetention,
}

impl Default for HumusConfig {
    fn default() -> Self {
        Self {
            retention: LogRetention {
                max_age: Some(Duration::from_secs(7 * 24 * 60 * 60)),
                max_records: Some(1_000_000),
            },
        }
    }
}

/// Business logic invoked once per delivered compost, in slot order.
///
/// Failures are logged and the record is acknowledged anyway: the change log
/// must keep advancing, and the log itself remains the source of truth for
/// replays.
#[async_trait]
pub trait CompostHandler: Debug + Send + Sync + 'static {
    /// Handle one compost. `compost.slot` is populated from stream metadata.
    async fn handle(
        &self,
        compost: Compost,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// The change log.
#[derive(Debug, Clone)]
pub struct Humus {
    log: Arc<dyn Log>,
    time_provider: Arc<dyn TimeProvider>,
}

impl Humus {
    /// Wrap a log as the change log.
    pub fn new(log: Arc<dyn Log>, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self { log, time_provider }
    }

    /// Validate and append one state-change record, returning the slot the
    /// log assigned.
    ///
    /// For [`Action::Delete`] the payload is discarded and a null payload is
    /// stored; every other action requires one.
    pub async fn append(
        &self,
        producer: &str,
        entity: &str,
        action: Action,
        data: Option<Value>,
    ) -> Result<Slot, HumusError> {
        let compost = Compost::new(entity, action, data, producer, self.time_provider.now());
        compost.validate()?;

        let payload = codec::encode_compost(&compost)?;
        let record = LogRecord::new(compost.subject(), payload, compost.timestamp);
        Ok(self.log.append(record).await?)
    }

    /// Consume the change log under the default decomposer consumer.
    pub async fn decompose(
        &self,
        handler: Arc<dyn CompostHandler>,
    ) -> Result<DecomposeHandle, HumusError> {
        self.decompose_with_consumer(DECOMPOSER_CONSUMER, handler)
            .await
    }

    /// Consume the change log under a caller-chosen durable name, enabling
    /// independent projectors or replay from the earliest retained slot.
    pub async fn decompose_with_consumer(
        &self,
        name: &str,
        handler: Arc<dyn CompostHandler>,
    ) -> Result<DecomposeHandle, HumusError> {
        let mut consumer = self.consumer(name).await?;

        let token = CancellationToken::new();
        let loop_token = token.clone();
        let loop_name = name.to_string();

        let join = tokio::spawn(async move {
            info!(consumer = %loop_name, "decompose consumer attached");
            loop {
                let pending = tokio::select! {
                    _ = loop_token.cancelled() => break,
                    result = consumer.next() => match result {
                        Ok(pending) => pending,
                        Err(e) => {
                            error!(consumer = %loop_name, %e, "change log consumer failed");
                            tokio::time::sleep(Duration::from_millis(200)).await;
                            continue;
                        }
                    },
                };

                if let Err(e) = handler.handle(pending.compost().clone()).await {
                    // Ack regardless: the log stays the source of truth and
                    // must keep advancing.
                    error!(
                        consumer = %loop_name,
                        slot = %pending.compost().slot,
                        %e,
                        "compost handler failed, advancing anyway"
                    );
                }

                if let Err(e) = pending.ack().await {
                    error!(consumer = %loop_name, %e, "compost ack failed");
                }
            }
            info!(consumer = %loop_name, "decompose consumer detached");
        });

        Ok(DecomposeHandle {
            name: name.to_string(),
            token,
            join: parking_lot::Mutex::new(Some(join)),
        })
    }

    /// Attach a typed pull consumer under a durable name.
    ///
    /// This is the lower-level surface the decomposer is built on: the
    /// caller settles every compost explicitly and can nak to hold its
    /// position. Undecodable records are logged and settled internally;
    /// they never surface.
    pub async fn consumer(&self, name: &str) -> Result<CompostConsumer, HumusError> {
        let inner = self.log.consumer(name).await?;
        Ok(CompostConsumer {
            name: name.to_string(),
            inner,
        })
    }

    /// The next slot the change log will assign.
    pub async fn high_watermark(&self) -> Result<Slot, HumusError> {
        Ok(self.log.high_watermark().await?)
    }
}

/// A typed pull consumer over the change log.
#[derive(Debug)]
pub struct CompostConsumer {
    name: String,
    inner: Box<dyn forest_stream::LogConsumer>,
}

impl CompostConsumer {
    /// The durable consumer name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Await the next compost, in slot order for a lone handle.
    pub async fn next(&mut self) -> Result<PendingCompost, HumusError> {
        loop {
            let pending = self.inner.next().await?;
            match codec::decode_compost(pending.record()) {
                Ok(compost) => {
                    return Ok(PendingCompost { compost, pending });
                }
                Err(e) => {
                    // A record that cannot parse never will; settle it out
                    // of the way rather than wedge the ordered stream.
                    warn!(
                        consumer = %self.name,
                        slot = %pending.record().slot,
                        %e,
                        "dropping undecodable compost"
                    );
                    if let Err(e) = pending.ack().await {
                        error!(consumer = %self.name, %e, "compost ack failed");
                    }
                }
            }
        }
    }
}

/// A delivered compost awaiting settlement. Dropping it unsettled counts as
/// a nak.
#[derive(Debug)]
pub struct PendingCompost {
    compost: Compost,
    pending: forest_stream::PendingRecord,
}

impl PendingCompost {
    /// The delivered compost, `slot` populated from stream metadata.
    pub fn compost(&self) -> &Compost {
        &self.compost
    }

    /// How many times this compost has been delivered, this delivery
    /// included.
    pub fn delivery_count(&self) -> u32 {
        self.pending.delivery_count()
    }

    /// Acknowledge: the compost is consumed.
    pub async fn ack(self) -> Result<(), HumusError> {
        Ok(self.pending.ack().await?)
    }

    /// Negative-acknowledge: hold the position and redeliver.
    pub fn nak(self) {
        self.pending.nak();
    }
}

/// Handle onto a running decompose loop.
///
/// Dropping the handle cancels the loop without waiting for it; use
/// [`DecomposeHandle::stop`] for a drained shutdown.
#[derive(Debug)]
pub struct DecomposeHandle {
    name: String,
    token: CancellationToken,
    join: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl DecomposeHandle {
    /// The durable consumer name this loop reads under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancel the loop and wait for the in-flight record to finish.
    /// Idempotent.
    pub async fn stop(&self) {
        self.token.cancel();
        let join = self.join.lock().take();
        if let Some(join) = join {
            if let Err(e) = join.await {
                error!(consumer = %self.name, %e, "decompose task panicked");
            }
        }
    }
}

impl Drop for DecomposeHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use forest_stream::memory::MemoryLog;
    use forest_stream::LogWriting;
    use forest_time::SystemProvider;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn humus() -> Humus {
        let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemProvider::new());
        let log = Arc::new(MemoryLog::new(
            HumusConfig::default().retention,
            Arc::clone(&time_provider),
        ));
        Humus::new(log, time_provider)
    }

    #[derive(Debug)]
    struct ForwardingHandler {
        tx: mpsc::UnboundedSender<Compost>,
    }

    #[async_trait]
    impl CompostHandler for ForwardingHandler {
        async fn handle(
            &self,
            compost: Compost,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.tx.send(compost)?;
            Ok(())
        }
    }

    fn forwarding() -> (Arc<dyn CompostHandler>, mpsc::UnboundedReceiver<Compost>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ForwardingHandler { tx }), rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Compost>) -> Compost {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("compost should arrive")
            .expect("channel open")
    }

    #[tokio::test]
    async fn append_assigns_increasing_slots() {
        let humus = humus();

        let mut last = 0;
        for i in 0..5 {
            let slot = humus
                .append("growth", &format!("users/u{i}"), Action::Create, Some(json!({"i": i})))
                .await
                .unwrap();
            assert!(slot.get() > last);
            assert_eq!(slot.get(), last + 1);
            last = slot.get();
        }
    }

    #[tokio::test]
    async fn append_validates_composts() {
        let humus = humus();

        assert_matches!(
            humus.append("growth", "", Action::Create, Some(json!({}))).await,
            Err(HumusError::InvalidCompost(_))
        );
        assert_matches!(
            humus.append("", "users/u1", Action::Create, Some(json!({}))).await,
            Err(HumusError::InvalidCompost(_))
        );
        assert_matches!(
            humus.append("growth", "users/u1", Action::Update, None).await,
            Err(HumusError::InvalidCompost(_))
        );

        // Deletes carry no payload, even when one is supplied.
        let slot = humus
            .append("growth", "users/u1", Action::Delete, Some(json!({"x": 1})))
            .await
            .unwrap();
        assert_eq!(slot.get(), 1);
    }

    #[tokio::test]
    async fn decompose_observes_slot_order() {
        test_helpers::maybe_start_logging();
        let humus = humus();

        humus
            .append("growth", "users/u1", Action::Create, Some(json!({"n": "A"})))
            .await
            .unwrap();
        humus
            .append("growth", "users/u1", Action::Update, Some(json!({"n": "B"})))
            .await
            .unwrap();
        humus
            .append("growth", "users/u1", Action::Delete, None)
            .await
            .unwrap();

        let (handler, mut rx) = forwarding();
        let consumer = humus.decompose(handler).await.unwrap();

        let first = recv(&mut rx).await;
        assert_eq!(first.slot, Slot::new(1));
        assert_eq!(first.action, Action::Create);
        assert_eq!(first.entity, "users/u1");
        assert_eq!(first.producer, "growth");
        assert_eq!(first.data, Some(json!({"n": "A"})));

        let second = recv(&mut rx).await;
        assert_eq!(second.slot, Slot::new(2));
        assert_eq!(second.action, Action::Update);

        let third = recv(&mut rx).await;
        assert_eq!(third.slot, Slot::new(3));
        assert_eq!(third.action, Action::Delete);
        assert_eq!(third.data, None);

        consumer.stop().await;
    }

    #[tokio::test]
    async fn handler_failure_still_advances() {
        #[derive(Debug)]
        struct GrumpyHandler {
            tx: mpsc::UnboundedSender<Compost>,
        }

        #[async_trait]
        impl CompostHandler for GrumpyHandler {
            async fn handle(
                &self,
                compost: Compost,
            ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
                let fail = compost.slot == Slot::new(1);
                self.tx.send(compost)?;
                if fail {
                    return Err("projection hiccup".into());
                }
                Ok(())
            }
        }

        let humus = humus();
        humus
            .append("growth", "a", Action::Create, Some(json!(1)))
            .await
            .unwrap();
        humus
            .append("growth", "b", Action::Create, Some(json!(2)))
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _consumer = humus
            .decompose(Arc::new(GrumpyHandler { tx }))
            .await
            .unwrap();

        // Slot 1 fails but is acked; slot 2 follows without redelivery of 1.
        assert_eq!(recv(&mut rx).await.slot, Slot::new(1));
        assert_eq!(recv(&mut rx).await.slot, Slot::new(2));
    }

    #[tokio::test]
    async fn undecodable_records_are_skipped() {
        test_helpers::maybe_start_logging();
        let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemProvider::new());
        let log = Arc::new(MemoryLog::new(
            HumusConfig::default().retention,
            Arc::clone(&time_provider),
        ));
        let humus = Humus::new(Arc::clone(&log) as _, Arc::clone(&time_provider));

        // A rogue writer leaves bytes the codec cannot parse.
        log.append(LogRecord::new(
            "humus.rogue.create",
            b"garbage".to_vec(),
            time_provider.now(),
        ))
        .await
        .unwrap();
        humus
            .append("growth", "a", Action::Create, Some(json!(1)))
            .await
            .unwrap();

        let mut consumer = humus.consumer("skipper").await.unwrap();
        let pending = consumer.next().await.unwrap();
        assert_eq!(pending.compost().slot, Slot::new(2));
        pending.ack().await.unwrap();
    }

    #[tokio::test]
    async fn independent_consumers_replay() {
        let humus = humus();
        humus
            .append("growth", "a", Action::Create, Some(json!(1)))
            .await
            .unwrap();

        let (handler, mut rx) = forwarding();
        let first = humus.decompose(handler).await.unwrap();
        assert_eq!(recv(&mut rx).await.slot, Slot::new(1));
        first.stop().await;

        // A second durable name starts again from the earliest slot.
        let (handler, mut rx) = forwarding();
        let second = humus
            .decompose_with_consumer("replayer", handler)
            .await
            .unwrap();
        assert_eq!(recv(&mut rx).await.slot, Slot::new(1));
        second.stop().await;
    }
}
