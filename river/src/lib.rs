//! The river: durable ingress stream for raw external data.
//!
//! Sources flow raw bytes in under `river.`-prefixed subjects; observers
//! consume them at-least-once through named durable consumers. Delivery is
//! work-queued: handles sharing a consumer name split the records between
//! them, distinct names get independent positions.
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
use forest_types::{subject_matches, validate_pattern, RiverData, Slot, ValidationError};
use observability_deps::tracing::{error, info, warn};
use tokio_util::sync::CancellationToken;

/// Errors surfaced by the ingress stream.
#[derive(Debug, thiserror::Error)]
pub enum RiverError {
    /// The input failed validation before it reached the log.
    #[error("invalid ingress input: {0}")]
    InvalidInput(#[from] ValidationError),

    /// The backing log rejected the operation.
    #[error("ingress log error: {0}")]
    Stream(#[from] StreamError),
}

/// Configuration of the ingress stream.
#[derive(Debug, Clone, Copy)]
pub struct RiverConfig {
    /// Retention of the backing log; overflow discards oldest.
    pub retention: LogRetention,
    /// Give up on a record after this many failed deliveries.
    pub max_deliver: u32,
    /// Pause an observer loop this long after a failed delivery, so
    /// redelivery does not spin hot.
    pub redeliver_delay: Duration,
}

impl Default for RiverConfig {
    fn default() -> Self {
        Self {
            retention: LogRetention {
                max_age: Some(Duration::from_secs(24 * 60 * 60)),
                max_records: Some(1_000_000),
            },
            max_deliver: 5,
            redeliver_delay: Duration::from_millis(200),
        }
    }
}

/// Business logic invoked once per delivered ingress record.
///
/// Returning `Ok` acknowledges the record; returning `Err` schedules it for
/// redelivery.
#[async_trait]
pub trait RiverHandler: Debug + Send + Sync + 'static {
    /// Handle one ingress record.
    async fn handle(
        &self,
        data: RiverData,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// The ingress stream.
#[derive(Debug, Clone)]
pub struct River {
    log: Arc<dyn Log>,
    time_provider: Arc<dyn TimeProvider>,
    config: RiverConfig,
}

impl River {
    /// Wrap a log as the ingress stream.
    pub fn new(
        log: Arc<dyn Log>,
        time_provider: Arc<dyn TimeProvider>,
        config: RiverConfig,
    ) -> Self {
        Self {
            log,
            time_provider,
            config,
        }
    }

    /// Append raw external data under `subject`, prepending the `river.`
    /// prefix when absent. Returns the slot the log assigned.
    pub async fn flow(&self, subject: &str, data: Vec<u8>) -> Result<Slot, RiverError> {
        if subject.is_empty() {
            return Err(ValidationError::EmptySubject.into());
        }
        if data.is_empty() {
            return Err(ValidationError::MissingData.into());
        }

        let river_data = RiverData::new(subject, data, self.time_provider.now());
        river_data.validate()?;

        let payload = codec::encode_river_data(&river_data)?;
        let record = LogRecord::new(river_data.subject, payload, river_data.timestamp);
        Ok(self.log.append(record).await?)
    }

    /// Durable subscription under a fresh consumer name.
    pub async fn observe(
        &self,
        pattern: &str,
        handler: Arc<dyn RiverHandler>,
    ) -> Result<ObserverHandle, RiverError> {
        let name = format!("obs-{}", uuid::Uuid::new_v4());
        self.observe_with_consumer(pattern, &name, handler).await
    }

    /// Durable subscription under a caller-chosen consumer name.
    ///
    /// Handles sharing `name` cooperate as a work queue; distinct names hold
    /// independent positions in the stream.
    pub async fn observe_with_consumer(
        &self,
        pattern: &str,
        name: &str,
        handler: Arc<dyn RiverHandler>,
    ) -> Result<ObserverHandle, RiverError> {
        validate_pattern(pattern)?;
        let mut consumer = self.log.consumer(name).await?;

        let token = CancellationToken::new();
        let loop_token = token.clone();
        let loop_pattern = pattern.to_string();
        let loop_name = name.to_string();
        let config = self.config;

        let join = tokio::spawn(async move {
            info!(consumer = %loop_name, pattern = %loop_pattern, "river observer attached");
            loop {
                let pending = tokio::select! {
                    _ = loop_token.cancelled() => break,
                    result = consumer.next() => match result {
                        Ok(pending) => pending,
                        Err(e) => {
                            error!(consumer = %loop_name, %e, "river consumer failed");
                            tokio::time::sleep(config.redeliver_delay).await;
                            continue;
                        }
                    },
                };

                // Records under foreign subjects are not this observer's
                // work; settle them out of the way.
                if !subject_matches(&loop_pattern, &pending.record().subject) {
                    if let Err(e) = pending.ack().await {
                        error!(consumer = %loop_name, %e, "river ack failed");
                    }
                    continue;
                }

                let deliveries = pending.delivery_count();
                let outcome = match codec::decode_river_data(pending.record()) {
                    Ok(data) => handler.handle(data).await,
                    Err(e) => Err(e.into()),
                };

                match outcome {
                    Ok(()) => {
                        if let Err(e) = pending.ack().await {
                            error!(consumer = %loop_name, %e, "river ack failed");
                        }
                    }
                    Err(e) if deliveries >= config.max_deliver => {
                        // Poison record: settle it so it cannot starve the
                        // queue, and leave a loud trace.
                        error!(
                            consumer = %loop_name,
                            slot = %pending.record().slot,
                            deliveries,
                            %e,
                            "giving up on ingress record"
                        );
                        if let Err(e) = pending.ack().await {
                            error!(consumer = %loop_name, %e, "river ack failed");
                        }
                    }
                    Err(e) => {
                        warn!(
                            consumer = %loop_name,
                            slot = %pending.record().slot,
                            deliveries,
                            %e,
                            "ingress record failed, scheduling redelivery"
                        );
                        pending.nak();
                        tokio::time::sleep(config.redeliver_delay).await;
                    }
                }
            }
            info!(consumer = %loop_name, "river observer detached");
        });

        Ok(ObserverHandle {
            name: name.to_string(),
            token,
            join: parking_lot::Mutex::new(Some(join)),
        })
    }

    /// The next slot the ingress log will assign.
    pub async fn high_watermark(&self) -> Result<Slot, RiverError> {
        Ok(self.log.high_watermark().await?)
    }
}

/// Handle onto a running observer loop.
///
/// Dropping the handle cancels the loop without waiting for it; use
/// [`ObserverHandle::stop`] for a drained shutdown.
#[derive(Debug)]
pub struct ObserverHandle {
    name: String,
    token: CancellationToken,
    join: parking_lot::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ObserverHandle {
    /// The durable consumer name this observer reads under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Cancel the loop and wait for the in-flight delivery to finish.
    /// Idempotent.
    pub async fn stop(&self) {
        self.token.cancel();
        let join = self.join.lock().take();
        if let Some(join) = join {
            if let Err(e) = join.await {
                error!(consumer = %self.name, %e, "observer task panicked");
            }
        }
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use forest_stream::memory::MemoryLog;
    use forest_time::SystemProvider;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::mpsc;

    fn river() -> River {
        let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemProvider::new());
        let config = RiverConfig {
            redeliver_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let log = Arc::new(MemoryLog::new(config.retention, Arc::clone(&time_provider)));
        River::new(log, time_provider, config)
    }

    #[derive(Debug)]
    struct ForwardingHandler {
        tx: mpsc::UnboundedSender<RiverData>,
    }

    #[async_trait]
    impl RiverHandler for ForwardingHandler {
        async fn handle(
            &self,
            data: RiverData,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.tx.send(data)?;
            Ok(())
        }
    }

    fn forwarding() -> (Arc<dyn RiverHandler>, mpsc::UnboundedReceiver<RiverData>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(ForwardingHandler { tx }), rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<RiverData>) -> RiverData {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("record should arrive")
            .expect("channel open")
    }

    #[tokio::test]
    async fn flow_prefixes_and_assigns_slots() {
        let river = river();

        let s1 = river.flow("github.push", b"one".to_vec()).await.unwrap();
        let s2 = river
            .flow("river.github.push", b"two".to_vec())
            .await
            .unwrap();
        assert_eq!(s1.get(), 1);
        assert_eq!(s2.get(), 2);
    }

    #[tokio::test]
    async fn flow_rejects_empty_input() {
        let river = river();

        assert_matches!(
            river.flow("", b"x".to_vec()).await,
            Err(RiverError::InvalidInput(_))
        );
        assert_matches!(
            river.flow("s.u", Vec::new()).await,
            Err(RiverError::InvalidInput(_))
        );
    }

    #[tokio::test]
    async fn observe_delivers_and_acks() {
        test_helpers::maybe_start_logging();
        let river = river();

        let (handler, mut rx) = forwarding();
        let observer = river.observe("river.github.>", handler).await.unwrap();

        river.flow("github.push", b"payload-1".to_vec()).await.unwrap();
        river.flow("github.push", b"payload-2".to_vec()).await.unwrap();

        let first = recv(&mut rx).await;
        assert_eq!(first.subject, "river.github.push");
        assert_eq!(first.data, b"payload-1");
        assert_eq!(recv(&mut rx).await.data, b"payload-2");

        observer.stop().await;
        observer.stop().await;
    }

    #[tokio::test]
    async fn observe_skips_non_matching_subjects() {
        let river = river();

        let (handler, mut rx) = forwarding();
        let _observer = river.observe("river.github.>", handler).await.unwrap();

        river.flow("gitlab.push", b"skip me".to_vec()).await.unwrap();
        river.flow("github.push", b"take me".to_vec()).await.unwrap();

        assert_eq!(recv(&mut rx).await.data, b"take me");
    }

    #[tokio::test]
    async fn failed_records_are_redelivered() {
        #[derive(Debug)]
        struct FlakyHandler {
            attempts: AtomicU32,
            tx: mpsc::UnboundedSender<RiverData>,
        }

        #[async_trait]
        impl RiverHandler for FlakyHandler {
            async fn handle(
                &self,
                data: RiverData,
            ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
                if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err("transient".into());
                }
                self.tx.send(data)?;
                Ok(())
            }
        }

        let river = river();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handler = Arc::new(FlakyHandler {
            attempts: AtomicU32::new(0),
            tx,
        });
        let _observer = river
            .observe_with_consumer("river.>", "flaky", handler)
            .await
            .unwrap();

        river.flow("x.y", b"retry me".to_vec()).await.unwrap();

        let delivered = recv(&mut rx).await;
        assert_eq!(delivered.data, b"retry me");
    }

    #[tokio::test]
    async fn shared_consumer_name_splits_work() {
        let river = river();

        let (handler_a, mut rx_a) = forwarding();
        let (handler_b, mut rx_b) = forwarding();
        let _obs_a = river
            .observe_with_consumer("river.>", "pool", handler_a)
            .await
            .unwrap();
        let _obs_b = river
            .observe_with_consumer("river.>", "pool", handler_b)
            .await
            .unwrap();

        for i in 0..4 {
            river
                .flow("jobs.batch", format!("job-{i}").into_bytes())
                .await
                .unwrap();
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut total = 0;
        while rx_a.try_recv().is_ok() {
            total += 1;
        }
        while rx_b.try_recv().is_ok() {
            total += 1;
        }
        assert_eq!(total, 4);
    }

    #[tokio::test]
    async fn distinct_consumer_names_see_everything() {
        let river = river();

        river.flow("x.y", b"early".to_vec()).await.unwrap();

        let (handler_a, mut rx_a) = forwarding();
        let (handler_b, mut rx_b) = forwarding();
        let _obs_a = river
            .observe_with_consumer("river.>", "first", handler_a)
            .await
            .unwrap();
        let _obs_b = river
            .observe_with_consumer("river.>", "second", handler_b)
            .await
            .unwrap();

        assert_eq!(recv(&mut rx_a).await.data, b"early");
        assert_eq!(recv(&mut rx_b).await.data, b"early");
    }
}
