//! In-memory log engine.
//!
//! The default engine for in-process forests and tests. Durable only for the
//! lifetime of the process; everything else (slots, retention, named
//! work-queue consumers, redelivery) behaves exactly like the file engine.

use std::sync::Arc;

use async_trait::async_trait;
use forest_time::TimeProvider;
use forest_types::Slot;

use crate::core::{
    LogConsumer, LogReading, LogRecord, LogRetention, LogWriting, PendingRecord, RecordAcker,
    StreamError,
};
use crate::state::{ConsumerShared, LogState};

/// An in-memory, retention-limited, sequenced log.
#[derive(Debug)]
pub struct MemoryLog {
    state: Arc<LogState>,
}

impl MemoryLog {
    /// Create an empty log with the given limits and clock.
    pub fn new(retention: LogRetention, time_provider: Arc<dyn TimeProvider>) -> Self {
        Self {
            state: Arc::new(LogState::new(
                retention,
                time_provider,
                Default::default(),
                1,
            )),
        }
    }
}

#[async_trait]
impl LogWriting for MemoryLog {
    async fn append(&self, record: LogRecord) -> Result<Slot, StreamError> {
        record.validate()?;
        let (slot, _evicted) = self.state.sequence_and_publish(record);
        self.state.notify.notify_waiters();
        Ok(slot)
    }

    async fn high_watermark(&self) -> Result<Slot, StreamError> {
        Ok(Slot::new(self.state.watermark()))
    }
}

#[async_trait]
impl LogReading for MemoryLog {
    async fn consumer(&self, name: &str) -> Result<Box<dyn LogConsumer>, StreamError> {
        if name.is_empty() {
            return Err(StreamError::invalid_input("empty consumer name"));
        }

        let consumer = self.state.get_or_create_consumer(name, None);
        Ok(Box::new(MemoryConsumer {
            state: Arc::clone(&self.state),
            consumer,
        }))
    }
}

#[derive(Debug)]
struct MemoryConsumer {
    state: Arc<LogState>,
    consumer: Arc<ConsumerShared>,
}

#[async_trait]
impl LogConsumer for MemoryConsumer {
    async fn next(&mut self) -> Result<PendingRecord, StreamError> {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            // Register for wakeups before checking, so an append between the
            // check and the await cannot be missed.
            notified.as_mut().enable();

            if let Some((record, delivery_count)) = self.state.try_next(&self.consumer) {
                let acker = Arc::new(MemoryAcker {
                    state: Arc::clone(&self.state),
                    consumer: Arc::clone(&self.consumer),
                });
                return Ok(PendingRecord::new(record, delivery_count, acker));
            }

            notified.await;
        }
    }
}

#[derive(Debug)]
struct MemoryAcker {
    state: Arc<LogState>,
    consumer: Arc<ConsumerShared>,
}

#[async_trait]
impl RecordAcker for MemoryAcker {
    async fn ack(&self, slot: Slot) -> Result<(), StreamError> {
        self.state.ack(&self.consumer, slot);
        Ok(())
    }

    fn nak(&self, slot: Slot) {
        self.state.nak(&self.consumer, slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_utils::{perform_generic_tests, TestAdapter};
    use crate::core::Log;
    use forest_time::{MockProvider, Time};
    use std::time::Duration;

    struct MemoryTestAdapter;

    #[async_trait]
    impl TestAdapter for MemoryTestAdapter {
        async fn new_log(
            &self,
            retention: LogRetention,
            time_provider: Arc<dyn TimeProvider>,
        ) -> Arc<dyn Log> {
            Arc::new(MemoryLog::new(retention, time_provider))
        }
    }

    #[tokio::test]
    async fn generic_engine_behavior() {
        test_helpers::maybe_start_logging();
        perform_generic_tests(MemoryTestAdapter).await;
    }

    #[tokio::test]
    async fn eviction_during_pending_redelivery_is_tolerated() {
        let time_provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));
        let log = MemoryLog::new(
            LogRetention {
                max_age: Some(Duration::from_secs(1)),
                ..Default::default()
            },
            Arc::clone(&time_provider) as _,
        );

        log.append(LogRecord::new(
            "t.a",
            b"doomed".to_vec(),
            time_provider.now(),
        ))
        .await
        .unwrap();

        let mut consumer = log.consumer("c").await.unwrap();
        let pending = consumer.next().await.unwrap();
        pending.nak();

        // Expire the record before redelivery happens.
        time_provider.inc(Duration::from_secs(5));
        log.append(LogRecord::new(
            "t.a",
            b"survivor".to_vec(),
            time_provider.now(),
        ))
        .await
        .unwrap();

        let pending = consumer.next().await.unwrap();
        assert_eq!(pending.record().payload, b"survivor");
        pending.ack().await.unwrap();
    }
}
