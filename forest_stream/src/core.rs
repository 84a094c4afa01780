//! Core traits and types shared by all log engines.

use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use forest_time::Time;
use forest_types::{validate_subject, Slot};

/// Generic boxed error type used across log engines.
///
/// The dynamic boxing makes it easier to deal with errors from different
/// engines; the kind lets callers branch without downcasting.
#[derive(Debug)]
pub struct StreamError {
    inner: Box<dyn std::error::Error + Sync + Send>,
    kind: StreamErrorKind,
}

impl StreamError {
    /// Wrap an error under the given kind.
    pub fn new(
        kind: StreamErrorKind,
        e: impl Into<Box<dyn std::error::Error + Sync + Send>>,
    ) -> Self {
        Self {
            inner: e.into(),
            kind,
        }
    }

    /// The operation was handed unusable input.
    pub fn invalid_input(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(StreamErrorKind::InvalidInput, e)
    }

    /// Stored data could not be decoded.
    pub fn invalid_data(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(StreamErrorKind::InvalidData, e)
    }

    /// The backing store reported unavailability.
    pub fn io(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(StreamErrorKind::Io, e)
    }

    /// Anything else.
    pub fn unknown(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(StreamErrorKind::Unknown, e)
    }

    /// Returns the kind of error this was.
    pub fn kind(&self) -> StreamErrorKind {
        self.kind
    }

    /// Returns the inner error.
    pub fn inner(&self) -> &dyn std::error::Error {
        self.inner.as_ref()
    }
}

impl Display for StreamError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "StreamError({:?}): {}", self.kind, self.inner)
    }
}

impl std::error::Error for StreamError {}

impl From<std::io::Error> for StreamError {
    fn from(e: std::io::Error) -> Self {
        Self {
            inner: Box::new(e),
            kind: StreamErrorKind::Io,
        }
    }
}

impl From<forest_types::ValidationError> for StreamError {
    fn from(e: forest_types::ValidationError) -> Self {
        Self {
            inner: Box::new(e),
            kind: StreamErrorKind::InvalidInput,
        }
    }
}

impl From<String> for StreamError {
    fn from(e: String) -> Self {
        Self {
            inner: e.into(),
            kind: StreamErrorKind::Unknown,
        }
    }
}

impl From<&'static str> for StreamError {
    fn from(e: &'static str) -> Self {
        Self {
            inner: e.into(),
            kind: StreamErrorKind::Unknown,
        }
    }
}

/// Coarse classification of a [`StreamError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StreamErrorKind {
    /// This operation failed for an unknown reason.
    Unknown,

    /// This operation was provided with invalid input data.
    InvalidInput,

    /// This operation encountered stored data it could not decode.
    InvalidData,

    /// A fatal IO error occurred - non-fatal errors should be retried internally.
    Io,
}

/// An unsequenced record handed to [`LogWriting::append`].
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// Subject the record is filed under; consumers filter on it.
    pub subject: String,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Time of production.
    pub timestamp: Time,
}

impl LogRecord {
    /// Build a record.
    pub fn new(subject: impl Into<String>, payload: Vec<u8>, timestamp: Time) -> Self {
        Self {
            subject: subject.into(),
            payload,
            timestamp,
        }
    }

    pub(crate) fn validate(&self) -> Result<(), StreamError> {
        validate_subject(&self.subject)?;
        if self.payload.is_empty() {
            return Err(StreamError::invalid_input("empty payload"));
        }
        Ok(())
    }
}

/// A record as stored: the input plus the slot the log assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedRecord {
    /// Sequence number assigned on append; strictly increasing, gap-free.
    pub slot: Slot,
    /// Subject the record is filed under.
    pub subject: String,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// Time of production.
    pub timestamp: Time,
}

/// Retention limits for a log.
///
/// Overflow and expiry both discard the oldest records. Eviction never
/// renumbers surviving records; a consumer positioned before the eviction
/// horizon resumes at the earliest retained slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogRetention {
    /// Discard records older than this.
    pub max_age: Option<Duration>,
    /// Keep at most this many records.
    pub max_records: Option<usize>,
}

/// Writing side of a log.
#[async_trait]
pub trait LogWriting: Debug + Send + Sync + 'static {
    /// Durably append `record`, returning the slot the log assigned.
    ///
    /// Slots are assigned by the engine, never by the caller, and form a
    /// strictly increasing gap-free sequence starting at 1.
    async fn append(&self, record: LogRecord) -> Result<Slot, StreamError>;

    /// The next slot that will be assigned.
    ///
    /// Starts at 1 for an empty log; `high_watermark - 1` is the latest
    /// assigned slot. Useful for lag calculations.
    async fn high_watermark(&self) -> Result<Slot, StreamError>;
}

/// Reading side of a log.
#[async_trait]
pub trait LogReading: Debug + Send + Sync + 'static {
    /// Attach to the named durable consumer, creating it at the start of the
    /// log if absent.
    ///
    /// Handles sharing a name cooperate as a work queue over shared state:
    /// each record is delivered to exactly one handle until acknowledged.
    /// Distinct names hold fully independent positions.
    async fn consumer(&self, name: &str) -> Result<Box<dyn LogConsumer>, StreamError>;
}

/// A log engine exposes both sides.
pub trait Log: LogWriting + LogReading {}

impl<T: LogWriting + LogReading> Log for T {}

/// One handle onto a named durable consumer.
#[async_trait]
pub trait LogConsumer: Debug + Send + Sync {
    /// Await the next deliverable record: the earliest redelivery-due record
    /// if any, otherwise the next slot this consumer has not seen.
    ///
    /// A handle that settles every record before asking for the next one
    /// observes strict slot order.
    async fn next(&mut self) -> Result<PendingRecord, StreamError>;
}

/// Settlement callbacks a [`PendingRecord`] routes back into its engine.
///
/// `nak` is synchronous on purpose: redelivery scheduling is pure in-memory
/// state in every engine, which lets an unsettled record nak itself on drop.
#[async_trait]
pub(crate) trait RecordAcker: Debug + Send + Sync {
    async fn ack(&self, slot: Slot) -> Result<(), StreamError>;
    fn nak(&self, slot: Slot);
}

/// A delivered record awaiting settlement.
///
/// Dropping it unsettled counts as a nak, so a crashed handler leads to
/// redelivery rather than a lost record.
#[derive(Debug)]
pub struct PendingRecord {
    record: SequencedRecord,
    delivery_count: u32,
    settled: bool,
    acker: Arc<dyn RecordAcker>,
}

impl PendingRecord {
    pub(crate) fn new(
        record: SequencedRecord,
        delivery_count: u32,
        acker: Arc<dyn RecordAcker>,
    ) -> Self {
        Self {
            record,
            delivery_count,
            settled: false,
            acker,
        }
    }

    /// The delivered record.
    pub fn record(&self) -> &SequencedRecord {
        &self.record
    }

    /// How many times this record has been delivered to this consumer name,
    /// this delivery included.
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    /// Acknowledge: the record is consumed and will not be redelivered.
    pub async fn ack(mut self) -> Result<(), StreamError> {
        self.settled = true;
        let slot = self.record.slot;
        let acker = Arc::clone(&self.acker);
        drop(self);
        acker.ack(slot).await
    }

    /// Negative-acknowledge: schedule the record for redelivery.
    pub fn nak(mut self) {
        self.settled = true;
        let slot = self.record.slot;
        self.acker.nak(slot);
    }
}

impl Drop for PendingRecord {
    fn drop(&mut self) {
        if !self.settled {
            self.acker.nak(self.record.slot);
        }
    }
}

pub mod test_utils {
    //! Generic tests every log engine must pass.

    use super::*;
    use forest_time::{MockProvider, SystemProvider, TimeProvider};
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use std::collections::BTreeSet;

    /// Adapter making a concrete engine work with [`perform_generic_tests`].
    #[async_trait]
    pub trait TestAdapter: Send + Sync {
        /// Create a fresh, isolated log with the given limits and clock.
        async fn new_log(
            &self,
            retention: LogRetention,
            time_provider: Arc<dyn TimeProvider>,
        ) -> Arc<dyn Log>;
    }

    fn system_time() -> Arc<dyn TimeProvider> {
        Arc::new(SystemProvider::new())
    }

    fn record(subject: &str, payload: &str) -> LogRecord {
        LogRecord::new(
            subject,
            payload.as_bytes().to_vec(),
            Time::from_timestamp_millis(1_600_000_000_000),
        )
    }

    /// Await `fut` but panic if it does not resolve quickly; used where a
    /// test expects a record to already be deliverable.
    async fn expect_ready<T>(fut: BoxFuture<'_, Result<T, StreamError>>) -> T {
        tokio::time::timeout(Duration::from_secs(5), fut)
            .await
            .expect("operation should not block")
            .expect("operation should succeed")
    }

    /// Assert that `consumer.next()` stays pending.
    async fn assert_consumer_pending(consumer: &mut Box<dyn LogConsumer>) {
        tokio::select! {
            r = consumer.next() => panic!("consumer is not pending, yielded: {r:?}"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {},
        }
    }

    /// Generic test suite that must be passed by all proper log engines.
    pub async fn perform_generic_tests<T>(adapter: T)
    where
        T: TestAdapter,
    {
        test_append_assigns_gap_free_slots(&adapter).await;
        test_append_rejects_invalid_input(&adapter).await;
        test_single_consumer_in_order(&adapter).await;
        test_consumer_pending_until_append(&adapter).await;
        test_ack_is_final(&adapter).await;
        test_nak_redelivers_first(&adapter).await;
        test_drop_unsettled_redelivers(&adapter).await;
        test_work_queue_sharing(&adapter).await;
        test_independent_consumer_names(&adapter).await;
        test_high_watermark(&adapter).await;
        test_retention_max_records(&adapter).await;
        test_retention_max_age(&adapter).await;
    }

    async fn test_append_assigns_gap_free_slots<T: TestAdapter>(adapter: &T) {
        let log = adapter.new_log(LogRetention::default(), system_time()).await;

        let mut last = 0;
        for i in 0..10 {
            let slot = log
                .append(record("t.a", &format!("payload-{i}")))
                .await
                .unwrap();
            assert_eq!(slot.get(), last + 1, "slots must be gap-free");
            last = slot.get();
        }
    }

    async fn test_append_rejects_invalid_input<T: TestAdapter>(adapter: &T) {
        let log = adapter.new_log(LogRetention::default(), system_time()).await;

        let err = log.append(record("t.a", "")).await.unwrap_err();
        assert_eq!(err.kind(), StreamErrorKind::InvalidInput);

        let err = log.append(record("", "x")).await.unwrap_err();
        assert_eq!(err.kind(), StreamErrorKind::InvalidInput);

        let err = log.append(record("t.*", "x")).await.unwrap_err();
        assert_eq!(err.kind(), StreamErrorKind::InvalidInput);
    }

    async fn test_single_consumer_in_order<T: TestAdapter>(adapter: &T) {
        let log = adapter.new_log(LogRetention::default(), system_time()).await;

        for i in 0..5 {
            log.append(record("t.a", &format!("p{i}"))).await.unwrap();
        }

        let mut consumer = log.consumer("orderly").await.unwrap();
        for i in 0..5 {
            let pending = expect_ready(consumer.next().boxed()).await;
            assert_eq!(pending.record().slot.get(), i + 1);
            assert_eq!(pending.record().payload, format!("p{i}").into_bytes());
            assert_eq!(pending.delivery_count(), 1);
            pending.ack().await.unwrap();
        }
        assert_consumer_pending(&mut consumer).await;
    }

    async fn test_consumer_pending_until_append<T: TestAdapter>(adapter: &T) {
        let log = adapter.new_log(LogRetention::default(), system_time()).await;

        let mut consumer = log.consumer("waiter").await.unwrap();
        assert_consumer_pending(&mut consumer).await;

        log.append(record("t.a", "late")).await.unwrap();
        let pending = expect_ready(consumer.next().boxed()).await;
        assert_eq!(pending.record().payload, b"late");
        pending.ack().await.unwrap();
    }

    async fn test_ack_is_final<T: TestAdapter>(adapter: &T) {
        let log = adapter.new_log(LogRetention::default(), system_time()).await;

        log.append(record("t.a", "one")).await.unwrap();
        log.append(record("t.a", "two")).await.unwrap();

        let mut consumer = log.consumer("acker").await.unwrap();
        expect_ready(consumer.next().boxed()).await.ack().await.unwrap();

        // Only the second record is still owed; the first never comes back.
        let pending = expect_ready(consumer.next().boxed()).await;
        assert_eq!(pending.record().slot.get(), 2);
        pending.ack().await.unwrap();
        assert_consumer_pending(&mut consumer).await;
    }

    async fn test_nak_redelivers_first<T: TestAdapter>(adapter: &T) {
        let log = adapter.new_log(LogRetention::default(), system_time()).await;

        log.append(record("t.a", "one")).await.unwrap();
        log.append(record("t.a", "two")).await.unwrap();

        let mut consumer = log.consumer("retrier").await.unwrap();
        let pending = expect_ready(consumer.next().boxed()).await;
        assert_eq!(pending.record().slot.get(), 1);
        pending.nak();

        // The nak'd record is redelivered before any new slot, with a bumped
        // delivery count.
        let pending = expect_ready(consumer.next().boxed()).await;
        assert_eq!(pending.record().slot.get(), 1);
        assert_eq!(pending.delivery_count(), 2);
        pending.ack().await.unwrap();

        let pending = expect_ready(consumer.next().boxed()).await;
        assert_eq!(pending.record().slot.get(), 2);
        pending.ack().await.unwrap();
    }

    async fn test_drop_unsettled_redelivers<T: TestAdapter>(adapter: &T) {
        let log = adapter.new_log(LogRetention::default(), system_time()).await;

        log.append(record("t.a", "one")).await.unwrap();

        let mut consumer = log.consumer("dropper").await.unwrap();
        let pending = expect_ready(consumer.next().boxed()).await;
        drop(pending);

        let pending = expect_ready(consumer.next().boxed()).await;
        assert_eq!(pending.record().slot.get(), 1);
        assert_eq!(pending.delivery_count(), 2);
        pending.ack().await.unwrap();
    }

    async fn test_work_queue_sharing<T: TestAdapter>(adapter: &T) {
        let log = adapter.new_log(LogRetention::default(), system_time()).await;

        for i in 0..4 {
            log.append(record("t.a", &format!("p{i}"))).await.unwrap();
        }

        // Two handles on one name: every record goes to exactly one of them.
        let mut handle_a = log.consumer("shared").await.unwrap();
        let mut handle_b = log.consumer("shared").await.unwrap();

        let mut seen = BTreeSet::new();
        for _ in 0..2 {
            let pending = expect_ready(handle_a.next().boxed()).await;
            seen.insert(pending.record().slot.get());
            pending.ack().await.unwrap();

            let pending = expect_ready(handle_b.next().boxed()).await;
            seen.insert(pending.record().slot.get());
            pending.ack().await.unwrap();
        }

        assert_eq!(seen, BTreeSet::from([1, 2, 3, 4]));
        assert_consumer_pending(&mut handle_a).await;
        assert_consumer_pending(&mut handle_b).await;
    }

    async fn test_independent_consumer_names<T: TestAdapter>(adapter: &T) {
        let log = adapter.new_log(LogRetention::default(), system_time()).await;

        log.append(record("t.a", "one")).await.unwrap();

        let mut first = log.consumer("first").await.unwrap();
        expect_ready(first.next().boxed()).await.ack().await.unwrap();

        // A different name starts from the beginning regardless.
        let mut second = log.consumer("second").await.unwrap();
        let pending = expect_ready(second.next().boxed()).await;
        assert_eq!(pending.record().slot.get(), 1);
        pending.ack().await.unwrap();
    }

    async fn test_high_watermark<T: TestAdapter>(adapter: &T) {
        let log = adapter.new_log(LogRetention::default(), system_time()).await;

        assert_eq!(log.high_watermark().await.unwrap().get(), 1);

        log.append(record("t.a", "one")).await.unwrap();
        log.append(record("t.a", "two")).await.unwrap();
        assert_eq!(log.high_watermark().await.unwrap().get(), 3);
    }

    async fn test_retention_max_records<T: TestAdapter>(adapter: &T) {
        let retention = LogRetention {
            max_records: Some(2),
            ..Default::default()
        };
        let log = adapter.new_log(retention, system_time()).await;

        for i in 0..5 {
            log.append(record("t.a", &format!("p{i}"))).await.unwrap();
        }

        // Slots 1-3 were discarded; a late consumer resumes at the earliest
        // retained slot without renumbering.
        let mut consumer = log.consumer("late").await.unwrap();
        let pending = expect_ready(consumer.next().boxed()).await;
        assert_eq!(pending.record().slot.get(), 4);
        pending.ack().await.unwrap();
        let pending = expect_ready(consumer.next().boxed()).await;
        assert_eq!(pending.record().slot.get(), 5);
        pending.ack().await.unwrap();
    }

    async fn test_retention_max_age<T: TestAdapter>(adapter: &T) {
        let time_provider = Arc::new(MockProvider::new(Time::from_timestamp_millis(0)));
        let retention = LogRetention {
            max_age: Some(Duration::from_secs(60)),
            ..Default::default()
        };
        let log = adapter
            .new_log(retention, Arc::clone(&time_provider) as _)
            .await;

        log.append(LogRecord::new(
            "t.a",
            b"old".to_vec(),
            time_provider.now(),
        ))
        .await
        .unwrap();

        time_provider.inc(Duration::from_secs(120));

        log.append(LogRecord::new(
            "t.a",
            b"fresh".to_vec(),
            time_provider.now(),
        ))
        .await
        .unwrap();

        let mut consumer = log.consumer("ager").await.unwrap();
        let pending = expect_ready(consumer.next().boxed()).await;
        assert_eq!(pending.record().payload, b"fresh");
        assert_eq!(pending.record().slot.get(), 2);
        pending.ack().await.unwrap();
    }
}
