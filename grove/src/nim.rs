//! The nim contract: wind → {wind, humus, soil}.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use forest_types::{Action, Leaf, Revision, Slot};
use humus::{Humus, HumusError};
use observability_deps::tracing::info;
use parking_lot::Mutex;
use serde_json::Value;
use soil::{Soil, SoilError};
use wind::{LeafHandler, Subscription, Wind, WindError};

use crate::GroveError;

/// What a nim may touch while handling a leaf.
///
/// Writes to the soil are deliberately absent: a nim records state changes
/// by appending composts and lets the decomposer apply them, which is the
/// only serialization the system offers.
#[derive(Debug, Clone)]
pub struct NimContext {
    wind: Arc<dyn Wind>,
    humus: Humus,
    soil: Arc<dyn Soil>,
}

impl NimContext {
    /// Bundle the handles a nim may use.
    pub fn new(wind: Arc<dyn Wind>, humus: Humus, soil: Arc<dyn Soil>) -> Self {
        Self { wind, humus, soil }
    }

    /// Drop a new leaf onto the wind.
    pub async fn drop(&self, leaf: Leaf) -> Result<(), WindError> {
        Wind::drop(&*self.wind, leaf).await
    }

    /// Append a state-change record to the change log.
    pub async fn append(
        &self,
        producer: &str,
        entity: &str,
        action: Action,
        data: Option<Value>,
    ) -> Result<Slot, HumusError> {
        self.humus.append(producer, entity, action, data).await
    }

    /// Read current state from the soil.
    pub async fn dig(&self, key: &str) -> Result<(Value, Revision), SoilError> {
        self.soil.dig(key).await
    }
}

/// A reactor on the wind.
#[async_trait]
pub trait Nim: Debug + Send + Sync + 'static {
    /// Unique component name; conventionally the `producer` of appended
    /// composts.
    fn name(&self) -> &str;

    /// Subjects (with wildcards) this nim catches.
    fn subjects(&self) -> Vec<String>;

    /// React to one leaf. Errors are logged by the delivery loop and the
    /// leaf is not redelivered; the wind makes no such promise.
    async fn handle(
        &self,
        leaf: Leaf,
        ctx: &NimContext,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// A deterministic leaf-to-leaf transformer.
///
/// Treehouses use the nim contract without state mutation: no composts, no
/// soil, just a pure function from one leaf to (maybe) another.
pub trait LeafTransform: Debug + Send + Sync + 'static {
    /// Unique component name.
    fn name(&self) -> &str;

    /// Subjects (with wildcards) this treehouse transforms.
    fn subjects(&self) -> Vec<String>;

    /// Transform one leaf; `None` drops nothing.
    fn transform(&self, leaf: &Leaf) -> Option<Leaf>;
}

/// Adapter expressing a [`LeafTransform`] as a [`Nim`].
#[derive(Debug)]
pub struct TreehouseNim<T> {
    transform: T,
}

impl<T: LeafTransform> TreehouseNim<T> {
    /// Wrap a transform.
    pub fn new(transform: T) -> Self {
        Self { transform }
    }
}

#[async_trait]
impl<T: LeafTransform> Nim for TreehouseNim<T> {
    fn name(&self) -> &str {
        self.transform.name()
    }

    fn subjects(&self) -> Vec<String> {
        self.transform.subjects()
    }

    async fn handle(
        &self,
        leaf: Leaf,
        ctx: &NimContext,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        if let Some(out) = self.transform.transform(&leaf) {
            ctx.drop(out).await?;
        }
        Ok(())
    }
}

/// Drives a [`Nim`]: one bus subscription per subject, handler invocations
/// serialized per subscription.
#[derive(Debug)]
pub struct NimRunner {
    nim: Arc<dyn Nim>,
    wind: Arc<dyn Wind>,
    ctx: NimContext,
    subscriptions: Mutex<Vec<Subscription>>,
    running: AtomicBool,
}

impl NimRunner {
    /// Wire a nim onto the wind with its context.
    pub fn new(nim: Arc<dyn Nim>, wind: Arc<dyn Wind>, ctx: NimContext) -> Self {
        Self {
            nim,
            wind,
            ctx,
            subscriptions: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// The wrapped nim's name.
    pub fn name(&self) -> &str {
        self.nim.name()
    }

    /// Attach the subscriptions. Fails if already running.
    pub async fn start(&self) -> Result<(), GroveError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(GroveError::AlreadyRunning);
        }

        let subjects = self.nim.subjects();
        let mut subscriptions = Vec::with_capacity(subjects.len());
        for subject in &subjects {
            let handler = Arc::new(NimLeafHandler {
                nim: Arc::clone(&self.nim),
                ctx: self.ctx.clone(),
            });
            subscriptions.push(self.wind.catch(subject, handler).await?);
        }
        *self.subscriptions.lock() = subscriptions;

        info!(nim = %self.nim.name(), "nim started");
        Ok(())
    }

    /// Cancel the subscriptions. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let subscriptions = std::mem::take(&mut *self.subscriptions.lock());
        for subscription in &subscriptions {
            subscription.cancel();
        }
        info!(nim = %self.nim.name(), "nim stopped");
    }

    /// True while the subscriptions are attached.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct NimLeafHandler {
    nim: Arc<dyn Nim>,
    ctx: NimContext,
}

#[async_trait]
impl LeafHandler for NimLeafHandler {
    async fn handle(
        &self,
        leaf: Leaf,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        self.nim.handle(leaf, &self.ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forest_stream::memory::MemoryLog;
    use forest_time::{SystemProvider, Time, TimeProvider};
    use humus::HumusConfig;
    use serde_json::json;
    use soil::{MemorySoil, SoilConfig};
    use std::time::Duration;
    use tokio::sync::mpsc;
    use wind::MemoryWind;

    /// Counts payments per currency into the change log.
    #[derive(Debug)]
    struct PaymentNim;

    #[async_trait]
    impl Nim for PaymentNim {
        fn name(&self) -> &str {
            "payment-nim"
        }

        fn subjects(&self) -> Vec<String> {
            vec!["payment.completed".to_string()]
        }

        async fn handle(
            &self,
            leaf: Leaf,
            ctx: &NimContext,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            let entity = format!(
                "payments/{}",
                leaf.data.get("id").and_then(|v| v.as_str()).unwrap_or("unknown")
            );
            ctx.append(self.name(), &entity, Action::Create, Some(leaf.data.clone()))
                .await?;
            ctx.drop(Leaf::new(
                "payment.recorded",
                leaf.data.clone(),
                self.name(),
                leaf.timestamp,
            ))
            .await?;
            Ok(())
        }
    }

    fn fixture() -> (Arc<MemoryWind>, Humus, NimContext) {
        let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemProvider::new());
        let log = Arc::new(MemoryLog::new(
            HumusConfig::default().retention,
            Arc::clone(&time_provider),
        ));
        let humus = Humus::new(log, time_provider);
        let soil = Arc::new(MemorySoil::new(SoilConfig::default()));
        let bus = Arc::new(MemoryWind::new());
        let ctx = NimContext::new(Arc::clone(&bus) as _, humus.clone(), soil as _);
        (bus, humus, ctx)
    }

    #[derive(Debug)]
    struct ForwardingHandler {
        tx: mpsc::UnboundedSender<Leaf>,
    }

    #[async_trait]
    impl LeafHandler for ForwardingHandler {
        async fn handle(
            &self,
            leaf: Leaf,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            self.tx.send(leaf)?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn nim_reacts_with_composts_and_leaves() {
        test_helpers::maybe_start_logging();
        let (bus, humus, ctx) = fixture();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = bus
            .catch("payment.recorded", Arc::new(ForwardingHandler { tx }))
            .await
            .unwrap();

        let runner = NimRunner::new(Arc::new(PaymentNim), Arc::clone(&bus) as _, ctx);
        runner.start().await.unwrap();

        Wind::drop(&*bus, Leaf::new(
            "payment.completed",
            json!({"id": "p1", "amount": 42}),
            "test",
            Time::from_timestamp_millis(1_000),
        ))
        .await
        .unwrap();

        let echoed = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(echoed.subject, "payment.recorded");
        assert_eq!(echoed.source, "payment-nim");

        // The compost landed in the change log.
        assert_eq!(humus.high_watermark().await.unwrap().get(), 2);

        runner.stop().await;
        runner.stop().await;
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn treehouse_transforms_without_state() {
        #[derive(Debug)]
        struct Uppercaser;

        impl LeafTransform for Uppercaser {
            fn name(&self) -> &str {
                "uppercaser"
            }

            fn subjects(&self) -> Vec<String> {
                vec!["chat.message".to_string()]
            }

            fn transform(&self, leaf: &Leaf) -> Option<Leaf> {
                let text = leaf.data.get("text")?.as_str()?;
                Some(Leaf::new(
                    "chat.message.loud",
                    json!({"text": text.to_uppercase()}),
                    self.name(),
                    leaf.timestamp,
                ))
            }
        }

        let (bus, humus, ctx) = fixture();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = bus
            .catch("chat.message.loud", Arc::new(ForwardingHandler { tx }))
            .await
            .unwrap();

        let runner = NimRunner::new(
            Arc::new(TreehouseNim::new(Uppercaser)),
            Arc::clone(&bus) as _,
            ctx,
        );
        runner.start().await.unwrap();

        Wind::drop(&*bus, Leaf::new(
            "chat.message",
            json!({"text": "hello"}),
            "test",
            Time::from_timestamp_millis(1_000),
        ))
        .await
        .unwrap();

        let loud = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loud.data, json!({"text": "HELLO"}));

        // No state mutation happened.
        assert_eq!(humus.high_watermark().await.unwrap().get(), 1);

        runner.stop().await;
    }
}
