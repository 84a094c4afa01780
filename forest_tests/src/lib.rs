//! Shared fixtures for the cross-crate integration tests.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use std::sync::Arc;
use std::time::Duration;

use decomposer::DecomposerConfig;
use forest_stream::memory::MemoryLog;
use forest_time::{SystemProvider, TimeProvider};
use grove::Forest;
use humus::{Humus, HumusConfig};
use river::{River, RiverConfig};
use soil::{MemorySoil, Soil, SoilConfig};
use wind::MemoryWind;

/// A fully wired in-memory backbone, one per test.
#[derive(Debug)]
pub struct TestBackbone {
    /// The ephemeral bus.
    pub wind: Arc<MemoryWind>,
    /// The ingress stream.
    pub river: River,
    /// The change log.
    pub humus: Humus,
    /// The state store.
    pub soil: Arc<MemorySoil>,
}

impl TestBackbone {
    /// Build the backbone in the canonical order: clock, streams, state
    /// store, bus.
    pub fn new() -> Self {
        let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemProvider::new());

        let river_config = RiverConfig {
            redeliver_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let river_log = Arc::new(MemoryLog::new(
            river_config.retention,
            Arc::clone(&time_provider),
        ));
        let river = River::new(river_log, Arc::clone(&time_provider), river_config);

        let humus_log = Arc::new(MemoryLog::new(
            HumusConfig::default().retention,
            Arc::clone(&time_provider),
        ));
        let humus = Humus::new(humus_log, Arc::clone(&time_provider));

        let soil = Arc::new(MemorySoil::new(SoilConfig::default()));
        let wind = Arc::new(MemoryWind::new());

        Self {
            wind,
            river,
            humus,
            soil,
        }
    }

    /// Assemble a forest over this backbone.
    pub fn forest(&self, decomposer_config: DecomposerConfig) -> Forest {
        Forest::new(
            Arc::clone(&self.wind) as _,
            self.river.clone(),
            self.humus.clone(),
            Arc::clone(&self.soil) as _,
            decomposer_config,
        )
    }

    /// Snapshot the soil as sorted `(key, value)` pairs.
    pub async fn soil_snapshot(&self) -> Vec<(String, serde_json::Value)> {
        let mut snapshot = Vec::new();
        for key in self.soil.keys().await.expect("keys enumerate") {
            let (value, _) = self.soil.dig(&key).await.expect("live key digs");
            snapshot.push((key, value));
        }
        snapshot
    }
}

impl Default for TestBackbone {
    fn default() -> Self {
        Self::new()
    }
}
