//! The source contract: external input → river.

use std::fmt::Debug;

use async_trait::async_trait;
use forest_types::Slot;
use river::{River, RiverError};

use crate::GroveError;

/// What the backbone owes a source: the ability to flow raw data under the
/// source's single declared publish subject.
#[derive(Debug, Clone)]
pub struct SourceContext {
    river: River,
    publishes: String,
}

impl SourceContext {
    /// Bind a context to the subject this source publishes under.
    pub fn new(river: River, publishes: impl Into<String>) -> Self {
        Self {
            river,
            publishes: publishes.into(),
        }
    }

    /// The declared publish subject (without the `river.` prefix).
    pub fn publishes(&self) -> &str {
        &self.publishes
    }

    /// Flow raw data into the river, optionally under a dotted suffix of the
    /// declared subject.
    pub async fn flow(&self, suffix: Option<&str>, data: Vec<u8>) -> Result<Slot, RiverError> {
        let subject = match suffix {
            Some(suffix) if !suffix.is_empty() => format!("{}.{suffix}", self.publishes),
            _ => self.publishes.clone(),
        };
        self.river.flow(&subject, data).await
    }
}

/// An ingestor of external input.
///
/// Implementations own their transport (HTTP listener, poll timer, beat
/// subscription) and write to the river only through the [`SourceContext`]
/// handed to [`Source::start`].
#[async_trait]
pub trait Source: Debug + Send + Sync + 'static {
    /// Unique component name.
    fn name(&self) -> &str;

    /// Kind of source, e.g. `"webhook"`, `"poll"`, `"ceremony"`.
    fn source_type(&self) -> &str;

    /// Bring up the transport. Fails if already running.
    async fn start(&self, ctx: SourceContext) -> Result<(), GroveError>;

    /// Tear down the transport and drain in-flight work. Idempotent.
    async fn stop(&self);

    /// True while the transport is up.
    fn is_running(&self) -> bool;
}
