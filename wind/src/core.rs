//! Core traits and types for the ephemeral bus.

use std::fmt::{Debug, Display, Formatter};

use async_trait::async_trait;
use forest_types::Leaf;
use tokio_util::sync::CancellationToken;

/// Generic boxed error type used by bus implementations.
#[derive(Debug)]
pub struct WindError {
    inner: Box<dyn std::error::Error + Sync + Send>,
    kind: WindErrorKind,
}

impl WindError {
    /// Wrap an error under the given kind.
    pub fn new(
        kind: WindErrorKind,
        e: impl Into<Box<dyn std::error::Error + Sync + Send>>,
    ) -> Self {
        Self {
            inner: e.into(),
            kind,
        }
    }

    /// The leaf failed validation.
    pub fn invalid_leaf(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(WindErrorKind::InvalidLeaf, e)
    }

    /// Inbound bytes failed to parse as a leaf.
    pub fn decode(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(WindErrorKind::Decode, e)
    }

    /// The bus backend reported unavailability.
    pub fn transport(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(WindErrorKind::Transport, e)
    }

    /// Anything else.
    pub fn internal(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(WindErrorKind::Internal, e)
    }

    /// Returns the kind of error this was.
    pub fn kind(&self) -> WindErrorKind {
        self.kind
    }

    /// Returns the inner error.
    pub fn inner(&self) -> &dyn std::error::Error {
        self.inner.as_ref()
    }
}

impl Display for WindError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "WindError({:?}): {}", self.kind, self.inner)
    }
}

impl std::error::Error for WindError {}

impl From<forest_types::ValidationError> for WindError {
    fn from(e: forest_types::ValidationError) -> Self {
        Self {
            inner: Box::new(e),
            kind: WindErrorKind::InvalidLeaf,
        }
    }
}

/// Coarse classification of a [`WindError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WindErrorKind {
    /// A required leaf field is missing or malformed.
    InvalidLeaf,

    /// Inbound bytes failed to parse as a leaf.
    Decode,

    /// The bus backend reported unavailability.
    Transport,

    /// This operation failed for an unknown reason.
    Internal,
}

/// Business logic invoked once per delivered leaf.
///
/// Handler objects carry their own dependencies; the bus only requires that
/// they take a decoded, re-validated leaf and report success or failure.
/// Failures are logged by the delivery loop and never propagate.
#[async_trait]
pub trait LeafHandler: Debug + Send + Sync + 'static {
    /// Handle one leaf.
    async fn handle(&self, leaf: Leaf) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// The ephemeral bus.
#[async_trait]
pub trait Wind: Debug + Send + Sync + 'static {
    /// Publish a leaf, best-effort, to the subscribers present right now.
    ///
    /// The leaf is validated first and rejected with
    /// [`WindErrorKind::InvalidLeaf`] if any envelope invariant fails. There
    /// is no delivery guarantee and no persistence; absent subscribers miss
    /// the leaf.
    async fn drop(&self, leaf: Leaf) -> Result<(), WindError>;

    /// Subscribe `handler` to every subject matching `pattern`.
    ///
    /// Per-subject publication order is preserved for this subscription, and
    /// invocations of this handler never overlap. Malformed inbound payloads
    /// are logged and dropped without reaching the handler.
    async fn catch(
        &self,
        pattern: &str,
        handler: std::sync::Arc<dyn LeafHandler>,
    ) -> Result<Subscription, WindError>;

    /// Subscribe as a member of the named queue group.
    ///
    /// Each leaf matching `pattern` is delivered to exactly one member of
    /// `group`, chosen by the bus. Plain catches still receive their own
    /// copy.
    async fn catch_with_queue(
        &self,
        pattern: &str,
        group: &str,
        handler: std::sync::Arc<dyn LeafHandler>,
    ) -> Result<Subscription, WindError>;
}

/// Handle to one subscription.
///
/// Dropping the handle leaves the subscription attached; teardown is always
/// explicit via [`Subscription::cancel`].
#[derive(Debug)]
pub struct Subscription {
    token: CancellationToken,
}

impl Subscription {
    pub(crate) fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Detach the subscription. Idempotent; in-flight handler invocations
    /// complete before the delivery task exits.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// True once [`Subscription::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}
