//! Core trait and types for the state store.

use std::fmt::{Debug, Display, Formatter};

use async_trait::async_trait;
use forest_types::Revision;
use futures::stream::BoxStream;
use serde_json::Value;

/// Generic boxed error type used by state store implementations.
#[derive(Debug)]
pub struct SoilError {
    inner: Box<dyn std::error::Error + Sync + Send>,
    kind: SoilErrorKind,
}

impl SoilError {
    /// Wrap an error under the given kind.
    pub fn new(
        kind: SoilErrorKind,
        e: impl Into<Box<dyn std::error::Error + Sync + Send>>,
    ) -> Self {
        Self {
            inner: e.into(),
            kind,
        }
    }

    /// The operation was handed unusable input.
    pub fn invalid_input(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(SoilErrorKind::InvalidInput, e)
    }

    /// The key is absent.
    pub fn not_found(key: &str) -> Self {
        Self::new(SoilErrorKind::NotFound, format!("key {key:?} not found"))
    }

    /// A create hit a key that already exists.
    pub fn already_exists(key: &str, current: Revision) -> Self {
        Self::new(
            SoilErrorKind::AlreadyExists,
            format!("key {key:?} already exists at revision {current}"),
        )
    }

    /// An update carried a stale expected revision.
    pub fn revision_mismatch(key: &str, expected: Revision, current: Revision) -> Self {
        Self::new(
            SoilErrorKind::RevisionMismatch,
            format!("key {key:?} is at revision {current}, caller expected {expected}"),
        )
    }

    /// The backing store reported unavailability.
    pub fn transport(e: impl Into<Box<dyn std::error::Error + Sync + Send>>) -> Self {
        Self::new(SoilErrorKind::Transport, e)
    }

    /// Returns the kind of error this was.
    pub fn kind(&self) -> SoilErrorKind {
        self.kind
    }

    /// Returns the inner error.
    pub fn inner(&self) -> &dyn std::error::Error {
        self.inner.as_ref()
    }
}

impl Display for SoilError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "SoilError({:?}): {}", self.kind, self.inner)
    }
}

impl std::error::Error for SoilError {}

/// Coarse classification of a [`SoilError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SoilErrorKind {
    /// This operation was provided with invalid input data.
    InvalidInput,

    /// The key is absent.
    NotFound,

    /// A create (`expected == 0`) hit a key that already exists.
    AlreadyExists,

    /// An update carried an expected revision that is no longer current.
    RevisionMismatch,

    /// The backing store reported unavailability.
    Transport,
}

/// Configuration of a state bucket.
#[derive(Debug, Clone, Copy)]
pub struct SoilConfig {
    /// How many revisions of each key are retained for inspection.
    pub history_depth: usize,
}

impl Default for SoilConfig {
    fn default() -> Self {
        Self { history_depth: 10 }
    }
}

/// One retained revision of a key; `value` is `None` for a delete marker.
#[derive(Debug, Clone, PartialEq)]
pub struct SoilEntry {
    /// Revision assigned by the mutation that produced this entry.
    pub revision: Revision,
    /// The stored value, or `None` when this entry records a delete.
    pub value: Option<Value>,
}

/// A change event streamed to watchers.
#[derive(Debug, Clone, PartialEq)]
pub enum SoilEvent {
    /// A key was created or updated.
    Put {
        /// The mutated key.
        key: String,
        /// The new value.
        value: Value,
        /// The revision assigned to the mutation.
        revision: Revision,
    },
    /// A key was deleted. Carries no value by design of the watch contract.
    Delete {
        /// The deleted key.
        key: String,
        /// The revision assigned to the delete marker.
        revision: Revision,
    },
}

/// Stream of [`SoilEvent`]s for keys matching a watch pattern.
pub type WatchStream = BoxStream<'static, SoilEvent>;

/// Returns true if `key` matches `pattern`.
///
/// Keys segment on `/` (e.g. `users/u1`); `*` matches exactly one segment
/// and `>` matches one or more trailing segments, mirroring the subject
/// grammar over dots.
pub fn key_matches(pattern: &str, key: &str) -> bool {
    let mut pattern_segments = pattern.split('/');
    let mut key_segments = key.split('/');

    loop {
        match (pattern_segments.next(), key_segments.next()) {
            (Some(">"), Some(_)) => return true,
            (Some(">"), None) => return false,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(k)) if p == k => {}
            (Some(_), _) => return false,
            (None, Some(_)) => return false,
            (None, None) => return true,
        }
    }
}

/// The versioned key/value store.
#[async_trait]
pub trait Soil: Debug + Send + Sync + 'static {
    /// Read the current value and revision of `key`.
    async fn dig(&self, key: &str) -> Result<(Value, Revision), SoilError>;

    /// Compare-and-set.
    ///
    /// With `expected == 0` this is a create and fails with `AlreadyExists`
    /// when the key is present. With `expected > 0` it is an update and
    /// fails with `RevisionMismatch` when the current revision differs (or
    /// `NotFound` when the key is absent). Returns the new revision.
    async fn bury(&self, key: &str, value: Value, expected: Revision)
        -> Result<Revision, SoilError>;

    /// Unconditional last-writer-wins write. Only for callers whose
    /// concurrency is serialized by external means.
    async fn put(&self, key: &str, value: Value) -> Result<Revision, SoilError>;

    /// Remove `key`. Fails with `NotFound` when absent so callers can layer
    /// their own idempotency.
    async fn delete(&self, key: &str) -> Result<(), SoilError>;

    /// Stream future set/delete events for keys matching `pattern`.
    async fn watch(&self, pattern: &str) -> Result<WatchStream, SoilError>;

    /// Snapshot enumeration of the currently live keys.
    async fn keys(&self) -> Result<Vec<String>, SoilError>;

    /// Up to `history_depth` retained revisions of `key`, newest first.
    async fn history(&self, key: &str) -> Result<Vec<SoilEntry>, SoilError>;
}
