//! Component-boundary errors.

use decomposer::DecomposerError;
use humus::HumusError;
use river::RiverError;
use wind::WindError;

/// Errors surfaced by component lifecycles and the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum GroveError {
    /// A component with this name is already planted.
    #[error("component {0:?} is already planted")]
    DuplicateName(String),

    /// Start was called on a component that is already running.
    #[error("component is already running")]
    AlreadyRunning,

    /// The bus rejected an operation.
    #[error(transparent)]
    Wind(#[from] WindError),

    /// The ingress stream rejected an operation.
    #[error(transparent)]
    River(#[from] RiverError),

    /// The change log rejected an operation.
    #[error(transparent)]
    Humus(#[from] HumusError),

    /// The projector rejected a lifecycle call.
    #[error(transparent)]
    Decomposer(#[from] DecomposerError),

    /// A source transport (HTTP listener, poll client) failed to come up.
    #[error("source transport error: {0}")]
    Transport(String),
}
