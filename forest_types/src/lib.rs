//! Shared data types for the forest backbone: the event envelope carried on
//! the wind, raw ingress records, state-change records and the sequence /
//! revision newtypes that order them.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod compost;
mod leaf;
mod river_data;
mod sequence;
mod subject;

pub use compost::{Action, Compost};
pub use leaf::Leaf;
pub use river_data::RiverData;
pub use sequence::{Revision, Slot};
pub use subject::{
    subject_matches, validate_pattern, validate_subject, DANCE_BEAT_SUBJECT, HUMUS_PREFIX,
    RIVER_PREFIX,
};

use snafu::Snafu;

/// Fail-closed validation errors for the data model.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum ValidationError {
    #[snafu(display("subject must not be empty"))]
    EmptySubject,

    #[snafu(display("subject {subject:?} has an empty token"))]
    EmptySubjectToken { subject: String },

    #[snafu(display("subject {subject:?} contains a wildcard and cannot be published to"))]
    WildcardInPublish { subject: String },

    #[snafu(display("pattern {pattern:?} has a non-trailing '>' wildcard"))]
    MisplacedTrailingWildcard { pattern: String },

    #[snafu(display("{field} must not be empty"))]
    EmptyField { field: &'static str },

    #[snafu(display("timestamp must be set"))]
    ZeroTimestamp,

    #[snafu(display("data payload is required"))]
    MissingData,

    #[snafu(display("ingress subject {subject:?} lacks the river prefix"))]
    MissingRiverPrefix { subject: String },

    #[snafu(display("{action:?} is not a valid action (expected create, update or delete)"))]
    InvalidAction { action: String },
}
