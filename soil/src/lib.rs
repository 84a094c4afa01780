//! The soil: a versioned key/value store holding materialized state.
//!
//! Every successful mutation of a key produces a strictly greater revision,
//! including deletes and re-creates. Compare-and-set (`bury`) is the only
//! inter-writer coordination in the system; the last N revisions of each key
//! are retained for inspection and watchers stream set/delete events for
//! matching keys.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod core;
pub mod memory;

pub use crate::core::{
    key_matches, Soil, SoilConfig, SoilEntry, SoilError, SoilErrorKind, SoilEvent, WatchStream,
};
pub use crate::memory::MemorySoil;
