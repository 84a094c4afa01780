//! Durable, sequenced, at-least-once logs.
//!
//! This crate is the substrate under the river (raw ingress) and the humus
//! (state-change log): an append-only log that assigns gap-free slots,
//! retains records under configurable limits, and serves named durable
//! consumers with explicit acknowledgement. Two engines are provided: an
//! in-memory one for in-process use and tests, and a file-backed one for
//! durability across restarts.
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
pub mod file;
pub mod memory;
mod state;

pub use crate::core::{
    Log, LogConsumer, LogReading, LogRecord, LogRetention, LogWriting, PendingRecord,
    SequencedRecord, StreamError, StreamErrorKind,
};
