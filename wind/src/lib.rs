//! The wind: ephemeral publish/subscribe for leaves.
//!
//! Leaves dropped onto the wind reach the subscribers present at publication
//! time and nobody else; there is no persistence, retry or replay. Subjects
//! are hierarchical and subscriptions may use `*` / `>` wildcards. Named
//! queue groups load-balance each matching leaf to exactly one member.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod codec;
pub mod core;
pub mod memory;

pub use crate::core::{LeafHandler, Subscription, Wind, WindError, WindErrorKind};
pub use crate::memory::MemoryWind;
