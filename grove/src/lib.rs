//! The grove: lifecycle contracts for user-supplied components and the
//! orchestrator that wires them to the backbone.
//!
//! Three capability sets compose the runtime: sources ingest external data
//! into the river, trees parse river records into leaves on the wind, and
//! nims react to leaves by dropping new leaves, appending composts, or
//! reading the soil. The [`Forest`] owns the handles, brings everything up
//! in dependency order and tears it down in reverse.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

mod error;
mod forest;
mod nim;
mod source;
pub mod sources;
mod tree;

pub use error::GroveError;
pub use forest::Forest;
pub use nim::{LeafTransform, Nim, NimContext, NimRunner, TreehouseNim};
pub use source::{Source, SourceContext};
pub use tree::{Tree, TreeRunner};
