//! This crate exists to coordinate versions of `tracing` and friends so the
//! rest of the workspace logs through a single, consistently configured
//! stack.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(missing_docs)]

// Export tracing for use by the rest of the workspace.
pub use tracing;
