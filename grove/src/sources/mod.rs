//! Built-in source kinds: webhook receiver, polling client and the
//! interval-beat ceremony.

mod ceremony;
mod poll;
mod signature;
mod webhook;

pub use ceremony::{CeremonyConfig, CeremonySource};
pub use poll::{PollConfig, PollSource};
pub use signature::{SignatureError, SignatureVerifier};
pub use webhook::{WebhookConfig, WebhookSource};
