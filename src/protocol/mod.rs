//! Wire protocol pieces: message types, dispatch envelopes, the idempotent
//! reply protocol and its persisted state.

pub mod envelope;
pub mod reply;
pub mod state;
pub mod types;

pub use envelope::Envelope;
pub use reply::{ReplyFailure, ReplyOutcome};
pub use types::{MessageEntry, MessageKind};
