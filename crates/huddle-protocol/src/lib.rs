//! Shared protocol definitions for Huddle.
//!
//! Everything in here crosses a process boundary: side-channel messages
//! exchanged between peers, the signaling relay envelope, and the small
//! enums the session core and the UI agree on.

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
