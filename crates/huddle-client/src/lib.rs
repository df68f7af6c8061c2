//! Huddle client library
//!
//! Peer-to-peer audio/video sessions with virtual backgrounds, screen
//! sharing and local recording.

pub mod config;
pub mod error;
pub mod media;
pub mod session;
pub mod settings;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod transport;

pub use config::Settings;
pub use error::{DeviceError, Result, SessionError, TransportError};
pub use session::{Notice, Session, SessionDeps, SessionOptions};
pub use settings::PersistentSettings;
