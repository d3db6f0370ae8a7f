//! save-sync-core: Protocol library for peer-to-peer save-game sessions.
//!
//! This crate provides the I/O-free parts of a session:
//! - Frame codec for the four wire message kinds
//! - Password-derived signing of save payloads
//! - Shared state cache with last-writer-wins diff merging
//! - Delegate and event abstractions for upward notification

pub mod delegate;
pub mod events;
pub mod protocol;
pub mod signing;
pub mod state;

pub use delegate::{PasswordProvider, SessionDelegate};
pub use events::{EventBus, SessionEvent, Subscription};
pub use protocol::{Frame, FrameError, FrameReader, Hello, SaveFrame};
pub use signing::{Salt, SessionKey, SigningError};
pub use state::{StateDiff, StateError, StateStore};
