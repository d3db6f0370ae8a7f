//! Wire protocol for save-sync sessions.
//!
//! One persistent TCP stream carries four frame kinds:
//! - `HELLO`: host → client handshake, announces signing and the salt
//! - `SAVE`: a save file with a header block and raw payload
//! - `STATE`: a length-prefixed JSON state diff
//! - `TEXT`: a length-prefixed UTF-8 message
//!
//! Tag lines and header lines are ASCII and newline-terminated; a blank line
//! ends a header block.

pub mod frame;
pub mod handshake;
pub mod header;
pub mod reader;

pub use frame::{Frame, IntegrityError, SaveFrame};
pub use handshake::Hello;
pub use header::{validate_filename, Headers, MAX_LINE_LEN};
pub use reader::{FrameLimits, FrameReader};

use thiserror::Error;

/// Tag line for the handshake frame.
pub const TAG_HELLO: &str = "HELLO";
/// Tag line for a save file transfer.
pub const TAG_SAVE: &str = "SAVE";
/// Tag line for a state diff.
pub const TAG_STATE: &str = "STATE";
/// Tag line for a text message.
pub const TAG_TEXT: &str = "TEXT";

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed mid-frame")]
    Truncated,

    #[error("Unknown frame tag: {0:?}")]
    UnknownTag(String),

    #[error("Unexpected {0} frame")]
    Unexpected(&'static str),

    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("Header line exceeds {MAX_LINE_LEN} bytes")]
    LineTooLong,

    #[error("Invalid save size: {0}")]
    InvalidSize(i64),

    #[error("Invalid filename: {0:?}")]
    InvalidFilename(String),

    #[error("{kind} body too large: {size} > {max} bytes")]
    TooLarge {
        kind: &'static str,
        size: u64,
        max: u64,
    },

    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
}

impl FrameError {
    /// Whether the stream is still aligned on a frame boundary after this error.
    ///
    /// A save header with a non-positive size is fully consumed and carries no
    /// payload, so the connection can move on to the next tag. Every other
    /// decode failure leaves the stream desynchronized.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::InvalidSize(_))
    }
}
