//! Session handshake.
//!
//! The host sends `HELLO` immediately after accepting a connection:
//!
//! ```text
//! HELLO
//! SIGNING:0|1
//! SALT:<base64>      (only when SIGNING:1)
//!
//! ```

use super::header::{write_line, Headers};
use super::{FrameError, TAG_HELLO};
use crate::signing::Salt;

const SIGNING: &str = "SIGNING";
const SALT: &str = "SALT";

/// Handshake announcing whether saves in this session are signed.
///
/// A salt is present exactly when signing is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hello {
    salt: Option<Salt>,
}

impl Hello {
    /// Handshake for a session without a password.
    pub fn unsigned() -> Self {
        Self { salt: None }
    }

    /// Handshake for a password-protected session.
    pub fn signed(salt: Salt) -> Self {
        Self { salt: Some(salt) }
    }

    pub fn signing_enabled(&self) -> bool {
        self.salt.is_some()
    }

    pub fn salt(&self) -> Option<&Salt> {
        self.salt.as_ref()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        out.extend_from_slice(TAG_HELLO.as_bytes());
        out.push(b'\n');
        match &self.salt {
            Some(salt) => {
                write_line(&mut out, SIGNING, "1");
                write_line(&mut out, SALT, &salt.to_base64());
            }
            None => write_line(&mut out, SIGNING, "0"),
        }
        out.push(b'\n');
        out
    }

    /// Build from the header block that follows the `HELLO` tag.
    pub fn from_header_lines<S: AsRef<str>>(lines: &[S]) -> Result<Self, FrameError> {
        let headers = Headers::parse(lines, &[SIGNING, SALT])?;
        let signing = headers.flag(SIGNING)?;

        match (signing, headers.get(SALT)) {
            (true, Some(salt)) => {
                let salt = Salt::from_base64(salt)
                    .map_err(|e| FrameError::MalformedHeader(format!("SALT: {e}")))?;
                Ok(Self::signed(salt))
            }
            (true, None) => Err(FrameError::MalformedHeader(
                "SIGNING:1 without SALT".to_string(),
            )),
            (false, Some(_)) => Err(FrameError::MalformedHeader(
                "SALT sent with SIGNING:0".to_string(),
            )),
            (false, None) => Ok(Self::unsigned()),
        }
    }
}
