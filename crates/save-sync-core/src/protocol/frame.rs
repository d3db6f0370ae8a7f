//! Frame types and encoding.

use super::handshake::Hello;
use super::header::{validate_filename, write_line};
use super::{FrameError, TAG_SAVE, TAG_STATE, TAG_TEXT};
use crate::signing::{SessionKey, SigningError};
use crate::state::StateDiff;
use base64::{engine::general_purpose::STANDARD, Engine};
use thiserror::Error;

pub(crate) const FILENAME: &str = "FILENAME";
pub(crate) const SIZE: &str = "SIZE";
pub(crate) const SIGNED: &str = "SIGNED";
pub(crate) const HMAC: &str = "HMAC";

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Hello(Hello),
    Save(SaveFrame),
    /// UTF-8 JSON text of a flat state diff.
    State(String),
    Text(String),
}

impl Frame {
    /// Build a `STATE` frame from a diff.
    pub fn state(diff: &StateDiff) -> Self {
        Self::State(serde_json::Value::Object(diff.clone()).to_string())
    }

    /// Tag name, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Hello(_) => "HELLO",
            Self::Save(_) => TAG_SAVE,
            Self::State(_) => TAG_STATE,
            Self::Text(_) => TAG_TEXT,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        match self {
            Self::Hello(hello) => Ok(hello.encode()),
            Self::Save(save) => save.encode(),
            Self::State(json) => encode_body(TAG_STATE, json),
            Self::Text(text) => encode_body(TAG_TEXT, text),
        }
    }
}

/// Tag line, then a 4-byte big-endian length, then the body.
fn encode_body(tag: &'static str, body: &str) -> Result<Vec<u8>, FrameError> {
    let len = u32::try_from(body.len()).map_err(|_| FrameError::TooLarge {
        kind: tag,
        size: body.len() as u64,
        max: u32::MAX as u64,
    })?;

    let mut out = Vec::with_capacity(tag.len() + 5 + body.len());
    out.extend_from_slice(tag.as_bytes());
    out.push(b'\n');
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(body.as_bytes());
    Ok(out)
}

/// Reasons a received save fails its integrity check.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("signed save received but no session key is available")]
    MissingKey,

    #[error("save marked SIGNED:1 carries no HMAC")]
    MissingTag,

    #[error("unsigned save received in a signed session")]
    Unsigned,

    #[error("HMAC mismatch")]
    Mismatch,
}

impl From<SigningError> for IntegrityError {
    fn from(_: SigningError) -> Self {
        Self::Mismatch
    }
}

/// A save file in transit.
#[derive(Clone, PartialEq, Eq)]
pub struct SaveFrame {
    pub filename: String,
    pub payload: Vec<u8>,
    pub signed: bool,
    pub hmac: Option<Vec<u8>>,
}

impl SaveFrame {
    /// Build an outgoing save, signed when a session key is given.
    pub fn new(
        filename: impl Into<String>,
        payload: Vec<u8>,
        key: Option<&SessionKey>,
    ) -> Result<Self, FrameError> {
        let filename = filename.into();
        validate_filename(&filename)?;
        if payload.is_empty() {
            return Err(FrameError::InvalidSize(0));
        }

        let hmac = key.map(|k| k.sign(&filename, payload.len() as u64, &payload).to_vec());
        Ok(Self {
            filename,
            signed: hmac.is_some(),
            hmac,
            payload,
        })
    }

    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Check the frame against the local session key.
    ///
    /// When the local session is signed, unsigned frames are refused as well.
    pub fn verify(&self, key: Option<&SessionKey>) -> Result<(), IntegrityError> {
        match (self.signed, key) {
            (false, None) => Ok(()),
            (false, Some(_)) => Err(IntegrityError::Unsigned),
            (true, None) => Err(IntegrityError::MissingKey),
            (true, Some(key)) => {
                let tag = self.hmac.as_deref().ok_or(IntegrityError::MissingTag)?;
                key.verify(&self.filename, self.size(), &self.payload, tag)?;
                Ok(())
            }
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        validate_filename(&self.filename)?;
        if self.payload.is_empty() {
            return Err(FrameError::InvalidSize(0));
        }

        let mut out = Vec::with_capacity(128 + self.payload.len());
        out.extend_from_slice(TAG_SAVE.as_bytes());
        out.push(b'\n');
        write_line(&mut out, FILENAME, &self.filename);
        write_line(&mut out, SIZE, &self.size().to_string());
        write_line(&mut out, SIGNED, if self.signed { "1" } else { "0" });
        if self.signed {
            if let Some(tag) = &self.hmac {
                write_line(&mut out, HMAC, &STANDARD.encode(tag));
            }
        }
        out.push(b'\n');
        out.extend_from_slice(&self.payload);
        Ok(out)
    }
}

impl std::fmt::Debug for SaveFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaveFrame")
            .field("filename", &self.filename)
            .field("size", &self.payload.len())
            .field("signed", &self.signed)
            .finish()
    }
}
