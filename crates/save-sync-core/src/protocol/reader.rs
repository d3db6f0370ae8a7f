//! Async frame decoding over a buffered byte stream.

use super::frame::{FILENAME, HMAC, SIGNED, SIZE};
use super::handshake::Hello;
use super::header::{validate_filename, Headers, MAX_LINE_LEN};
use super::{Frame, FrameError, SaveFrame, TAG_HELLO, TAG_SAVE, TAG_STATE, TAG_TEXT};
use base64::{engine::general_purpose::STANDARD, Engine};
use std::io::ErrorKind;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};
use tracing::debug;

/// Maximum save payload (256 MiB) accepted from a peer.
pub const MAX_SAVE_SIZE: u64 = 256 * 1024 * 1024;

/// Maximum `STATE`/`TEXT` body (16 MiB) accepted from a peer.
pub const MAX_BODY_SIZE: u32 = 16 * 1024 * 1024;

/// Most header lines accepted in one block. `SAVE` uses at most four keys.
pub const MAX_HEADER_LINES: usize = 8;

/// Upper bounds on peer-declared sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub max_save_size: u64,
    pub max_body_size: u32,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_save_size: MAX_SAVE_SIZE,
            max_body_size: MAX_BODY_SIZE,
        }
    }
}

/// Reads frames one at a time, in stream order.
pub struct FrameReader<R> {
    inner: R,
    limits: FrameLimits,
}

impl<R: AsyncBufRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_limits(inner, FrameLimits::default())
    }

    pub fn with_limits(inner: R, limits: FrameLimits) -> Self {
        Self { inner, limits }
    }

    /// Read the handshake that opens every session.
    pub async fn read_hello(&mut self) -> Result<Hello, FrameError> {
        match self.read_frame().await? {
            Some(Frame::Hello(hello)) => Ok(hello),
            Some(other) => Err(FrameError::Unexpected(other.kind())),
            None => Err(FrameError::Truncated),
        }
    }

    /// Read the next frame. Returns `Ok(None)` on a clean end of stream.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let Some(tag) = self.read_line().await? else {
            return Ok(None);
        };

        let frame = match tag.as_str() {
            TAG_HELLO => {
                let lines = self.read_header_block().await?;
                Frame::Hello(Hello::from_header_lines(&lines)?)
            }
            TAG_SAVE => Frame::Save(self.read_save().await?),
            TAG_STATE => Frame::State(self.read_body(TAG_STATE).await?),
            TAG_TEXT => Frame::Text(self.read_body(TAG_TEXT).await?),
            _ => return Err(FrameError::UnknownTag(tag)),
        };

        debug!("Decoded {} frame", frame.kind());
        Ok(Some(frame))
    }

    async fn read_save(&mut self) -> Result<SaveFrame, FrameError> {
        let lines = self.read_header_block().await?;
        let headers = Headers::parse(&lines, &[FILENAME, SIZE, SIGNED, HMAC])?;

        let size: i64 = headers
            .require(SIZE)?
            .parse()
            .map_err(|_| FrameError::MalformedHeader("SIZE is not an integer".to_string()))?;
        if size <= 0 {
            // Header fully consumed, no payload follows.
            return Err(FrameError::InvalidSize(size));
        }
        let size = size as u64;
        if size > self.limits.max_save_size {
            return Err(FrameError::TooLarge {
                kind: TAG_SAVE,
                size,
                max: self.limits.max_save_size,
            });
        }

        let filename = headers.require(FILENAME)?.to_string();
        validate_filename(&filename)?;

        let signed = headers.flag(SIGNED)?;
        let hmac = match (signed, headers.get(HMAC)) {
            (true, Some(tag)) => Some(
                STANDARD
                    .decode(tag.as_bytes())
                    .map_err(|e| FrameError::MalformedHeader(format!("HMAC: {e}")))?,
            ),
            (true, None) => None,
            (false, Some(_)) => {
                return Err(FrameError::MalformedHeader(
                    "HMAC sent with SIGNED:0".to_string(),
                ));
            }
            (false, None) => None,
        };

        let mut payload = vec![0u8; size as usize];
        self.read_exact(&mut payload).await?;

        Ok(SaveFrame {
            filename,
            payload,
            signed,
            hmac,
        })
    }

    async fn read_body(&mut self, kind: &'static str) -> Result<String, FrameError> {
        let mut len = [0u8; 4];
        self.read_exact(&mut len).await?;
        let len = u32::from_be_bytes(len);
        if len > self.limits.max_body_size {
            return Err(FrameError::TooLarge {
                kind,
                size: len as u64,
                max: self.limits.max_body_size as u64,
            });
        }

        let mut body = vec![0u8; len as usize];
        self.read_exact(&mut body).await?;
        String::from_utf8(body).map_err(|_| FrameError::InvalidUtf8(kind))
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), FrameError> {
        match self.inner.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(FrameError::Truncated),
            Err(e) => Err(FrameError::Io(e)),
        }
    }

    /// Header lines up to (not including) the blank terminator.
    async fn read_header_block(&mut self) -> Result<Vec<String>, FrameError> {
        let mut lines = Vec::new();
        loop {
            match self.read_line().await? {
                Some(line) if line.is_empty() => return Ok(lines),
                Some(_) if lines.len() >= MAX_HEADER_LINES => {
                    return Err(FrameError::MalformedHeader(format!(
                        "more than {MAX_HEADER_LINES} header lines"
                    )));
                }
                Some(line) => lines.push(line),
                None => return Err(FrameError::Truncated),
            }
        }
    }

    /// One newline-terminated line without its terminator. `None` at end of stream.
    async fn read_line(&mut self) -> Result<Option<String>, FrameError> {
        let mut buf = Vec::new();
        let limit = MAX_LINE_LEN as u64 + 1;
        let n = (&mut self.inner)
            .take(limit)
            .read_until(b'\n', &mut buf)
            .await?;

        if n == 0 {
            return Ok(None);
        }
        if buf.last() != Some(&b'\n') {
            return Err(if buf.len() as u64 >= limit {
                FrameError::LineTooLong
            } else {
                FrameError::Truncated
            });
        }

        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
        String::from_utf8(buf)
            .map(Some)
            .map_err(|_| FrameError::InvalidUtf8("header line"))
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::{Salt, SessionKey, KEY_LEN};
    use crate::state::StateDiff;
    use serde_json::json;

    fn reader(bytes: &[u8]) -> FrameReader<&[u8]> {
        FrameReader::new(bytes)
    }

    #[tokio::test]
    async fn test_header_block_line_limit() {
        let mut wire = b"SAVE\n".to_vec();
        for _ in 0..200_000 {
            wire.extend_from_slice(b"FILENAME:aaaa\n");
        }
        wire.extend_from_slice(b"\n");

        let mut r = reader(&wire);
        let err = r.read_frame().await.unwrap_err();

        assert!(matches!(err, FrameError::MalformedHeader(_)));
        assert!(!err.is_recoverable());
        // Stopped right after the first line past the cap.
        let consumed = wire.len() - r.inner.len();
        assert_eq!(consumed, 5 + (MAX_HEADER_LINES + 1) * 14);
    }

    #[tokio::test]
    async fn test_header_block_at_limit_is_accepted() {
        let mut wire = b"HELLO\nSIGNING:0\n".to_vec();
        for _ in 1..MAX_HEADER_LINES {
            wire.extend_from_slice(b"X:1\n");
        }
        wire.extend_from_slice(b"\n");

        // Reaches the key check rather than the line cap.
        let err = reader(&wire).read_frame().await.unwrap_err();
        match err {
            FrameError::MalformedHeader(msg) => assert!(msg.contains("unknown key"), "{msg}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_read_hello_signed() {
        let salt = Salt::random();
        let wire = Hello::signed(salt).encode();
        let hello = reader(&wire).read_hello().await.unwrap();

        assert!(hello.signing_enabled());
        assert_eq!(hello.salt(), Some(&salt));
    }

    #[tokio::test]
    async fn test_read_hello_rejects_other_frame_first() {
        let wire = Frame::Text("hi".into()).encode().unwrap();
        let err = reader(&wire).read_hello().await.unwrap_err();
        assert!(matches!(err, FrameError::Unexpected("TEXT")));
    }

    #[tokio::test]
    async fn test_frames_decode_in_stream_order() {
        let key = SessionKey::from_bytes([9u8; KEY_LEN]);
        let mut diff = StateDiff::new();
        diff.insert("a".into(), json!(1));

        let save = SaveFrame::new("ark.z2s", vec![1, 2, 3, 4], Some(&key)).unwrap();
        let mut wire = Vec::new();
        wire.extend(Frame::Save(save.clone()).encode().unwrap());
        wire.extend(Frame::state(&diff).encode().unwrap());
        wire.extend(Frame::Text("done".into()).encode().unwrap());

        let mut r = reader(&wire);
        match r.read_frame().await.unwrap() {
            Some(Frame::Save(received)) => {
                assert_eq!(received, save);
                assert!(received.verify(Some(&key)).is_ok());
            }
            other => panic!("Expected Save, got {:?}", other),
        }
        assert_eq!(
            r.read_frame().await.unwrap(),
            Some(Frame::State(r#"{"a":1}"#.to_string()))
        );
        assert_eq!(
            r.read_frame().await.unwrap(),
            Some(Frame::Text("done".to_string()))
        );
        assert_eq!(r.read_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_filename_with_colon_survives() {
        let save = SaveFrame::new("zoo: day 3.z2s", b"x".to_vec(), None).unwrap();
        let wire = save.encode().unwrap();

        match reader(&wire).read_frame().await.unwrap() {
            Some(Frame::Save(received)) => assert_eq!(received.filename, "zoo: day 3.z2s"),
            other => panic!("Expected Save, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_zero_size_rejected_without_reading_payload() {
        let mut wire = b"SAVE\nFILENAME:ark.z2s\nSIZE:0\nSIGNED:0\n\n".to_vec();
        wire.extend(Frame::Text("next".into()).encode().unwrap());

        let mut r = reader(&wire);
        let err = r.read_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::InvalidSize(0)));
        assert!(err.is_recoverable());

        // The next frame is still readable.
        assert_eq!(
            r.read_frame().await.unwrap(),
            Some(Frame::Text("next".to_string()))
        );
    }

    #[tokio::test]
    async fn test_negative_size_rejected() {
        let wire = b"SAVE\nFILENAME:ark.z2s\nSIZE:-5\nSIGNED:0\n\n";
        let err = reader(wire).read_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::InvalidSize(-5)));
    }

    #[tokio::test]
    async fn test_non_numeric_size_is_fatal() {
        let wire = b"SAVE\nFILENAME:ark.z2s\nSIZE:lots\nSIGNED:0\n\n";
        let err = reader(wire).read_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::MalformedHeader(_)));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_oversized_save_rejected_before_allocation() {
        let wire = b"SAVE\nFILENAME:ark.z2s\nSIZE:1000\nSIGNED:0\n\n";
        let limits = FrameLimits {
            max_save_size: 10,
            max_body_size: 10,
        };
        let err = FrameReader::with_limits(&wire[..], limits)
            .read_frame()
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { size: 1000, .. }));
    }

    #[tokio::test]
    async fn test_unknown_tag() {
        let err = reader(b"JOIN\n").read_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::UnknownTag(ref t) if t == "JOIN"));
    }

    #[tokio::test]
    async fn test_truncated_payload() {
        let wire = b"SAVE\nFILENAME:ark.z2s\nSIZE:10\nSIGNED:0\n\nabc";
        let err = reader(wire).read_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::Truncated));
    }

    #[tokio::test]
    async fn test_truncated_header() {
        let wire = b"SAVE\nFILENAME:ark.z2s\n";
        let err = reader(wire).read_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::Truncated));
    }

    #[tokio::test]
    async fn test_signed_without_hmac_decodes_for_integrity_check() {
        let wire = b"SAVE\nFILENAME:ark.z2s\nSIZE:1\nSIGNED:1\n\nx";
        match reader(wire).read_frame().await.unwrap() {
            Some(Frame::Save(save)) => {
                assert!(save.signed);
                assert!(save.hmac.is_none());
            }
            other => panic!("Expected Save, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_line_too_long() {
        let mut wire = vec![b'A'; MAX_LINE_LEN + 10];
        wire.push(b'\n');
        let err = reader(&wire).read_frame().await.unwrap_err();
        assert!(matches!(err, FrameError::LineTooLong));
    }

    #[tokio::test]
    async fn test_crlf_tag_accepted() {
        let err_free = reader(b"TEXT\r\n\x00\x00\x00\x01!").read_frame().await.unwrap();
        assert_eq!(err_free, Some(Frame::Text("!".to_string())));
    }
}
