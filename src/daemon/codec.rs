//! Response framing.
//!
//! Every frame is a big-endian `u32` kind, the UTF-8 text, and a terminating
//! NUL byte.

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{Error, Result};

/// Largest frame accepted before the terminator is seen.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// What a frame asks the client to do with its text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum FrameKind {
    /// Print to stderr
    Stderr = 1,
    /// Print to stdout
    Stdout = 2,
    /// Run a command line locally with the terminal attached
    Exec = 3,
    /// Open a URL in the browser
    BrowseUrl = 4,
    /// Request finished; text is the exit status
    Exit = 5,
}

impl TryFrom<u32> for FrameKind {
    type Error = Error;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(FrameKind::Stderr),
            2 => Ok(FrameKind::Stdout),
            3 => Ok(FrameKind::Exec),
            4 => Ok(FrameKind::BrowseUrl),
            5 => Ok(FrameKind::Exit),
            other => Err(Error::Protocol(format!("unknown frame kind {}", other))),
        }
    }
}

/// One response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind
    pub kind: FrameKind,
    /// Payload
    pub text: String,
}

impl Frame {
    /// Frame of `kind` carrying `text`
    pub fn new(kind: FrameKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    /// Line for the client's stderr
    pub fn stderr(text: impl Into<String>) -> Self {
        Self::new(FrameKind::Stderr, text)
    }

    /// Line for the client's stdout
    pub fn stdout(text: impl Into<String>) -> Self {
        Self::new(FrameKind::Stdout, text)
    }

    /// Command line for the client to run
    pub fn exec(command_line: impl Into<String>) -> Self {
        Self::new(FrameKind::Exec, command_line)
    }

    /// URL for the client to open
    pub fn browse_url(url: impl Into<String>) -> Self {
        Self::new(FrameKind::BrowseUrl, url)
    }

    /// Final frame with the request's exit status
    pub fn exit(code: i32) -> Self {
        Self::new(FrameKind::Exit, code.to_string())
    }

    /// Exit status of an [`FrameKind::Exit`] frame
    pub fn exit_code(&self) -> Option<i32> {
        match self.kind {
            FrameKind::Exit => self.text.parse().ok(),
            _ => None,
        }
    }
}

/// [`Frame`] codec for `tokio_util::codec`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let end = match src[HEADER_LEN..].iter().position(|b| *b == 0) {
            Some(offset) => HEADER_LEN + offset,
            None if src.len() > MAX_FRAME_LEN => {
                return Err(Error::Protocol(format!(
                    "frame exceeds {} bytes",
                    MAX_FRAME_LEN
                )))
            }
            None => return Ok(None),
        };

        let kind = FrameKind::try_from(u32::from_be_bytes([src[0], src[1], src[2], src[3]]))?;
        let frame = src.split_to(end + 1);
        let text = std::str::from_utf8(&frame[HEADER_LEN..end])
            .map_err(|e| Error::Protocol(format!("frame text is not UTF-8: {}", e)))?
            .to_string();

        Ok(Some(Frame { kind, text }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        if frame.text.contains('\0') {
            return Err(Error::Protocol("frame text contains a NUL byte".to_string()));
        }
        dst.reserve(HEADER_LEN + frame.text.len() + 1);
        dst.put_u32(frame.kind as u32);
        dst.put_slice(frame.text.as_bytes());
        dst.put_u8(0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_layout() {
        let mut buf = BytesMut::new();
        FrameCodec.encode(Frame::stdout("hi"), &mut buf).unwrap();
        assert_eq!(&buf[..], &[0, 0, 0, 2, b'h', b'i', 0]);
    }

    #[test]
    fn test_decode_waits_for_terminator() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 4, b'h', b't'][..]);
        assert_eq!(FrameCodec.decode(&mut buf).unwrap(), None);

        buf.extend_from_slice(b"tp\0\0\0\0\x05");
        let frame = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame, Frame::browse_url("http"));
        assert_eq!(&buf[..], &[0, 0, 0, 5]);
        assert_eq!(FrameCodec.decode(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_decode_several_frames() {
        let mut buf = BytesMut::new();
        FrameCodec.encode(Frame::stderr("working"), &mut buf).unwrap();
        FrameCodec.encode(Frame::exit(3), &mut buf).unwrap();

        let first = FrameCodec.decode(&mut buf).unwrap().unwrap();
        let second = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.kind, FrameKind::Stderr);
        assert_eq!(second.exit_code(), Some(3));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_unknown_kind() {
        let mut buf = BytesMut::from(&[0u8, 0, 0, 9, b'x', 0][..]);
        assert!(matches!(FrameCodec.decode(&mut buf), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_nul_in_text_rejected() {
        let mut buf = BytesMut::new();
        assert!(FrameCodec
            .encode(Frame::stdout("a\0b"), &mut buf)
            .is_err());
    }
}
