//! Splitting an inbound byte stream into chat messages.
//!
//! Two modes are supported:
//!
//! - [`Framing::Read`]: one successful read is one message, up to
//!   [`MAX_MESSAGE_LEN`] bytes. This matches clients that issue one write per
//!   message and never send a newline. A message split across reads arrives
//!   as two messages; two writes coalesced into one read arrive as one.
//! - [`Framing::Line`]: one `\n`-terminated line is one message. A line
//!   longer than [`MAX_MESSAGE_LEN`] is an `InvalidData` error.

use std::fmt;
use std::io;
use std::str::FromStr;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};

/// Largest inbound message, in bytes.
pub const MAX_MESSAGE_LEN: usize = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Framing {
    #[default]
    Read,
    Line,
}

impl FromStr for Framing {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "line" => Ok(Self::Line),
            other => Err(format!("unknown framing '{other}', expected 'read' or 'line'")),
        }
    }
}

impl fmt::Display for Framing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => f.write_str("read"),
            Self::Line => f.write_str("line"),
        }
    }
}

/// Strip any trailing `\r` and `\n` bytes.
pub fn trim_line_ending(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| *b != b'\n' && *b != b'\r')
        .map_or(0, |i| i + 1);
    &bytes[..end]
}

/// Reads whole messages from one client, according to a [`Framing`].
pub enum MessageReader<R> {
    Read { reader: R, buf: Box<[u8]> },
    Line(FramedRead<R, LinesCodec>),
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R, framing: Framing) -> Self {
        match framing {
            Framing::Read => Self::Read {
                reader,
                buf: vec![0u8; MAX_MESSAGE_LEN].into_boxed_slice(),
            },
            Framing::Line => Self::Line(FramedRead::new(
                reader,
                LinesCodec::new_with_max_length(MAX_MESSAGE_LEN),
            )),
        }
    }

    /// Next message, or `None` once the peer has closed its side.
    ///
    /// Cancel safe: dropping the future before it completes loses no data.
    pub async fn next_message(&mut self) -> io::Result<Option<Bytes>> {
        match self {
            Self::Read { reader, buf } => {
                let n = reader.read(buf).await?;
                if n == 0 {
                    return Ok(None);
                }
                Ok(Some(Bytes::copy_from_slice(&buf[..n])))
            }
            Self::Line(framed) => match framed.next().await {
                None => Ok(None),
                Some(Ok(line)) => Ok(Some(Bytes::from(line))),
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("line exceeds {MAX_MESSAGE_LEN} bytes"),
                )),
                Some(Err(LinesCodecError::Io(e))) => Err(e),
            },
        }
    }
}
