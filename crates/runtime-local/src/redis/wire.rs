//! A minimal client for the Redis serialization protocol (RESP2).
//!
//! Commands are arrays of bulk strings, replies are read into a growing buffer until a
//! complete frame has been received. Only one command can be in flight per connection: the
//! `&mut self` receiver of [`WireConnection::send_command`] makes interleaving impossible, and a
//! command abandoned before its reply was read (a dropped future, a timeout) poisons the
//! connection for good.

use bytes::{Buf, BytesMut};
use runtime::DEPTH_GUARD_TARGET;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

const CRLF: &[u8] = b"\r\n";
const READ_BUFFER_CAPACITY: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("server error: {0}")]
    Server(String),
    #[error("connection closed")]
    Closed,
    #[error("connection poisoned by an unfinished command")]
    Poisoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(String),
    /// Only ever nested inside an array, top-level errors become [`WireError::Server`].
    Error(String),
    Integer(i64),
    /// `None` is the "not found" sentinel, distinct from an empty payload.
    Bulk(Option<Vec<u8>>),
    Array(Option<Vec<Reply>>),
}

/// Encodes a command as an array of length-prefixed bulk strings.
pub fn encode_command(args: &[&[u8]]) -> Vec<u8> {
    let payload: usize = args.iter().map(|arg| arg.len() + 16).sum();
    let mut out = Vec::with_capacity(payload + 16);

    out.push(b'*');
    out.extend_from_slice(args.len().to_string().as_bytes());
    out.extend_from_slice(CRLF);

    for arg in args {
        out.push(b'$');
        out.extend_from_slice(arg.len().to_string().as_bytes());
        out.extend_from_slice(CRLF);
        out.extend_from_slice(arg);
        out.extend_from_slice(CRLF);
    }

    out
}

/// Parses one frame at the start of `buf`, returning it with the number of bytes it spans.
/// `Ok(None)` means the frame is not complete yet.
pub fn parse_reply(buf: &[u8]) -> Result<Option<(Reply, usize)>, WireError> {
    let Some(line_end) = buf.windows(CRLF.len()).position(|window| window == CRLF) else {
        return Ok(None);
    };

    if line_end == 0 {
        return Err(WireError::Protocol(String::from("empty reply line")));
    }

    let line = &buf[1..line_end];
    let after_line = line_end + CRLF.len();

    match buf[0] {
        b'+' => Ok(Some((Reply::Status(utf8(line)?), after_line))),
        b'-' => Ok(Some((Reply::Error(utf8(line)?), after_line))),
        b':' => Ok(Some((Reply::Integer(integer(line)?), after_line))),
        b'$' => {
            let Ok(len) = usize::try_from(integer(line)?) else {
                return Ok(Some((Reply::Bulk(None), after_line)));
            };

            let end = after_line + len;

            if buf.len() < end + CRLF.len() {
                return Ok(None);
            }

            if &buf[end..end + CRLF.len()] != CRLF {
                return Err(WireError::Protocol(String::from("unterminated bulk string")));
            }

            Ok(Some((Reply::Bulk(Some(buf[after_line..end].to_vec())), end + CRLF.len())))
        }
        b'*' => {
            let Ok(len) = usize::try_from(integer(line)?) else {
                return Ok(Some((Reply::Array(None), after_line)));
            };

            let mut items = Vec::with_capacity(len.min(1024));
            let mut consumed = after_line;

            for _ in 0..len {
                let Some((item, used)) = parse_reply(&buf[consumed..])? else {
                    return Ok(None);
                };

                items.push(item);
                consumed += used;
            }

            Ok(Some((Reply::Array(Some(items)), consumed)))
        }
        marker => Err(WireError::Protocol(format!(
            "unexpected reply marker {:?}",
            char::from(marker)
        ))),
    }
}

fn utf8(bytes: &[u8]) -> Result<String, WireError> {
    String::from_utf8(bytes.to_vec()).map_err(|_| WireError::Protocol(String::from("reply is not valid UTF-8")))
}

fn integer(bytes: &[u8]) -> Result<i64, WireError> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| WireError::Protocol(format!("invalid integer {:?}", String::from_utf8_lossy(bytes))))
}

/// A single connection to a store speaking RESP.
///
/// The socket is released by [`WireConnection::close`] or, at the latest, when the connection
/// is dropped.
#[derive(Debug)]
pub struct WireConnection {
    stream: Option<TcpStream>,
    buffer: BytesMut,
    poisoned: bool,
}

impl WireConnection {
    pub async fn connect(host: &str, port: u16) -> Result<Self, WireError> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;

        Ok(Self {
            stream: Some(stream),
            buffer: BytesMut::with_capacity(READ_BUFFER_CAPACITY),
            poisoned: false,
        })
    }

    /// Writes an already encoded command and waits for its complete reply.
    pub async fn send_command(&mut self, command: &[u8]) -> Result<Reply, WireError> {
        if self.poisoned {
            return Err(WireError::Poisoned);
        }

        let stream = self.stream.as_mut().ok_or(WireError::Closed)?;

        // Cleared once the reply has been fully consumed. If this future is dropped in
        // between, the stream position is unknown and the connection must not be reused.
        self.poisoned = true;

        stream.write_all(command).await?;

        let reply = loop {
            if let Some((reply, consumed)) = parse_reply(&self.buffer)? {
                self.buffer.advance(consumed);
                break reply;
            }

            if stream.read_buf(&mut self.buffer).await? == 0 {
                self.stream = None;
                return Err(WireError::Closed);
            }
        };

        self.poisoned = false;

        match reply {
            Reply::Error(message) => Err(WireError::Server(message)),
            reply => Ok(reply),
        }
    }

    pub async fn command(&mut self, args: &[&[u8]]) -> Result<Reply, WireError> {
        self.send_command(&encode_command(args)).await
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Shuts the socket down. Calling it again is a no-op.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(error) = stream.shutdown().await {
                tracing::debug!(target: DEPTH_GUARD_TARGET, "error shutting down a wire connection: {error}");
            }
        }

        self.buffer.clear();
    }
}
