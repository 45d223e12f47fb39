// SPDX-License-Identifier: AGPL-3.0-only
//! AJP13 protocol helpers: packet framing, the `Msg` field codec, forward-request
//! decoding and container response packets.
//! Focused on async IO reading/writing for the container side of the connector.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub mod client;
mod forward;
pub mod headers;
pub mod msg;
mod response;

pub use forward::{ForwardRequest, RequestAttributes, decode_forward_request, encode_forward_request};
pub use msg::Msg;
pub use response::{
    Response, SendHeaders, decode_response, encode_body_chunk, encode_cpong, encode_end_response,
    encode_get_body_chunk, encode_send_headers,
};

/// Default (and minimum) packet size negotiated with the web server module.
pub const DEFAULT_PACKET_SIZE: usize = 8 * 1024;
pub const MAX_PACKET_SIZE: usize = 64 * 1024;
/// Magic + length.
pub const H_SIZE: usize = 4;
/// Prefix byte, chunk length and terminator around a SEND_BODY_CHUNK payload.
pub const SEND_CHUNK_OVERHEAD: usize = 4;

/// Web server -> container.
pub const MAGIC_TO_CONTAINER: u16 = 0x1234;
/// Container -> web server ("AB").
pub const MAGIC_TO_SERVER: u16 = 0x4142;

// Inbound message types.
pub const JK_AJP13_FORWARD_REQUEST: u8 = 2;
pub const JK_AJP13_SHUTDOWN: u8 = 7;
pub const JK_AJP13_PING_REQUEST: u8 = 8;
pub const JK_AJP13_CPING_REQUEST: u8 = 10;

// Outbound message types.
pub const JK_AJP13_SEND_BODY_CHUNK: u8 = 3;
pub const JK_AJP13_SEND_HEADERS: u8 = 4;
pub const JK_AJP13_END_RESPONSE: u8 = 5;
pub const JK_AJP13_GET_BODY_CHUNK: u8 = 6;
pub const JK_AJP13_CPONG_REPLY: u8 = 9;

/// Highest message type code a dispatcher table has to hold.
pub const MAX_MESSAGE_TYPE: u8 = 10;

pub fn message_type_name(code: u8) -> &'static str {
    match code {
        JK_AJP13_FORWARD_REQUEST => "JK_AJP13_FORWARD_REQUEST",
        JK_AJP13_SEND_BODY_CHUNK => "JK_AJP13_SEND_BODY_CHUNK",
        JK_AJP13_SEND_HEADERS => "JK_AJP13_SEND_HEADERS",
        JK_AJP13_END_RESPONSE => "JK_AJP13_END_RESPONSE",
        JK_AJP13_GET_BODY_CHUNK => "JK_AJP13_GET_BODY_CHUNK",
        JK_AJP13_SHUTDOWN => "JK_AJP13_SHUTDOWN",
        JK_AJP13_PING_REQUEST => "JK_AJP13_PING_REQUEST",
        JK_AJP13_CPONG_REPLY => "JK_AJP13_CPONG_REPLY",
        JK_AJP13_CPING_REQUEST => "JK_AJP13_CPING_REQUEST",
        _ => "UNKNOWN",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MsgError {
    #[error("AJP message overflow: {needed} bytes needed, capacity {capacity}")]
    Overflow { needed: usize, capacity: usize },
    #[error("AJP message truncated while reading {field}")]
    Truncated { field: &'static str },
    #[error("invalid AJP header magic {0:#06x}")]
    BadMagic(u16),
    #[error("declared AJP body length {declared} exceeds packet capacity {capacity}")]
    TooLarge { declared: usize, capacity: usize },
    #[error("unknown AJP method code {0}")]
    UnknownMethod(u8),
    #[error("unknown AJP header code {0:#06x}")]
    UnknownHeader(u16),
    #[error("unexpected AJP message type {0}")]
    UnexpectedType(u8),
}

/// Why a packet could not be received. Every variant terminates the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadStatus {
    #[error("header received but no body followed (declared {declared} bytes)")]
    NoBody { declared: usize },
    #[error("incomplete read, waited for {expected} bytes, got only {got}")]
    ShortBody { expected: usize, got: usize },
    #[error("connection closed by peer")]
    RemoteClosed,
    #[error("invalid AJP header magic {0:#06x}")]
    BadHeader(u16),
    #[error("declared body length {declared} exceeds packet size {capacity}")]
    TooLarge { declared: usize, capacity: usize },
}

impl ReadStatus {
    /// Negative status code reported by the connection loop.
    pub fn code(&self) -> i32 {
        match self {
            ReadStatus::NoBody { .. } => -1,
            ReadStatus::ShortBody { .. } => -2,
            ReadStatus::RemoteClosed => -3,
            ReadStatus::BadHeader(_) => -4,
            ReadStatus::TooLarge { .. } => -5,
        }
    }
}

/// Reads until `buf` is full or the stream ends; returns the bytes obtained.
async fn read_fully<R>(reader: &mut R, buf: &mut [u8]) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut pos = 0;
    while pos < buf.len() {
        match reader.read(&mut buf[pos..]).await {
            Ok(0) | Err(_) => break,
            Ok(got) => pos += got,
        }
    }
    pos
}

/// Reads one packet (header, then the declared body) into `msg`.
///
/// Partial reads are retried until the declared length is obtained; a stream
/// that ends midway yields the status for the failure class instead of a
/// decode of whatever bytes happened to arrive.
pub async fn read_message<R>(reader: &mut R, msg: &mut Msg) -> Result<usize, ReadStatus>
where
    R: AsyncRead + Unpin,
{
    let got = read_fully(reader, msg.header_mut()).await;
    if got < H_SIZE {
        return Err(ReadStatus::RemoteClosed);
    }
    let declared = match msg.process_header() {
        Ok(len) => len,
        Err(MsgError::BadMagic(mark)) => return Err(ReadStatus::BadHeader(mark)),
        Err(MsgError::TooLarge { declared, capacity }) => {
            return Err(ReadStatus::TooLarge { declared, capacity });
        }
        Err(_) => return Err(ReadStatus::RemoteClosed),
    };
    // An empty body is a valid packet; the dispatcher rejects it.
    if declared == 0 {
        return Ok(0);
    }
    let body = msg
        .body_mut(declared)
        .map_err(|_| ReadStatus::TooLarge {
            declared,
            capacity: 0,
        })?;
    let got = read_fully(reader, body).await;
    if got == 0 {
        return Err(ReadStatus::NoBody { declared });
    }
    if got != declared {
        return Err(ReadStatus::ShortBody {
            expected: declared,
            got,
        });
    }
    Ok(got)
}

/// Writes a finished packet. Flushing is left to the caller so several
/// packets of one logical unit can go out together.
pub async fn write_message<W>(writer: &mut W, msg: &Msg) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(msg.as_bytes()).await
}
