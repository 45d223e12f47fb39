// SPDX-License-Identifier: AGPL-3.0-only
//! Reusable AJP13 packet buffer with a cursor for field encoding and decoding.
//!
//! A `Msg` owns a fixed-capacity buffer. The first four bytes are always the
//! packet header (2-byte magic, 2-byte big-endian body length); fields are
//! appended after it and `end()` stamps the header once the body is complete.
//! On the read side `process_header()` validates the magic and returns the
//! declared body length before any field is decoded.

use crate::{DEFAULT_PACKET_SIZE, H_SIZE, MAGIC_TO_CONTAINER, MAGIC_TO_SERVER};
use crate::MsgError;
use std::fmt::Write as _;

#[derive(Clone)]
pub struct Msg {
    buf: Vec<u8>,
    /// Read cursor.
    pos: usize,
    /// Bytes in use, header included.
    len: usize,
}

impl Default for Msg {
    fn default() -> Self {
        Self::new(DEFAULT_PACKET_SIZE)
    }
}

impl std::fmt::Debug for Msg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Msg")
            .field("capacity", &self.buf.len())
            .field("pos", &self.pos)
            .field("len", &self.len)
            .finish()
    }
}

impl Msg {
    pub fn new(packet_size: usize) -> Self {
        let size = packet_size.max(H_SIZE + 1);
        Self {
            buf: vec![0u8; size],
            pos: H_SIZE,
            len: H_SIZE,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Prepare the buffer for a new outgoing message.
    pub fn reset(&mut self) {
        self.len = H_SIZE;
        self.pos = H_SIZE;
    }

    /// Body length, excluding the 4-byte header.
    pub fn body_len(&self) -> usize {
        self.len.saturating_sub(H_SIZE)
    }

    /// Bytes left to decode in the body.
    pub fn remaining(&self) -> usize {
        self.len.saturating_sub(self.pos)
    }

    /// Header plus body as it goes on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// Finish a packet travelling from the container to the web server.
    pub fn end(&mut self) {
        self.stamp(MAGIC_TO_SERVER);
    }

    /// Finish a packet travelling from the web server to the container.
    pub fn end_request(&mut self) {
        self.stamp(MAGIC_TO_CONTAINER);
    }

    fn stamp(&mut self, magic: u16) {
        let body = (self.len - H_SIZE) as u16;
        self.buf[..2].copy_from_slice(&magic.to_be_bytes());
        self.buf[2..4].copy_from_slice(&body.to_be_bytes());
    }

    fn reserve(&mut self, extra: usize) -> Result<(), MsgError> {
        let needed = self.len + extra;
        if needed > self.buf.len() {
            return Err(MsgError::Overflow {
                needed,
                capacity: self.buf.len(),
            });
        }
        Ok(())
    }

    pub fn append_byte(&mut self, value: u8) -> Result<(), MsgError> {
        self.reserve(1)?;
        self.buf[self.len] = value;
        self.len += 1;
        Ok(())
    }

    pub fn append_int(&mut self, value: u16) -> Result<(), MsgError> {
        self.reserve(2)?;
        self.buf[self.len..self.len + 2].copy_from_slice(&value.to_be_bytes());
        self.len += 2;
        Ok(())
    }

    pub fn append_long(&mut self, value: u32) -> Result<(), MsgError> {
        self.reserve(4)?;
        self.buf[self.len..self.len + 4].copy_from_slice(&value.to_be_bytes());
        self.len += 4;
        Ok(())
    }

    /// Length-prefixed bytes followed by a NUL that the length does not count.
    pub fn append_bytes(&mut self, value: &[u8]) -> Result<(), MsgError> {
        if value.len() >= 0xFFFF {
            return Err(MsgError::Overflow {
                needed: value.len(),
                capacity: 0xFFFE,
            });
        }
        self.reserve(value.len() + 3)?;
        self.append_int(value.len() as u16)?;
        self.buf[self.len..self.len + value.len()].copy_from_slice(value);
        self.len += value.len();
        self.buf[self.len] = 0;
        self.len += 1;
        Ok(())
    }

    /// `None` encodes as the 0xFFFF null marker with no payload.
    pub fn append_string(&mut self, value: Option<&str>) -> Result<(), MsgError> {
        match value {
            Some(s) => self.append_bytes(s.as_bytes()),
            None => self.append_int(0xFFFF),
        }
    }

    /// Raw request-body payload: length prefix, no terminator.
    pub fn append_body_bytes(&mut self, value: &[u8]) -> Result<(), MsgError> {
        self.reserve(value.len() + 2)?;
        self.append_int(value.len() as u16)?;
        self.buf[self.len..self.len + value.len()].copy_from_slice(value);
        self.len += value.len();
        Ok(())
    }

    fn take(&mut self, n: usize, field: &'static str) -> Result<&[u8], MsgError> {
        if self.pos + n > self.len {
            return Err(MsgError::Truncated { field });
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.buf[start..start + n])
    }

    pub fn get_byte(&mut self) -> Result<u8, MsgError> {
        Ok(self.take(1, "byte")?[0])
    }

    pub fn peek_byte(&self) -> Result<u8, MsgError> {
        if self.pos >= self.len {
            return Err(MsgError::Truncated { field: "byte" });
        }
        Ok(self.buf[self.pos])
    }

    pub fn get_int(&mut self) -> Result<u16, MsgError> {
        let b = self.take(2, "int")?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn peek_int(&self) -> Result<u16, MsgError> {
        if self.pos + 2 > self.len {
            return Err(MsgError::Truncated { field: "int" });
        }
        Ok(u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]))
    }

    pub fn get_long(&mut self) -> Result<u32, MsgError> {
        let b = self.take(4, "long")?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Reads a length-prefixed field; `None` for the 0xFFFF null marker.
    pub fn get_bytes(&mut self) -> Result<Option<Vec<u8>>, MsgError> {
        let length = self.get_int()?;
        if length == 0xFFFF {
            return Ok(None);
        }
        let value = self.take(length as usize, "string")?.to_vec();
        // trailing NUL
        self.take(1, "string terminator")?;
        Ok(Some(value))
    }

    pub fn get_string(&mut self) -> Result<Option<String>, MsgError> {
        Ok(self.get_bytes()?.map(|raw| decode_text(&raw)))
    }

    /// Reads a request-body payload (length prefix, no terminator).
    pub fn get_body_bytes(&mut self) -> Result<Vec<u8>, MsgError> {
        let length = self.get_int()? as usize;
        Ok(self.take(length, "body chunk")?.to_vec())
    }

    /// Header bytes are read into here before `process_header`.
    pub fn header_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..H_SIZE]
    }

    /// Destination for `body_len` body bytes announced by the header.
    pub fn body_mut(&mut self, body_len: usize) -> Result<&mut [u8], MsgError> {
        if H_SIZE + body_len > self.buf.len() {
            return Err(MsgError::TooLarge {
                declared: body_len,
                capacity: self.buf.len() - H_SIZE,
            });
        }
        Ok(&mut self.buf[H_SIZE..H_SIZE + body_len])
    }

    /// Validates the 4-byte header and positions the cursor at the body.
    pub fn process_header(&mut self) -> Result<usize, MsgError> {
        let mark = u16::from_be_bytes([self.buf[0], self.buf[1]]);
        if mark != MAGIC_TO_CONTAINER && mark != MAGIC_TO_SERVER {
            return Err(MsgError::BadMagic(mark));
        }
        let body_len = u16::from_be_bytes([self.buf[2], self.buf[3]]) as usize;
        if H_SIZE + body_len > self.buf.len() {
            return Err(MsgError::TooLarge {
                declared: body_len,
                capacity: self.buf.len() - H_SIZE,
            });
        }
        self.len = H_SIZE + body_len;
        self.pos = H_SIZE;
        Ok(body_len)
    }

    /// Loads a complete packet (header + body) already held in memory.
    pub fn load(&mut self, packet: &[u8]) -> Result<usize, MsgError> {
        if packet.len() < H_SIZE {
            return Err(MsgError::Truncated { field: "header" });
        }
        self.buf[..H_SIZE].copy_from_slice(&packet[..H_SIZE]);
        let body_len = self.process_header()?;
        if packet.len() < H_SIZE + body_len {
            return Err(MsgError::Truncated { field: "body" });
        }
        self.buf[H_SIZE..H_SIZE + body_len].copy_from_slice(&packet[H_SIZE..H_SIZE + body_len]);
        Ok(body_len)
    }

    /// Hex dump of the packet, 16 bytes per line, for debug logging.
    pub fn dump(&self, label: &str) -> String {
        let mut out = format!("{label}: len={} body={}\n", self.len, self.body_len());
        let shown = self.len.min(1000);
        for (line, chunk) in self.buf[..shown].chunks(16).enumerate() {
            let _ = write!(out, "{:04x}  {:<48}", line * 16, spaced_hex(chunk));
            let printable: String = chunk
                .iter()
                .map(|b| if b.is_ascii_graphic() { *b as char } else { '.' })
                .collect();
            let _ = writeln!(out, " {printable}");
        }
        out
    }
}

fn spaced_hex(chunk: &[u8]) -> String {
    let encoded = hex::encode(chunk);
    let mut out = String::with_capacity(chunk.len() * 3);
    for (i, pair) in encoded.as_bytes().chunks(2).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        out.push(pair[0] as char);
        out.push(pair[1] as char);
    }
    out
}

/// Wire strings are usually ASCII; anything that is not valid UTF-8 is read as ISO-8859-1.
pub fn decode_text(raw: &[u8]) -> String {
    match std::str::from_utf8(raw) {
        Ok(s) => s.to_string(),
        Err(_) => raw.iter().map(|b| *b as char).collect(),
    }
}
