// SPDX-License-Identifier: AGPL-3.0-only
//! Per-connection state handed to every handler.

use ajp_proto::{
    ForwardRequest, Msg, ReadStatus, SendHeaders, encode_body_chunk, encode_end_response,
    encode_send_headers, read_message, write_message,
};
use anyhow::Result;
use std::collections::HashMap;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Byte stream an AJP connection runs over. Anything that reads and writes
/// asynchronously qualifies: TCP sockets in production, duplex pipes in tests.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

pub struct MsgContext {
    stream: Box<dyn Transport>,
    peer: SocketAddr,
    local: SocketAddr,
    packet_size: usize,
    out: Msg,
    notes: HashMap<&'static str, String>,
    request: Option<ForwardRequest>,
    body: Vec<u8>,
}

impl MsgContext {
    pub fn new(
        stream: Box<dyn Transport>,
        peer: SocketAddr,
        local: SocketAddr,
        packet_size: usize,
    ) -> Self {
        Self {
            stream,
            peer,
            local,
            packet_size,
            out: Msg::new(packet_size),
            notes: HashMap::new(),
            request: None,
            body: Vec::new(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    pub fn note(&self, key: &str) -> Option<&str> {
        self.notes.get(key).map(String::as_str)
    }

    pub fn set_note(&mut self, key: &'static str, value: impl Into<String>) {
        self.notes.insert(key, value.into());
    }

    pub fn request(&self) -> Option<&ForwardRequest> {
        self.request.as_ref()
    }

    pub fn set_request(&mut self, request: ForwardRequest, body: Vec<u8>) {
        self.request = Some(request);
        self.body = body;
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Clears request-scoped state between requests on a kept-alive connection.
    pub fn recycle(&mut self) {
        self.notes.clear();
        self.request = None;
        self.body.clear();
    }

    pub async fn receive(&mut self, msg: &mut Msg) -> Result<usize, ReadStatus> {
        read_message(&mut self.stream, msg).await
    }

    pub async fn send(&mut self, msg: &Msg) -> std::io::Result<()> {
        write_message(&mut self.stream, msg).await
    }

    pub async fn flush(&mut self) -> std::io::Result<()> {
        self.stream.flush().await
    }

    /// Sends a packet built by `build` into the outbound buffer.
    pub async fn send_with<F>(&mut self, build: F) -> Result<()>
    where
        F: FnOnce(&mut Msg) -> Result<(), ajp_proto::MsgError>,
    {
        build(&mut self.out)?;
        write_message(&mut self.stream, &self.out).await?;
        Ok(())
    }

    /// Writes a complete response (headers, body chunks, end marker) and flushes.
    pub async fn send_response(&mut self, headers: &SendHeaders, body: &[u8]) -> Result<()> {
        encode_send_headers(&mut self.out, headers)?;
        write_message(&mut self.stream, &self.out).await?;
        let mut rest = body;
        while !rest.is_empty() {
            let taken = encode_body_chunk(&mut self.out, rest)?;
            write_message(&mut self.stream, &self.out).await?;
            rest = &rest[taken..];
        }
        encode_end_response(&mut self.out, true)?;
        write_message(&mut self.stream, &self.out).await?;
        self.stream.flush().await?;
        Ok(())
    }
}
