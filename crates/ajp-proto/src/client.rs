// SPDX-License-Identifier: AGPL-3.0-only
//! Minimal web-server-side helpers: forward a request, collect the reply, probe with CPING.

use crate::{
    ForwardRequest, JK_AJP13_CPING_REQUEST, Msg, Response, SendHeaders, decode_response,
    encode_forward_request, read_message, write_message,
};
use anyhow::{Result, anyhow, bail};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Everything the container sent back for one forwarded request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    pub headers: Option<SendHeaders>,
    pub body: Vec<u8>,
    pub reuse: bool,
}

impl Reply {
    pub fn status(&self) -> Option<u16> {
        self.headers.as_ref().map(|h| h.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.as_ref().and_then(|h| {
            h.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        })
    }
}

/// Sends the forward request and, when present, the request body as the
/// initial body packet. Larger bodies are not supported by this helper.
pub async fn send_request<W>(writer: &mut W, request: &ForwardRequest, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut msg = Msg::default();
    encode_forward_request(&mut msg, request)?;
    write_message(writer, &msg).await?;
    if !body.is_empty() {
        msg.reset();
        msg.append_body_bytes(body)?;
        msg.end_request();
        write_message(writer, &msg).await?;
    }
    writer.flush().await?;
    Ok(())
}

/// Reads container packets until END_RESPONSE.
pub async fn recv_reply<R>(reader: &mut R) -> Result<Reply>
where
    R: AsyncRead + Unpin,
{
    let mut reply = Reply::default();
    let mut msg = Msg::default();
    loop {
        read_message(reader, &mut msg)
            .await
            .map_err(|status| anyhow!("read failed ({}): {status}", status.code()))?;
        match decode_response(&mut msg)? {
            Response::Headers(headers) => reply.headers = Some(headers),
            Response::BodyChunk(chunk) => reply.body.extend_from_slice(&chunk),
            Response::End { reuse } => {
                reply.reuse = reuse;
                return Ok(reply);
            }
            Response::GetBodyChunk(_) => bail!("container asked for more body than was sent"),
            Response::CPong => bail!("unexpected CPONG in response stream"),
        }
    }
}

/// Sends a CPING and waits for the CPONG.
pub async fn cping<S>(stream: &mut S) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut msg = Msg::default();
    msg.append_byte(JK_AJP13_CPING_REQUEST)?;
    msg.end_request();
    write_message(stream, &msg).await?;
    stream.flush().await?;

    read_message(stream, &mut msg)
        .await
        .map_err(|status| anyhow!("read failed ({}): {status}", status.code()))?;
    match decode_response(&mut msg)? {
        Response::CPong => Ok(()),
        other => Err(anyhow!("expected CPONG, got {other:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{decode_forward_request, encode_cpong, encode_end_response, encode_send_headers};

    #[tokio::test]
    async fn request_reply_over_duplex() {
        let (mut web, mut container) = tokio::io::duplex(16 * 1024);

        let server = tokio::spawn(async move {
            let mut msg = Msg::default();
            read_message(&mut container, &mut msg).await.unwrap();
            assert_eq!(msg.get_byte().unwrap(), crate::JK_AJP13_FORWARD_REQUEST);
            let req = decode_forward_request(&mut msg).unwrap();
            assert_eq!(req.request_uri, "/secure");

            encode_send_headers(
                &mut msg,
                &SendHeaders {
                    status: 200,
                    message: "OK".into(),
                    headers: vec![("X-Remote-User".into(), "alice".into())],
                },
            )
            .unwrap();
            write_message(&mut container, &msg).await.unwrap();
            encode_end_response(&mut msg, true).unwrap();
            write_message(&mut container, &msg).await.unwrap();
            container.flush().await.unwrap();
        });

        let req = ForwardRequest::new("GET", "/secure");
        send_request(&mut web, &req, b"").await.unwrap();
        let reply = recv_reply(&mut web).await.unwrap();
        server.await.unwrap();

        assert_eq!(reply.status(), Some(200));
        assert_eq!(reply.header("x-remote-user"), Some("alice"));
        assert!(reply.reuse);
        assert!(reply.body.is_empty());
    }

    #[tokio::test]
    async fn cping_expects_cpong() {
        let (mut web, mut container) = tokio::io::duplex(1024);
        let server = tokio::spawn(async move {
            let mut msg = Msg::default();
            read_message(&mut container, &mut msg).await.unwrap();
            assert_eq!(msg.get_byte().unwrap(), JK_AJP13_CPING_REQUEST);
            encode_cpong(&mut msg).unwrap();
            write_message(&mut container, &msg).await.unwrap();
            container.flush().await.unwrap();
        });

        cping(&mut web).await.unwrap();
        server.await.unwrap();
    }
}
