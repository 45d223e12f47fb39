// SPDX-License-Identifier: AGPL-3.0-only
//! Handler for the web server's packets: forward requests, pings and
//! shutdown requests.

use crate::channel::ChannelControl;
use crate::context::MsgContext;
use crate::dispatch::{Handler, HandlerStatus};
use ajp_proto::{
    JK_AJP13_CPING_REQUEST, JK_AJP13_FORWARD_REQUEST, JK_AJP13_PING_REQUEST, JK_AJP13_SHUTDOWN,
    Msg, decode_forward_request, encode_cpong,
};
use async_trait::async_trait;
use openssl::memcmp;
use std::sync::Arc;
use tracing::{debug, info, warn};

fn secrets_match(required: &str, offered: &str) -> bool {
    required.len() == offered.len() && memcmp::eq(required.as_bytes(), offered.as_bytes())
}

pub struct RequestHandler {
    secret: Option<String>,
    shutdown_enabled: bool,
    control: ChannelControl,
    next: Arc<dyn Handler>,
}

impl RequestHandler {
    pub fn new(next: Arc<dyn Handler>, control: ChannelControl) -> Self {
        Self {
            secret: None,
            shutdown_enabled: false,
            control,
            next,
        }
    }

    /// Every forward request must carry this secret.
    pub fn with_secret(mut self, secret: Option<String>) -> Self {
        self.secret = secret.filter(|s| !s.is_empty());
        self
    }

    pub fn with_shutdown_enabled(mut self, enabled: bool) -> Self {
        self.shutdown_enabled = enabled;
        self
    }

    fn secret_matches(&self, offered: Option<&str>) -> bool {
        match (&self.secret, offered) {
            (None, _) => true,
            (Some(required), Some(offered)) => secrets_match(required, offered),
            (Some(_), None) => false,
        }
    }

    async fn pong(&self, ctx: &mut MsgContext) -> HandlerStatus {
        if let Err(e) = ctx.send_with(encode_cpong).await {
            warn!(peer = %ctx.peer(), error = %e, "failed to send CPONG");
            return HandlerStatus::Error;
        }
        if let Err(e) = ctx.flush().await {
            warn!(peer = %ctx.peer(), error = %e, "failed to flush CPONG");
            return HandlerStatus::Error;
        }
        HandlerStatus::Ok
    }

    async fn shutdown(&self, msg: &mut Msg, ctx: &mut MsgContext) -> HandlerStatus {
        let offered = if msg.remaining() > 0 {
            msg.get_string().ok().flatten()
        } else {
            None
        };
        if !self.shutdown_enabled {
            warn!(peer = %ctx.peer(), "shutdown request ignored, shutdown is disabled");
            return HandlerStatus::Error;
        }
        if ctx.peer().ip() != ctx.local().ip() {
            warn!(peer = %ctx.peer(), "shutdown request from a foreign address denied");
            return HandlerStatus::Error;
        }
        if !self.secret_matches(offered.as_deref()) {
            warn!(peer = %ctx.peer(), "shutdown request with wrong secret denied");
            return HandlerStatus::Error;
        }
        info!(peer = %ctx.peer(), "shutdown requested by web server");
        self.control.shutdown();
        HandlerStatus::Close
    }

    async fn forward(&self, msg: &mut Msg, ctx: &mut MsgContext) -> HandlerStatus {
        let request = match decode_forward_request(msg) {
            Ok(request) => request,
            Err(e) => {
                warn!(peer = %ctx.peer(), error = %e, "malformed forward request");
                debug!("{}", msg.dump("rejected"));
                return HandlerStatus::Error;
            }
        };
        if !self.secret_matches(request.attributes.secret.as_deref()) {
            warn!(peer = %ctx.peer(), uri = %request.request_uri, "forward request without the required secret");
            return HandlerStatus::Error;
        }

        // The web server sends the first body packet unasked when there is a body.
        let mut body = Vec::new();
        if request.content_length.unwrap_or(0) > 0 {
            let mut chunk = Msg::new(ctx.packet_size());
            if let Err(status) = ctx.receive(&mut chunk).await {
                warn!(peer = %ctx.peer(), code = status.code(), error = %status, "initial body packet missing");
                return HandlerStatus::Close;
            }
            match chunk.get_body_bytes() {
                Ok(bytes) => body = bytes,
                Err(e) => {
                    warn!(peer = %ctx.peer(), error = %e, "malformed body packet");
                    return HandlerStatus::Error;
                }
            }
        }

        debug!(
            peer = %ctx.peer(),
            method = %request.method,
            uri = %request.request_uri,
            headers = request.headers.len(),
            body = body.len(),
            "forward request"
        );
        ctx.set_request(request, body);
        self.next.invoke(msg, ctx).await
    }
}

#[async_trait]
impl Handler for RequestHandler {
    fn name(&self) -> &str {
        "request"
    }

    async fn invoke(&self, msg: &mut Msg, ctx: &mut MsgContext) -> HandlerStatus {
        let kind = match msg.get_byte() {
            Ok(kind) => kind,
            Err(_) => return HandlerStatus::Error,
        };
        match kind {
            JK_AJP13_CPING_REQUEST | JK_AJP13_PING_REQUEST => self.pong(ctx).await,
            JK_AJP13_SHUTDOWN => self.shutdown(msg, ctx).await,
            JK_AJP13_FORWARD_REQUEST => self.forward(msg, ctx).await,
            other => {
                warn!(peer = %ctx.peer(), code = other, "unexpected message type for request handler");
                HandlerStatus::Error
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ajp_proto::{ForwardRequest, Response, decode_response, encode_forward_request, read_message};
    use std::net::SocketAddr;
    use std::sync::Mutex;
    use tokio::io::{AsyncWriteExt, DuplexStream};

    #[derive(Default)]
    struct Capture {
        seen: Mutex<Vec<(ForwardRequest, Vec<u8>)>>,
    }

    #[async_trait]
    impl Handler for Capture {
        fn name(&self) -> &str {
            "capture"
        }

        async fn invoke(&self, _msg: &mut Msg, ctx: &mut MsgContext) -> HandlerStatus {
            let request = ctx.request().cloned().unwrap();
            self.seen.lock().unwrap().push((request, ctx.body().to_vec()));
            HandlerStatus::Ok
        }
    }

    fn context(peer: [u8; 4]) -> (MsgContext, DuplexStream) {
        let (server, client) = tokio::io::duplex(64 * 1024);
        let ctx = MsgContext::new(
            Box::new(server),
            SocketAddr::from((peer, 40000)),
            SocketAddr::from(([127, 0, 0, 1], 8009)),
            8192,
        );
        (ctx, client)
    }

    fn loaded(build: impl FnOnce(&mut Msg)) -> Msg {
        let mut out = Msg::default();
        build(&mut out);
        let mut msg = Msg::default();
        msg.load(out.as_bytes()).unwrap();
        msg
    }

    fn forward(request: &ForwardRequest) -> Msg {
        loaded(|m| encode_forward_request(m, request).unwrap())
    }

    fn handler(capture: &Arc<Capture>) -> (RequestHandler, ChannelControl) {
        let control = ChannelControl::new();
        (RequestHandler::new(capture.clone(), control.clone()), control)
    }

    #[tokio::test]
    async fn cping_answers_cpong() {
        let capture = Arc::new(Capture::default());
        let (handler, _) = handler(&capture);
        let (mut ctx, mut client) = context([127, 0, 0, 1]);
        let mut msg = loaded(|m| {
            m.append_byte(JK_AJP13_CPING_REQUEST).unwrap();
            m.end_request();
        });

        assert_eq!(handler.invoke(&mut msg, &mut ctx).await, HandlerStatus::Ok);
        let mut reply = Msg::default();
        read_message(&mut client, &mut reply).await.unwrap();
        assert_eq!(decode_response(&mut reply).unwrap(), Response::CPong);
    }

    #[tokio::test]
    async fn forward_request_reaches_next_handler() {
        let capture = Arc::new(Capture::default());
        let (handler, _) = handler(&capture);
        let (mut ctx, _client) = context([127, 0, 0, 1]);
        let request = ForwardRequest::new("GET", "/app/index.html")
            .with_header("Host", "example.org")
            .with_header("X-Custom", "1");

        assert_eq!(handler.invoke(&mut forward(&request), &mut ctx).await, HandlerStatus::Ok);
        let seen = capture.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0.method, "GET");
        assert_eq!(seen[0].0.request_uri, "/app/index.html");
        assert_eq!(seen[0].0.header("x-custom"), Some("1"));
        assert!(seen[0].1.is_empty());
    }

    #[tokio::test]
    async fn initial_body_packet_is_consumed() {
        let capture = Arc::new(Capture::default());
        let (handler, _) = handler(&capture);
        let (mut ctx, mut client) = context([127, 0, 0, 1]);
        let request = ForwardRequest::new("POST", "/submit").with_header("Content-Length", "5");

        let mut body = Msg::default();
        body.append_body_bytes(b"hello").unwrap();
        body.end_request();
        client.write_all(body.as_bytes()).await.unwrap();

        assert_eq!(handler.invoke(&mut forward(&request), &mut ctx).await, HandlerStatus::Ok);
        let seen = capture.seen.lock().unwrap();
        assert_eq!(seen[0].1, b"hello");
    }

    #[tokio::test]
    async fn secret_mismatch_is_not_forwarded() {
        let capture = Arc::new(Capture::default());
        let (handler, _) = handler(&capture);
        let handler = handler.with_secret(Some("s3cret".into()));
        let (mut ctx, _client) = context([127, 0, 0, 1]);

        let mut request = ForwardRequest::new("GET", "/");
        assert_eq!(handler.invoke(&mut forward(&request), &mut ctx).await, HandlerStatus::Error);
        request.attributes.secret = Some("wrong".into());
        assert_eq!(handler.invoke(&mut forward(&request), &mut ctx).await, HandlerStatus::Error);
        assert!(capture.seen.lock().unwrap().is_empty());

        request.attributes.secret = Some("s3cret".into());
        assert_eq!(handler.invoke(&mut forward(&request), &mut ctx).await, HandlerStatus::Ok);
        assert_eq!(capture.seen.lock().unwrap().len(), 1);
    }

    fn shutdown_packet(secret: Option<&str>) -> Msg {
        loaded(|m| {
            m.append_byte(JK_AJP13_SHUTDOWN).unwrap();
            if secret.is_some() {
                m.append_string(secret).unwrap();
            }
            m.end_request();
        })
    }

    #[tokio::test]
    async fn shutdown_requires_enablement_local_peer_and_secret() {
        let capture = Arc::new(Capture::default());

        let (disabled, control) = handler(&capture);
        let (mut ctx, _c) = context([127, 0, 0, 1]);
        assert_eq!(disabled.invoke(&mut shutdown_packet(None), &mut ctx).await, HandlerStatus::Error);
        assert_eq!(control.state(), crate::channel::ChannelState::Running);

        let (enabled, control) = handler(&capture);
        let enabled = enabled
            .with_shutdown_enabled(true)
            .with_secret(Some("s3cret".into()));
        let (mut foreign, _c) = context([10, 0, 0, 9]);
        assert_eq!(
            enabled.invoke(&mut shutdown_packet(Some("s3cret")), &mut foreign).await,
            HandlerStatus::Error
        );
        let (mut local, _c) = context([127, 0, 0, 1]);
        assert_eq!(
            enabled.invoke(&mut shutdown_packet(Some("nope")), &mut local).await,
            HandlerStatus::Error
        );
        assert_eq!(control.state(), crate::channel::ChannelState::Running);

        assert_eq!(
            enabled.invoke(&mut shutdown_packet(Some("s3cret")), &mut local).await,
            HandlerStatus::Close
        );
        assert_eq!(control.state(), crate::channel::ChannelState::Stopped);
    }

    #[test]
    fn secret_comparison() {
        assert!(secrets_match("abc", "abc"));
        assert!(!secrets_match("abc", "abd"));
        assert!(!secrets_match("abc", "abcd"));
    }
}
