// SPDX-License-Identifier: AGPL-3.0-only
//! Routes each inbound packet to the handler registered for its type byte.

use crate::context::MsgContext;
use ajp_proto::{MAX_MESSAGE_TYPE, Msg, message_type_name};
use anyhow::{Result, bail};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error};

/// What the connection loop does after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerStatus {
    /// Keep the connection and read the next packet.
    Ok,
    Error,
    /// Close the connection without an error.
    Close,
}

#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;

    /// `msg` holds the whole packet with the cursor on the type byte.
    async fn invoke(&self, msg: &mut Msg, ctx: &mut MsgContext) -> HandlerStatus;
}

pub struct Dispatcher {
    handlers: Vec<Option<Arc<dyn Handler>>>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self {
            handlers: vec![None; MAX_MESSAGE_TYPE as usize + 1],
        }
    }
}

impl Dispatcher {
    pub fn register(&mut self, code: u8, handler: Arc<dyn Handler>) -> Result<()> {
        let Some(slot) = self.handlers.get_mut(code as usize) else {
            bail!("message type {code} is outside the dispatch table");
        };
        debug!(code, kind = message_type_name(code), handler = handler.name(), "handler registered");
        *slot = Some(handler);
        Ok(())
    }

    pub fn handler(&self, code: u8) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(code as usize).and_then(Option::as_ref)
    }

    pub async fn dispatch(&self, msg: &mut Msg, ctx: &mut MsgContext) -> HandlerStatus {
        let code = match msg.peek_byte() {
            Ok(code) => code,
            Err(e) => {
                error!(peer = %ctx.peer(), error = %e, "empty AJP message");
                return HandlerStatus::Error;
            }
        };
        match self.handler(code) {
            Some(handler) => handler.invoke(msg, ctx).await,
            None => {
                error!(peer = %ctx.peer(), code, "no handler for AJP message type");
                HandlerStatus::Error
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl Handler for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        async fn invoke(&self, _msg: &mut Msg, _ctx: &mut MsgContext) -> HandlerStatus {
            self.0.fetch_add(1, Ordering::SeqCst);
            HandlerStatus::Ok
        }
    }

    fn ctx() -> MsgContext {
        let (server, _client) = tokio::io::duplex(64);
        let addr = SocketAddr::from(([127, 0, 0, 1], 8009));
        MsgContext::new(Box::new(server), addr, addr, 8192)
    }

    fn packet(code: u8) -> Msg {
        let mut msg = Msg::default();
        msg.append_byte(code).unwrap();
        msg.end_request();
        let bytes = msg.as_bytes().to_vec();
        let mut loaded = Msg::default();
        loaded.load(&bytes).unwrap();
        loaded
    }

    #[tokio::test]
    async fn dispatches_by_type_byte() {
        let handler = Arc::new(Counting(AtomicUsize::new(0)));
        let mut dispatcher = Dispatcher::default();
        dispatcher
            .register(ajp_proto::JK_AJP13_CPING_REQUEST, handler.clone())
            .unwrap();

        let mut ctx = ctx();
        let status = dispatcher
            .dispatch(&mut packet(ajp_proto::JK_AJP13_CPING_REQUEST), &mut ctx)
            .await;
        assert_eq!(status, HandlerStatus::Ok);
        assert_eq!(handler.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unregistered_and_out_of_range_types_are_errors() {
        let dispatcher = Dispatcher::default();
        let mut ctx = ctx();
        assert_eq!(
            dispatcher.dispatch(&mut packet(ajp_proto::JK_AJP13_SHUTDOWN), &mut ctx).await,
            HandlerStatus::Error
        );
        assert_eq!(dispatcher.dispatch(&mut packet(200), &mut ctx).await, HandlerStatus::Error);
    }

    #[test]
    fn register_rejects_codes_outside_table() {
        let mut dispatcher = Dispatcher::default();
        let handler = Arc::new(Counting(AtomicUsize::new(0)));
        assert!(dispatcher.register(MAX_MESSAGE_TYPE + 1, handler).is_err());
    }
}
