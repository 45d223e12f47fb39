// SPDX-License-Identifier: AGPL-3.0-only
//! TCP channel: port probing, the accept loop, and the per-connection
//! receive/dispatch loop.
//!
//! Each accepted socket gets its own task for its lifetime and keeps reading
//! packets until the peer goes away, a handler asks to close, or the channel
//! is stopped. Pausing only stops accepting; the bound socket and existing
//! connections are untouched.

use crate::context::MsgContext;
use crate::dispatch::{Dispatcher, HandlerStatus};
use crate::metrics::metrics;
use ajp_proto::{DEFAULT_PACKET_SIZE, Msg, ReadStatus, message_type_name};
use anyhow::{Context, Result, bail};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Semaphore, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Running,
    Paused,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub host: IpAddr,
    /// First port tried; 0 disables the channel.
    pub port: u16,
    /// Last port tried when the earlier ones are taken.
    pub max_port: u16,
    pub max_connections: usize,
    pub tcp_no_delay: bool,
    /// Idle read timeout; `None` waits forever.
    pub so_timeout: Option<Duration>,
    pub packet_size: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 8009,
            max_port: 8019,
            max_connections: 200,
            tcp_no_delay: true,
            so_timeout: None,
            packet_size: DEFAULT_PACKET_SIZE,
        }
    }
}

/// Pause, resume and stop handle shared by the accept loop, connection
/// tasks and anything that needs to steer them.
#[derive(Clone)]
pub struct ChannelControl {
    state: Arc<watch::Sender<ChannelState>>,
}

impl Default for ChannelControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelControl {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ChannelState::Running);
        Self {
            state: Arc::new(tx),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    pub fn pause(&self) {
        self.transition(ChannelState::Paused);
    }

    pub fn resume(&self) {
        self.transition(ChannelState::Running);
    }

    /// Stopping is final: later pause/resume calls are ignored.
    pub fn shutdown(&self) {
        self.transition(ChannelState::Stopped);
    }

    fn transition(&self, next: ChannelState) {
        self.state.send_if_modified(|current| {
            if *current == ChannelState::Stopped || *current == next {
                return false;
            }
            info!(from = ?*current, to = ?next, "channel state change");
            *current = next;
            true
        });
    }
}

/// Resolves once the channel is stopped (or its control is gone).
async fn stopped(state: &mut watch::Receiver<ChannelState>) {
    loop {
        if *state.borrow_and_update() == ChannelState::Stopped {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

pub struct Channel {
    listener: TcpListener,
    local: SocketAddr,
    config: ChannelConfig,
    dispatcher: Arc<Dispatcher>,
    control: ChannelControl,
    limiter: Arc<Semaphore>,
}

impl Channel {
    /// Binds the first free port in `port..=max_port`. `Ok(None)` when the
    /// channel is disabled with port 0.
    pub async fn bind(
        config: ChannelConfig,
        dispatcher: Arc<Dispatcher>,
        control: ChannelControl,
    ) -> Result<Option<Self>> {
        if config.port == 0 {
            info!("AJP channel disabled (port 0)");
            return Ok(None);
        }
        let last = config.max_port.max(config.port);
        for port in config.port..=last {
            let addr = SocketAddr::new(config.host, port);
            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    return Self::with_listener(listener, config, dispatcher, control).map(Some);
                }
                Err(e) => debug!(addr = %addr, error = %e, "port unavailable, trying next"),
            }
        }
        bail!(
            "no free port for the AJP channel in {}:{}..={}",
            config.host,
            config.port,
            last
        )
    }

    pub fn with_listener(
        listener: TcpListener,
        config: ChannelConfig,
        dispatcher: Arc<Dispatcher>,
        control: ChannelControl,
    ) -> Result<Self> {
        let local = listener.local_addr().context("reading channel address")?;
        let limiter = Arc::new(Semaphore::new(config.max_connections.max(1)));
        Ok(Self {
            listener,
            local,
            config,
            dispatcher,
            control,
            limiter,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn control(&self) -> ChannelControl {
        self.control.clone()
    }

    /// Runs the accept loop until the channel is stopped. The listening
    /// socket is closed on return.
    pub async fn serve(self) -> Result<()> {
        info!(addr = %self.local, "listening for AJP13");
        let mut state = self.control.subscribe();
        loop {
            let current = *state.borrow_and_update();
            match current {
                ChannelState::Stopped => break,
                ChannelState::Paused => {
                    if state.changed().await.is_err() {
                        break;
                    }
                    continue;
                }
                ChannelState::Running => {}
            }

            let permit = tokio::select! {
                permit = Arc::clone(&self.limiter).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let (socket, peer) = tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        metrics().connections_total.with_label_values(&["error"]).inc();
                        continue;
                    }
                },
                changed = state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };

            if let Err(e) = socket.set_nodelay(self.config.tcp_no_delay) {
                debug!(peer = %peer, error = %e, "failed to set TCP_NODELAY");
            }
            metrics().connections_total.with_label_values(&["accepted"]).inc();
            debug!(peer = %peer, "accepted AJP connection");

            let dispatcher = Arc::clone(&self.dispatcher);
            let state = self.control.subscribe();
            let config = self.config.clone();
            let local = self.local;
            tokio::spawn(async move {
                let _permit = permit;
                metrics().connections_active.inc();
                let status = process_connection(socket, peer, local, dispatcher, state, &config).await;
                metrics().connections_active.dec();
                debug!(peer = %peer, status, "AJP connection finished");
            });
        }
        info!(addr = %self.local, "AJP channel stopped");
        Ok(())
    }
}

/// Receives and dispatches packets until the connection ends. Returns the
/// final status: 0 after a handler closed the connection, a handler error as
/// -6, otherwise the negative receive status.
async fn process_connection(
    socket: TcpStream,
    peer: SocketAddr,
    local: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    mut state: watch::Receiver<ChannelState>,
    config: &ChannelConfig,
) -> i32 {
    let mut ctx = MsgContext::new(Box::new(socket), peer, local, config.packet_size);
    let mut msg = Msg::new(config.packet_size);
    loop {
        let received = tokio::select! {
            received = receive(&mut ctx, &mut msg, config.so_timeout) => received,
            _ = stopped(&mut state) => Err(ReadStatus::RemoteClosed),
        };
        if let Err(status) = received {
            let code = status.code();
            metrics()
                .receive_failures_total
                .with_label_values(&[code.to_string().as_str()])
                .inc();
            if matches!(status, ReadStatus::RemoteClosed) {
                debug!(peer = %peer, "connection closed");
            } else {
                warn!(peer = %peer, code, error = %status, "closing connection after receive failure");
            }
            return code;
        }

        let kind = msg.peek_byte().unwrap_or(0);
        metrics()
            .messages_total
            .with_label_values(&[message_type_name(kind)])
            .inc();
        debug!(peer = %peer, kind = message_type_name(kind), len = msg.body_len(), "received");

        match dispatcher.dispatch(&mut msg, &mut ctx).await {
            HandlerStatus::Ok => ctx.recycle(),
            HandlerStatus::Close => return 0,
            HandlerStatus::Error => {
                warn!(peer = %peer, kind = message_type_name(kind), "handler failed, closing connection");
                return -6;
            }
        }
    }
}

async fn receive(
    ctx: &mut MsgContext,
    msg: &mut Msg,
    timeout: Option<Duration>,
) -> Result<usize, ReadStatus> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, ctx.receive(msg)).await {
            Ok(received) => received,
            Err(_) => {
                debug!(peer = %ctx.peer(), "idle read timeout");
                Err(ReadStatus::RemoteClosed)
            }
        },
        None => ctx.receive(msg).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::Handler;
    use ajp_proto::client::cping;
    use ajp_proto::encode_cpong;
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Pong;

    #[async_trait]
    impl Handler for Pong {
        fn name(&self) -> &str {
            "pong"
        }

        async fn invoke(&self, _msg: &mut Msg, ctx: &mut MsgContext) -> HandlerStatus {
            if ctx.send_with(encode_cpong).await.is_err() || ctx.flush().await.is_err() {
                return HandlerStatus::Error;
            }
            HandlerStatus::Ok
        }
    }

    async fn start(config: ChannelConfig) -> (SocketAddr, ChannelControl, tokio::task::JoinHandle<Result<()>>) {
        let mut dispatcher = Dispatcher::default();
        dispatcher
            .register(ajp_proto::JK_AJP13_CPING_REQUEST, Arc::new(Pong))
            .unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let channel =
            Channel::with_listener(listener, config, Arc::new(dispatcher), ChannelControl::new())
                .unwrap();
        let addr = channel.local_addr();
        let control = channel.control();
        (addr, control, tokio::spawn(channel.serve()))
    }

    #[tokio::test]
    async fn keep_alive_serves_several_packets() {
        let (addr, control, handle) = start(ChannelConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        for _ in 0..3 {
            cping(&mut stream).await.unwrap();
        }
        control.shutdown();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn unknown_type_closes_connection() {
        let (addr, control, _handle) = start(ChannelConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&[0x12, 0x34, 0x00, 0x01, 0x07]).await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        control.shutdown();
    }

    #[tokio::test]
    async fn empty_packet_is_dispatched_and_closes_connection() {
        let (addr, control, _handle) = start(ChannelConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let failures = metrics()
            .receive_failures_total
            .with_label_values(&["-1"])
            .get();
        stream.write_all(&[0x12, 0x34, 0x00, 0x00]).await.unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(stream.read(&mut buf).await.unwrap(), 0);
        assert_eq!(
            metrics()
                .receive_failures_total
                .with_label_values(&["-1"])
                .get(),
            failures
        );
        control.shutdown();
    }

    #[tokio::test]
    async fn shutdown_terminates_open_connections() {
        let (addr, control, handle) = start(ChannelConfig::default()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        cping(&mut stream).await.unwrap();

        control.shutdown();
        handle.await.unwrap().unwrap();
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn pause_holds_new_connections_until_resume() {
        let (addr, control, _handle) = start(ChannelConfig::default()).await;
        control.pause();
        assert_eq!(control.state(), ChannelState::Paused);
        tokio::task::yield_now().await;

        // The socket stays bound, so the connect succeeds at the TCP level,
        // but nothing answers until the channel resumes.
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let early = tokio::time::timeout(Duration::from_millis(200), cping(&mut stream)).await;
        assert!(early.is_err());

        control.resume();
        let mut fresh = TcpStream::connect(addr).await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), cping(&mut fresh))
            .await
            .unwrap()
            .unwrap();
        control.shutdown();
    }

    #[tokio::test]
    async fn stop_is_final() {
        let control = ChannelControl::new();
        control.shutdown();
        control.resume();
        assert_eq!(control.state(), ChannelState::Stopped);
    }

    #[tokio::test]
    async fn bind_probes_past_taken_ports() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let config = ChannelConfig {
            port,
            max_port: port.saturating_add(20),
            ..ChannelConfig::default()
        };
        let channel = Channel::bind(config, Arc::new(Dispatcher::default()), ChannelControl::new())
            .await
            .unwrap()
            .unwrap();
        assert_ne!(channel.local_addr().port(), port);
        assert!(channel.local_addr().port() > port);
    }

    #[tokio::test]
    async fn port_zero_disables_channel() {
        let config = ChannelConfig {
            port: 0,
            ..ChannelConfig::default()
        };
        let channel = Channel::bind(config, Arc::new(Dispatcher::default()), ChannelControl::new())
            .await
            .unwrap();
        assert!(channel.is_none());
    }

    #[tokio::test]
    async fn idle_timeout_closes_connection() {
        let (addr, control, _handle) = start(ChannelConfig {
            so_timeout: Some(Duration::from_millis(50)),
            ..ChannelConfig::default()
        })
        .await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 8];
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        control.shutdown();
    }
}
