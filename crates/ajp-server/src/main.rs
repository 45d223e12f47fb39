// SPDX-License-Identifier: AGPL-3.0-only
use crate::channel::{Channel, ChannelControl};
use crate::config::{Args, LogFormat};
use crate::dispatch::{Dispatcher, Handler};
use crate::gate::RealmGate;
use crate::http::{ServerState, serve_http};
use crate::realms::{build_realms, watch_sighup};
use crate::request::RequestHandler;
use ajp_proto::{
    JK_AJP13_CPING_REQUEST, JK_AJP13_FORWARD_REQUEST, JK_AJP13_PING_REQUEST, JK_AJP13_SHUTDOWN,
};
use ajp_realm::digest_passwords;
use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::UtcTime;

fn init_logging(args: &Args) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&args.log_level))
        .context("invalid log level")?;
    let builder = tracing_subscriber::fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_env_filter(filter);
    match args.log_format {
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish())?,
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let handler = args.credential_handler()?;

    if !args.digest.is_empty() {
        for line in digest_passwords(handler.as_ref(), args.digest.as_slice()) {
            println!("{line}");
        }
        return Ok(());
    }

    init_logging(&args)?;

    let stack = build_realms(&args, handler).await?;
    let control = ChannelControl::new();

    let mut gate = RealmGate::new(stack.realm.clone(), args.realm_name.clone())
        .with_required_role(args.required_role.clone());
    if let Some(lockout) = &stack.lockout {
        gate = gate.with_lockout(lockout.clone());
    }
    let requests: Arc<dyn Handler> = Arc::new(
        RequestHandler::new(Arc::new(gate), control.clone())
            .with_secret(args.secret.clone())
            .with_shutdown_enabled(args.shutdown_enabled),
    );
    if args.secret.is_none() {
        warn!("no AJP secret configured; any peer that reaches the port is trusted");
    }

    let mut dispatcher = Dispatcher::default();
    for code in [
        JK_AJP13_FORWARD_REQUEST,
        JK_AJP13_SHUTDOWN,
        JK_AJP13_PING_REQUEST,
        JK_AJP13_CPING_REQUEST,
    ] {
        dispatcher.register(code, requests.clone())?;
    }
    let dispatcher = Arc::new(dispatcher);

    let state = ServerState::new()
        .with_realm(stack.realm.clone())
        .with_control(control.clone());
    let mut handles = Vec::new();

    if let Some(addr) = args.listen_http {
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            if let Err(err) = serve_http(addr, state).await {
                error!(error = %err, "HTTP listener stopped");
            }
        }));
    }

    if let Some(memory) = stack.memory.clone() {
        handles.push(tokio::spawn(watch_sighup(memory)));
    }

    let Some(channel) = Channel::bind(args.channel_config(), dispatcher, control.clone()).await?
    else {
        if handles.is_empty() {
            return Ok(());
        }
        tokio::signal::ctrl_c().await?;
        return Ok(());
    };

    tokio::spawn(state.clone().follow_channel(control.subscribe()));
    let interrupt = control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping AJP channel");
            interrupt.shutdown();
        }
    });

    if let Err(err) = channel.serve().await {
        error!(error = %err, "AJP channel stopped");
    }
    for handle in handles {
        handle.abort();
    }
    info!("ajp-server exiting");
    Ok(())
}

mod channel;
mod config;
mod context;
mod dispatch;
mod gate;
mod http;
mod metrics;
mod realms;
mod request;
