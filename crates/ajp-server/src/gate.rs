// SPDX-License-Identifier: AGPL-3.0-only
//! Terminal handler: authenticates the forwarded request's Basic credentials
//! against the realm and answers with the outcome.

use crate::context::MsgContext;
use crate::dispatch::{Handler, HandlerStatus};
use crate::metrics::{AuthTimer, metrics};
use ajp_proto::{Msg, SendHeaders};
use ajp_realm::{LockOutRealm, Realm};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Splits an `Authorization: Basic ...` value into username and password.
pub fn parse_basic(header: &str) -> Option<(String, String)> {
    let (scheme, encoded) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("basic") {
        return None;
    }
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

pub struct RealmGate {
    realm: Arc<dyn Realm>,
    lockout: Option<Arc<LockOutRealm>>,
    realm_name: String,
    required_role: Option<String>,
}

impl RealmGate {
    pub fn new(realm: Arc<dyn Realm>, realm_name: impl Into<String>) -> Self {
        Self {
            realm,
            lockout: None,
            realm_name: realm_name.into(),
            required_role: None,
        }
    }

    /// Lets failures be reported as lock-outs when the user is locked.
    pub fn with_lockout(mut self, lockout: Arc<LockOutRealm>) -> Self {
        self.lockout = Some(lockout);
        self
    }

    pub fn with_required_role(mut self, role: Option<String>) -> Self {
        self.required_role = role.filter(|r| !r.is_empty());
        self
    }

    fn challenge(&self) -> (SendHeaders, Vec<u8>) {
        let body = b"authentication required\n".to_vec();
        let headers = SendHeaders {
            status: 401,
            message: "Unauthorized".into(),
            headers: vec![
                (
                    "WWW-Authenticate".into(),
                    format!("Basic realm=\"{}\"", self.realm_name),
                ),
                ("Content-Type".into(), "text/plain; charset=utf-8".into()),
                ("Content-Length".into(), body.len().to_string()),
            ],
        };
        (headers, body)
    }

    async fn decide(&self, authorization: Option<String>) -> (SendHeaders, Vec<u8>) {
        let Some((user, pass)) = authorization.as_deref().and_then(parse_basic) else {
            debug!("no usable Basic credentials");
            return self.challenge();
        };

        let timer = AuthTimer::new();
        let outcome = self.realm.authenticate(&user, &pass).await;
        if let Some(lockout) = &self.lockout {
            metrics()
                .lockout_cached_users
                .set(lockout.cached_users() as f64);
        }

        let Some(principal) = outcome else {
            let locked = self.lockout.as_ref().is_some_and(|l| l.is_locked(&user));
            timer.finish(if locked { "locked" } else { "fail" });
            info!(user = %user, locked, "authentication failed");
            return self.challenge();
        };

        if let Some(role) = &self.required_role {
            if !principal.has_role(role) {
                timer.finish("forbidden");
                warn!(user = %user, role = %role, "authenticated user lacks required role");
                let body = b"forbidden\n".to_vec();
                let headers = SendHeaders {
                    status: 403,
                    message: "Forbidden".into(),
                    headers: vec![
                        ("Content-Type".into(), "text/plain; charset=utf-8".into()),
                        ("Content-Length".into(), body.len().to_string()),
                    ],
                };
                return (headers, body);
            }
        }

        timer.finish("pass");
        info!(user = %principal.name(), roles = ?principal.roles(), "authenticated");
        let body = format!("{}\n", principal.name()).into_bytes();
        let headers = SendHeaders {
            status: 200,
            message: "OK".into(),
            headers: vec![
                ("X-Remote-User".into(), principal.name().to_string()),
                ("X-Remote-Roles".into(), principal.roles().join(",")),
                ("Content-Type".into(), "text/plain; charset=utf-8".into()),
                ("Content-Length".into(), body.len().to_string()),
            ],
        };
        (headers, body)
    }
}

#[async_trait]
impl Handler for RealmGate {
    fn name(&self) -> &str {
        "realm-gate"
    }

    async fn invoke(&self, _msg: &mut Msg, ctx: &mut MsgContext) -> HandlerStatus {
        let Some(request) = ctx.request() else {
            warn!(peer = %ctx.peer(), "realm gate invoked without a request");
            return HandlerStatus::Error;
        };
        let authorization = request.header("authorization").map(str::to_owned);

        let (headers, body) = self.decide(authorization).await;
        match ctx.send_response(&headers, &body).await {
            Ok(()) => HandlerStatus::Ok,
            Err(e) => {
                warn!(peer = %ctx.peer(), error = %e, "failed to send response");
                HandlerStatus::Error
            }
        }
    }
}
