// SPDX-License-Identifier: AGPL-3.0-only
//! Builds the realm stack from the command line: configured stores under a
//! combined realm, wrapped by the lock-out layer.

use crate::config::Args;
use crate::metrics::metrics;
use ajp_realm::{
    CombinedRealm, CredentialHandler, DataSourceRealm, LockOutRealm, MemoryRealm, PgDataSource,
    Realm,
};
use anyhow::{Result, bail};
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

pub struct RealmStack {
    /// Outermost realm; what requests authenticate against.
    pub realm: Arc<dyn Realm>,
    pub lockout: Option<Arc<LockOutRealm>>,
    pub memory: Option<Arc<MemoryRealm>>,
}

pub async fn build_realms(args: &Args, handler: Arc<dyn CredentialHandler>) -> Result<RealmStack> {
    let combined = CombinedRealm::default();

    let mut memory = None;
    if let Some(path) = &args.users_file {
        let realm = Arc::new(MemoryRealm::from_file(path, Arc::clone(&handler))?);
        info!(path = %path.display(), users = realm.len(), "memory realm loaded");
        combined.add_realm(realm.clone());
        memory = Some(realm);
    }
    if let Some((url, config)) = args.datasource_config() {
        let source = Arc::new(PgDataSource::new(url));
        let realm = DataSourceRealm::new(source, Arc::clone(&handler), config)?;
        info!("database realm configured");
        combined.add_realm(Arc::new(realm));
    }
    if combined.realms().is_empty() {
        bail!("no realm configured; set --users-file and/or --db-url");
    }

    combined.start().await?;
    if combined.realms().is_empty() {
        bail!("every configured realm failed to start");
    }
    let combined: Arc<dyn Realm> = Arc::new(combined);

    let Some(config) = args.lockout_config() else {
        warn!("lock-out protection disabled");
        return Ok(RealmStack {
            realm: combined,
            lockout: None,
            memory,
        });
    };
    info!(
        failure_count = config.failure_count,
        lock_out_secs = config.lock_out_time.as_secs(),
        cache_size = config.cache_size,
        "lock-out protection enabled"
    );
    let lockout = Arc::new(LockOutRealm::new(combined, config));
    Ok(RealmStack {
        realm: lockout.clone(),
        lockout: Some(lockout),
        memory,
    })
}

pub fn reload_users(memory: &MemoryRealm) {
    match memory.reload() {
        Ok(count) => {
            metrics().realm_reload_total.with_label_values(&["success"]).inc();
            info!(users = count, "reloaded users after SIGHUP");
        }
        Err(err) => {
            metrics().realm_reload_total.with_label_values(&["error"]).inc();
            warn!(error = %err, "failed to reload users on SIGHUP, keeping previous table");
        }
    }
}

pub async fn watch_sighup(memory: Arc<MemoryRealm>) {
    match signal(SignalKind::hangup()) {
        Ok(mut stream) => {
            while stream.recv().await.is_some() {
                reload_users(&memory);
            }
        }
        Err(err) => warn!(error = %err, "failed to install SIGHUP handler"),
    }
}
