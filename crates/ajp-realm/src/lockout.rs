// SPDX-License-Identifier: AGPL-3.0-only
//! Brute-force protection: a realm decorator that locks a username out after
//! repeated failed authentications.
//!
//! Failure records live in a bounded LRU cache. Once a user reaches
//! `failure_count` failures, every authentication for that user fails until
//! `lock_out_time` has passed since the last failure, even with the right
//! credentials. A successful authentication while unlocked clears the record.

use crate::clock::{Clock, SystemClock};
use crate::credential::CredentialHandler;
use crate::error::RealmError;
use crate::principal::Principal;
use crate::realm::Realm;
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_FAILURE_COUNT: u32 = 5;
pub const DEFAULT_LOCK_OUT_TIME: Duration = Duration::from_secs(300);
pub const DEFAULT_CACHE_SIZE: usize = 1000;
pub const DEFAULT_CACHE_REMOVAL_WARNING_TIME: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct LockOutConfig {
    pub failure_count: u32,
    pub lock_out_time: Duration,
    pub cache_size: usize,
    /// Evicting a record whose last failure is younger than this logs a
    /// warning: the cache is too small for the attack rate.
    pub cache_removal_warning_time: Duration,
}

impl Default for LockOutConfig {
    fn default() -> Self {
        Self {
            failure_count: DEFAULT_FAILURE_COUNT,
            lock_out_time: DEFAULT_LOCK_OUT_TIME,
            cache_size: DEFAULT_CACHE_SIZE,
            cache_removal_warning_time: DEFAULT_CACHE_REMOVAL_WARNING_TIME,
        }
    }
}

#[derive(Debug, Default)]
struct LockRecord {
    failures: AtomicU32,
    last_failure: AtomicU64,
}

impl LockRecord {
    fn failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    fn last_failure(&self) -> u64 {
        self.last_failure.load(Ordering::Relaxed)
    }

    fn register_failure(&self, now: u64) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        self.last_failure.store(now, Ordering::Relaxed);
    }

    fn reset(&self) {
        self.failures.store(0, Ordering::Relaxed);
    }
}

pub struct LockOutRealm {
    inner: Arc<dyn Realm>,
    config: LockOutConfig,
    failed_users: Mutex<LruCache<String, Arc<LockRecord>>>,
    clock: Arc<dyn Clock>,
}

impl LockOutRealm {
    pub fn new(inner: Arc<dyn Realm>, config: LockOutConfig) -> Self {
        Self::with_clock(inner, config, Arc::new(SystemClock))
    }

    pub fn with_clock(inner: Arc<dyn Realm>, config: LockOutConfig, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(config.cache_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            config,
            failed_users: Mutex::new(LruCache::new(capacity)),
            clock,
        }
    }

    pub fn inner(&self) -> &Arc<dyn Realm> {
        &self.inner
    }

    pub fn config(&self) -> &LockOutConfig {
        &self.config
    }

    pub fn is_locked(&self, username: &str) -> bool {
        let record = match self.failed_users.lock().get(username) {
            Some(r) => Arc::clone(r),
            None => return false,
        };
        record.failures() >= self.config.failure_count
            && self.elapsed_since(record.last_failure()) < self.config.lock_out_time
    }

    /// Clears any failure history for `username`.
    pub fn unlock(&self, username: &str) {
        self.failed_users.lock().pop(username);
    }

    /// Number of usernames with a failure record.
    pub fn cached_users(&self) -> usize {
        self.failed_users.lock().len()
    }

    fn elapsed_since(&self, millis: u64) -> Duration {
        Duration::from_millis(self.clock.now_millis().saturating_sub(millis))
    }

    fn register_auth_failure(&self, username: &str) {
        let now = self.clock.now_millis();
        let mut cache = self.failed_users.lock();
        let record = match cache.get(username) {
            Some(r) => {
                let r = Arc::clone(r);
                if r.failures() >= self.config.failure_count
                    && self.elapsed_since(r.last_failure()) > self.config.lock_out_time
                {
                    r.reset();
                }
                r
            }
            None => {
                let r = Arc::new(LockRecord::default());
                if let Some((evicted, old)) = cache.push(username.to_string(), Arc::clone(&r)) {
                    let age = self.elapsed_since(old.last_failure());
                    if evicted != username && age < self.config.cache_removal_warning_time {
                        warn!(
                            user = %evicted,
                            age_secs = age.as_secs(),
                            cache_size = self.config.cache_size,
                            "lock-out cache full, evicted a recent failure record"
                        );
                    }
                }
                r
            }
        };
        record.register_failure(now);
        debug!(user = %username, failures = record.failures(), "authentication failure registered");
    }

    fn filter(&self, username: &str, result: Option<Principal>) -> Option<Principal> {
        if result.is_none() && self.is_available() {
            self.register_auth_failure(username);
        }
        if self.is_locked(username) {
            warn!(user = %username, "authentication denied, user is locked out");
            return None;
        }
        if result.is_some() {
            self.unlock(username);
        }
        result
    }
}

#[async_trait]
impl Realm for LockOutRealm {
    fn name(&self) -> &str {
        "LockOutRealm"
    }

    async fn start(&self) -> Result<(), RealmError> {
        self.inner.start().await
    }

    async fn authenticate(&self, username: &str, credentials: &str) -> Option<Principal> {
        let result = self.inner.authenticate(username, credentials).await;
        self.filter(username, result)
    }

    /// Locked users are hidden; lookups never register failures.
    async fn principal(&self, username: &str) -> Option<Principal> {
        if self.is_locked(username) {
            return None;
        }
        self.inner.principal(username).await
    }

    fn is_available(&self) -> bool {
        self.inner.is_available()
    }

    fn credential_handler(&self) -> Arc<dyn CredentialHandler> {
        self.inner.credential_handler()
    }
}
