// SPDX-License-Identifier: AGPL-3.0-only
//! Ordered composition of realms: the first realm that authenticates wins.

use crate::credential::CredentialHandler;
use crate::error::RealmError;
use crate::principal::Principal;
use crate::realm::Realm;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, error};

type RealmList = Arc<RwLock<Vec<Arc<dyn Realm>>>>;

/// Asks each child realm's own handler in turn.
struct CombinedCredentialHandler {
    realms: RealmList,
}

impl CombinedCredentialHandler {
    fn handlers(&self) -> Vec<Arc<dyn CredentialHandler>> {
        self.realms
            .read()
            .iter()
            .map(|r| r.credential_handler())
            .collect()
    }
}

impl CredentialHandler for CombinedCredentialHandler {
    fn matches(&self, input: &str, stored: &str) -> bool {
        self.handlers().iter().any(|h| h.matches(input, stored))
    }

    fn mutate(&self, input: &str) -> Option<String> {
        self.handlers().iter().find_map(|h| h.mutate(input))
    }
}

pub struct CombinedRealm {
    realms: RealmList,
    handler: Arc<dyn CredentialHandler>,
}

impl Default for CombinedRealm {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl CombinedRealm {
    pub fn new(realms: Vec<Arc<dyn Realm>>) -> Self {
        let realms: RealmList = Arc::new(RwLock::new(realms));
        let handler = Arc::new(CombinedCredentialHandler {
            realms: Arc::clone(&realms),
        });
        Self { realms, handler }
    }

    /// Replaces the handler that otherwise delegates to the children.
    pub fn with_credential_handler(mut self, handler: Arc<dyn CredentialHandler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn add_realm(&self, realm: Arc<dyn Realm>) {
        self.realms.write().push(realm);
    }

    pub fn realms(&self) -> Vec<Arc<dyn Realm>> {
        self.realms.read().clone()
    }
}

#[async_trait]
impl Realm for CombinedRealm {
    fn name(&self) -> &str {
        "CombinedRealm"
    }

    /// Children that fail to start are dropped; the rest keep their order.
    async fn start(&self) -> Result<(), RealmError> {
        let mut started = Vec::new();
        for realm in self.realms() {
            match realm.start().await {
                Ok(()) => started.push(realm),
                Err(e) => error!(realm = realm.name(), error = %e, "sub-realm failed to start, removing it"),
            }
        }
        *self.realms.write() = started;
        Ok(())
    }

    async fn authenticate(&self, username: &str, credentials: &str) -> Option<Principal> {
        for (index, realm) in self.realms().iter().enumerate() {
            debug!(user = %username, realm = realm.name(), index, "attempting authentication");
            if let Some(principal) = realm.authenticate(username, credentials).await {
                debug!(user = %username, realm = realm.name(), index, "authenticated");
                return Some(principal);
            }
            debug!(user = %username, realm = realm.name(), index, "authentication failed");
        }
        None
    }

    async fn principal(&self, username: &str) -> Option<Principal> {
        for realm in self.realms() {
            if let Some(principal) = realm.principal(username).await {
                return Some(principal);
            }
        }
        None
    }

    fn is_available(&self) -> bool {
        self.realms.read().iter().all(|r| r.is_available())
    }

    fn credential_handler(&self) -> Arc<dyn CredentialHandler> {
        Arc::clone(&self.handler)
    }
}
