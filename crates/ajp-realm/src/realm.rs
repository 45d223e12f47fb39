// SPDX-License-Identifier: AGPL-3.0-only
//! The realm contract and the authentication algorithm shared by every
//! credential-store backed realm.

use crate::credential::CredentialHandler;
use crate::error::RealmError;
use crate::principal::Principal;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Resolves a username and credentials to an authenticated principal.
///
/// Authentication failures are never errors: every failure is `None`.
#[async_trait]
pub trait Realm: Send + Sync {
    /// Short name used in log lines.
    fn name(&self) -> &str;

    async fn start(&self) -> Result<(), RealmError> {
        Ok(())
    }

    async fn authenticate(&self, username: &str, credentials: &str) -> Option<Principal>;

    /// Principal lookup without credentials.
    async fn principal(&self, username: &str) -> Option<Principal>;

    /// `false` while the realm cannot authenticate anyone at all.
    fn is_available(&self) -> bool {
        true
    }

    fn credential_handler(&self) -> Arc<dyn CredentialHandler>;
}

/// Storage capability behind the shared authentication algorithm.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn stored_credential(&self, username: &str) -> Option<String>;

    async fn lookup_principal(&self, username: &str) -> Option<Principal>;
}

/// Empty username or credentials fail without a lookup. An unknown user still
/// pays for one `mutate` so response time does not reveal which usernames
/// exist.
pub async fn authenticate_with<S>(
    store: &S,
    handler: &dyn CredentialHandler,
    username: &str,
    credentials: &str,
) -> Option<Principal>
where
    S: CredentialStore + ?Sized,
{
    if username.is_empty() || credentials.is_empty() {
        debug!("empty username or credentials");
        return None;
    }
    let Some(stored) = store.stored_credential(username).await else {
        let _ = handler.mutate(credentials);
        debug!(user = %username, "unknown user");
        return None;
    };
    if !handler.matches(credentials, &stored) {
        debug!(user = %username, "credentials did not match");
        return None;
    }
    let principal = store.lookup_principal(username).await;
    if principal.is_none() {
        debug!(user = %username, "no principal after credential match");
    }
    principal
}
