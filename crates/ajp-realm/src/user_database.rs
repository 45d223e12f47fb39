// SPDX-License-Identifier: AGPL-3.0-only
use crate::credential::CredentialHandler;
use crate::principal::Principal;
use crate::realm::{CredentialStore, Realm, authenticate_with};
use crate::users::UserDatabase;
use async_trait::async_trait;
use std::sync::Arc;

/// Realm over a shared [`UserDatabase`]; roles include those inherited
/// through group membership.
pub struct UserDatabaseRealm {
    database: Arc<dyn UserDatabase>,
    handler: Arc<dyn CredentialHandler>,
}

impl UserDatabaseRealm {
    pub fn new(database: Arc<dyn UserDatabase>, handler: Arc<dyn CredentialHandler>) -> Self {
        Self { database, handler }
    }
}

#[async_trait]
impl CredentialStore for UserDatabaseRealm {
    async fn stored_credential(&self, username: &str) -> Option<String> {
        self.database.find_user(username).map(|u| u.password)
    }

    async fn lookup_principal(&self, username: &str) -> Option<Principal> {
        self.database
            .find_user(username)
            .map(|u| Principal::new(u.username, u.roles))
    }
}

#[async_trait]
impl Realm for UserDatabaseRealm {
    fn name(&self) -> &str {
        "UserDatabaseRealm"
    }

    async fn authenticate(&self, username: &str, credentials: &str) -> Option<Principal> {
        authenticate_with(self, self.handler.as_ref(), username, credentials).await
    }

    async fn principal(&self, username: &str) -> Option<Principal> {
        self.lookup_principal(username).await
    }

    fn credential_handler(&self) -> Arc<dyn CredentialHandler> {
        Arc::clone(&self.handler)
    }
}
