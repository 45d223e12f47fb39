// SPDX-License-Identifier: AGPL-3.0-only
//! Realm backed by a users file held in memory.

use crate::credential::CredentialHandler;
use crate::principal::Principal;
use crate::realm::{CredentialStore, Realm, authenticate_with};
use crate::users::UsersDocument;
use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone)]
struct MemoryUser {
    password: String,
    roles: Vec<String>,
}

type UserTable = Arc<HashMap<String, MemoryUser>>;

fn build_table(doc: &UsersDocument) -> UserTable {
    Arc::new(
        doc.users
            .iter()
            .map(|u| {
                (
                    u.username.clone(),
                    MemoryUser {
                        password: u.password.clone(),
                        roles: u.roles.clone(),
                    },
                )
            })
            .collect(),
    )
}

pub struct MemoryRealm {
    path: Option<PathBuf>,
    users: RwLock<UserTable>,
    handler: Arc<dyn CredentialHandler>,
}

impl MemoryRealm {
    pub fn new(doc: &UsersDocument, handler: Arc<dyn CredentialHandler>) -> Self {
        Self {
            path: None,
            users: RwLock::new(build_table(doc)),
            handler,
        }
    }

    pub fn from_file(path: &Path, handler: Arc<dyn CredentialHandler>) -> Result<Self> {
        let doc = UsersDocument::load(path)?;
        let mut realm = Self::new(&doc, handler);
        realm.path = Some(path.to_path_buf());
        Ok(realm)
    }

    /// Re-reads the users file and swaps the table in one step. On error the
    /// previous table stays in place.
    pub fn reload(&self) -> Result<usize> {
        let path = self
            .path
            .as_deref()
            .context("memory realm was not loaded from a file")?;
        let doc = UsersDocument::load(path)?;
        let count = doc.users.len();
        self.replace(&doc);
        info!(path = %path.display(), users = count, "memory realm reloaded");
        Ok(count)
    }

    pub fn replace(&self, doc: &UsersDocument) {
        *self.users.write() = build_table(doc);
    }

    pub fn len(&self) -> usize {
        self.users.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn user(&self, username: &str) -> Option<MemoryUser> {
        let table: UserTable = self.users.read().clone();
        table.get(username).cloned()
    }
}

#[async_trait]
impl CredentialStore for MemoryRealm {
    async fn stored_credential(&self, username: &str) -> Option<String> {
        self.user(username).map(|u| u.password)
    }

    async fn lookup_principal(&self, username: &str) -> Option<Principal> {
        self.user(username).map(|u| Principal::new(username, u.roles))
    }
}

#[async_trait]
impl Realm for MemoryRealm {
    fn name(&self) -> &str {
        "MemoryRealm"
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{DigestAlgorithm, MessageDigestCredentialHandler};
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn sha256() -> Arc<dyn CredentialHandler> {
        Arc::new(MessageDigestCredentialHandler::new(Some(DigestAlgorithm::Sha256)))
    }

    const DOC: &str = r#"{"users":[{"username":"tomcat","password":"2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b","roles":["manager-gui"]}]}"#;

    #[tokio::test]
    async fn authenticates_against_digested_password() {
        let realm = MemoryRealm::new(&UsersDocument::from_json(DOC).unwrap(), sha256());
        let p = realm.authenticate("tomcat", "secret").await.unwrap();
        assert!(p.has_role("manager-gui"));
        assert!(realm.authenticate("tomcat", "wrong").await.is_none());
        assert!(realm.authenticate("nobody", "secret").await.is_none());
        assert!(realm.principal("tomcat").await.is_some());
    }

    #[tokio::test]
    async fn reload_swaps_users() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(DOC.as_bytes()).unwrap();
        let realm = MemoryRealm::from_file(file.path(), sha256()).unwrap();
        assert_eq!(realm.len(), 1);

        std::fs::write(
            file.path(),
            r#"{"users":[{"username":"a","password":"x"},{"username":"b","password":"y"}]}"#,
        )
        .unwrap();
        assert_eq!(realm.reload().unwrap(), 2);
        assert!(realm.principal("tomcat").await.is_none());
        assert!(realm.principal("a").await.is_some());

        std::fs::write(file.path(), "not json").unwrap();
        assert!(realm.reload().is_err());
        assert_eq!(realm.len(), 2);
    }

    #[test]
    fn reload_without_file_fails() {
        let realm = MemoryRealm::new(&UsersDocument::default(), sha256());
        assert!(realm.reload().is_err());
        assert!(realm.is_empty());
    }
}
