// SPDX-License-Identifier: AGPL-3.0-only
//! JSON users document and the in-memory user database built from it.
//!
//! ```json
//! {
//!   "users":  [{ "username": "alice", "password": "...", "roles": ["admin"], "groups": ["ops"] }],
//!   "groups": [{ "name": "ops", "roles": ["operator"] }]
//! }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub groups: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub name: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsersDocument {
    #[serde(default)]
    pub users: Vec<UserEntry>,
    #[serde(default)]
    pub groups: Vec<GroupEntry>,
}

impl UsersDocument {
    pub fn from_json(raw: &str) -> Result<Self> {
        let doc: UsersDocument = serde_json::from_str(raw).context("parsing users document")?;
        let mut seen = BTreeSet::new();
        for user in &doc.users {
            anyhow::ensure!(!user.username.is_empty(), "user entry without a username");
            anyhow::ensure!(
                seen.insert(user.username.as_str()),
                "duplicate user {}",
                user.username
            );
        }
        Ok(doc)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading users file {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("loading users file {}", path.display()))
    }
}

/// A user as seen through a user database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseUser {
    pub username: String,
    pub password: String,
    /// Direct roles plus roles inherited from groups, sorted.
    pub roles: Vec<String>,
}

/// Read access to a user directory.
pub trait UserDatabase: Send + Sync {
    fn find_user(&self, username: &str) -> Option<DatabaseUser>;

    fn usernames(&self) -> Vec<String>;
}

/// User database held entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryUserDatabase {
    users: HashMap<String, DatabaseUser>,
}

impl MemoryUserDatabase {
    pub fn from_document(doc: &UsersDocument) -> Self {
        let group_roles: HashMap<&str, &[String]> = doc
            .groups
            .iter()
            .map(|g| (g.name.as_str(), g.roles.as_slice()))
            .collect();
        let users = doc
            .users
            .iter()
            .map(|u| {
                let mut roles: BTreeSet<String> = u.roles.iter().cloned().collect();
                for group in &u.groups {
                    if let Some(inherited) = group_roles.get(group.as_str()) {
                        roles.extend(inherited.iter().cloned());
                    }
                }
                (
                    u.username.clone(),
                    DatabaseUser {
                        username: u.username.clone(),
                        password: u.password.clone(),
                        roles: roles.into_iter().collect(),
                    },
                )
            })
            .collect();
        Self { users }
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self::from_document(&UsersDocument::load(path)?))
    }
}

impl UserDatabase for MemoryUserDatabase {
    fn find_user(&self, username: &str) -> Option<DatabaseUser> {
        self.users.get(username).cloned()
    }

    fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.users.keys().cloned().collect();
        names.sort();
        names
    }
}
