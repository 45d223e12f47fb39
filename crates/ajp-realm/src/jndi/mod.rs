// SPDX-License-Identifier: AGPL-3.0-only
//! Realm backed by an LDAP-style directory.
//!
//! Users are located either by formatting a DN from one or more patterns or
//! by searching under `user_base`. Credentials are checked by binding as the
//! user, or by comparing a password attribute through the credential handler
//! when `user_password` is set. Roles come from an attribute on the user entry
//! and/or a role search, optionally followed through nested groups.
//!
//! One connection is cached and reused; all directory work for one
//! authentication runs under a single lock. A broken connection is closed,
//! reopened and the operation retried once.

mod directory;
mod filter;

pub use directory::{
    Attributes, DirContext, DirContextFactory, SearchEntry, SearchRequest, SearchScope,
};
pub use filter::{escape_dn, escape_filter, format_pattern, parse_user_patterns};

use crate::credential::CredentialHandler;
use crate::error::{DirectoryError, RealmError};
use crate::principal::Principal;
use crate::realm::Realm;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct JndiConfig {
    pub connection_url: String,
    pub alternate_url: Option<String>,
    pub connection_name: Option<String>,
    pub connection_password: Option<String>,
    /// `dn-pattern` or `(pattern1)(pattern2)...`; `{0}` is the username.
    pub user_pattern: Option<String>,
    pub user_base: String,
    /// Filter with `{0}` for the username.
    pub user_search: Option<String>,
    pub user_subtree: bool,
    pub user_search_as_user: bool,
    /// Password attribute compared through the credential handler; binds when unset.
    pub user_password: Option<String>,
    pub user_role_name: Option<String>,
    pub role_base: String,
    /// Filter with `{0}` for the user DN and `{1}` for the username.
    pub role_search: Option<String>,
    /// Attribute on role entries holding the role name.
    pub role_name: Option<String>,
    pub role_subtree: bool,
    pub role_nested: bool,
    pub role_nested_max_depth: usize,
    pub common_role: Option<String>,
    pub size_limit: usize,
    pub time_limit: Duration,
}

impl Default for JndiConfig {
    fn default() -> Self {
        Self {
            connection_url: String::new(),
            alternate_url: None,
            connection_name: None,
            connection_password: None,
            user_pattern: None,
            user_base: String::new(),
            user_search: None,
            user_subtree: false,
            user_search_as_user: false,
            user_password: None,
            user_role_name: None,
            role_base: String::new(),
            role_search: None,
            role_name: None,
            role_subtree: false,
            role_nested: false,
            role_nested_max_depth: 16,
            common_role: None,
            size_limit: 0,
            time_limit: Duration::ZERO,
        }
    }
}

/// A located directory user.
#[derive(Debug, Clone, PartialEq, Eq)]
struct User {
    username: String,
    dn: String,
    password: Option<String>,
    roles: Vec<String>,
}

#[derive(Clone, Copy)]
enum Op<'a> {
    Authenticate {
        username: &'a str,
        credentials: &'a str,
    },
    Lookup {
        username: &'a str,
    },
}

pub struct JndiRealm {
    config: JndiConfig,
    user_patterns: Vec<String>,
    factory: Arc<dyn DirContextFactory>,
    handler: Arc<dyn CredentialHandler>,
    context: Mutex<Option<Box<dyn DirContext>>>,
    /// Whether a directory connection was open after the last operation.
    available: AtomicBool,
}

impl JndiRealm {
    pub fn new(
        config: JndiConfig,
        factory: Arc<dyn DirContextFactory>,
        handler: Arc<dyn CredentialHandler>,
    ) -> Self {
        let user_patterns = config
            .user_pattern
            .as_deref()
            .map(parse_user_patterns)
            .unwrap_or_default();
        Self {
            config,
            user_patterns,
            factory,
            handler,
            context: Mutex::new(None),
            available: AtomicBool::new(true),
        }
    }

    async fn open(&self) -> Result<Box<dyn DirContext>, DirectoryError> {
        let mut ctx = match self.factory.open(&self.config.connection_url).await {
            Ok(ctx) => ctx,
            Err(e) => {
                let Some(alternate) = self.config.alternate_url.as_deref() else {
                    return Err(e);
                };
                warn!(
                    url = %self.config.connection_url,
                    error = %e,
                    "directory connection failed, trying alternate URL"
                );
                self.factory.open(alternate).await?
            }
        };
        if let Err(e) = self.restore_identity(ctx.as_mut()).await {
            ctx.close().await;
            return Err(e);
        }
        Ok(ctx)
    }

    /// Puts the connection back on its configured identity.
    async fn restore_identity(&self, ctx: &mut dyn DirContext) -> Result<(), DirectoryError> {
        match (
            self.config.connection_name.as_deref(),
            self.config.connection_password.as_deref(),
        ) {
            (Some(name), password) => ctx.bind(name, password.unwrap_or_default()).await,
            (None, _) => ctx.unbind().await,
        }
    }

    async fn run(&self, op: Op<'_>) -> Option<Principal> {
        let mut guard = self.context.lock().await;
        let result = self.run_locked(&mut guard, op).await;
        self.available.store(guard.is_some(), Ordering::Relaxed);
        result
    }

    async fn run_locked(
        &self,
        guard: &mut Option<Box<dyn DirContext>>,
        op: Op<'_>,
    ) -> Option<Principal> {
        for attempt in 0..2 {
            if guard.is_none() {
                match self.open().await {
                    Ok(ctx) => *guard = Some(ctx),
                    Err(e) => {
                        error!(error = %e, "opening directory connection failed");
                        return None;
                    }
                }
            }
            let Some(ctx) = guard.as_mut() else {
                return None;
            };
            let result = match op {
                Op::Authenticate {
                    username,
                    credentials,
                } => self.authenticate_in(ctx.as_mut(), username, credentials).await,
                Op::Lookup { username } => self.lookup_in(ctx.as_mut(), username).await,
            };
            match result {
                Ok(principal) => return principal,
                Err(e) => {
                    if let Some(mut ctx) = guard.take() {
                        ctx.close().await;
                    }
                    if e.is_retryable() && attempt == 0 {
                        warn!(error = %e, "directory connection lost, retrying once");
                        continue;
                    }
                    error!(error = %e, "directory operation failed");
                    return None;
                }
            }
        }
        None
    }

    async fn authenticate_in(
        &self,
        ctx: &mut dyn DirContext,
        username: &str,
        credentials: &str,
    ) -> Result<Option<Principal>, DirectoryError> {
        let mut found = false;
        for user in self.find_users(ctx, username, Some(credentials)).await? {
            found = true;
            if !self.check_credentials(ctx, &user, credentials).await? {
                debug!(user = %username, dn = %user.dn, "directory credentials rejected");
                continue;
            }
            let roles = self.roles(ctx, &user).await?;
            debug!(user = %username, dn = %user.dn, roles = roles.len(), "directory user authenticated");
            return Ok(Some(Principal::new(username, roles)));
        }
        if !found {
            let _ = self.handler.mutate(credentials);
            debug!(user = %username, "directory user not found");
        }
        Ok(None)
    }

    async fn lookup_in(
        &self,
        ctx: &mut dyn DirContext,
        username: &str,
    ) -> Result<Option<Principal>, DirectoryError> {
        let Some(user) = self.find_users(ctx, username, None).await?.into_iter().next() else {
            return Ok(None);
        };
        let roles = self.roles(ctx, &user).await?;
        Ok(Some(Principal::new(username, roles)))
    }

    /// Candidate users: one per matching pattern, or at most one search hit.
    async fn find_users(
        &self,
        ctx: &mut dyn DirContext,
        username: &str,
        credentials: Option<&str>,
    ) -> Result<Vec<User>, DirectoryError> {
        if !self.user_patterns.is_empty() {
            let mut users = Vec::new();
            for pattern in &self.user_patterns {
                if let Some(user) = self.user_by_pattern(ctx, username, pattern).await? {
                    users.push(user);
                }
            }
            return Ok(users);
        }
        if self.config.user_search.is_some() {
            return Ok(self
                .user_by_search(ctx, username, credentials)
                .await?
                .into_iter()
                .collect());
        }
        Ok(Vec::new())
    }

    fn user_attribute_ids(&self) -> Vec<String> {
        self.config
            .user_password
            .iter()
            .chain(self.config.user_role_name.iter())
            .cloned()
            .collect()
    }

    fn user_from_attributes(&self, username: &str, dn: String, attrs: &Attributes) -> User {
        User {
            username: username.to_string(),
            dn,
            password: self
                .config
                .user_password
                .as_deref()
                .and_then(|a| attrs.first(a))
                .map(str::to_string),
            roles: self
                .config
                .user_role_name
                .as_deref()
                .map(|a| attrs.values(a).to_vec())
                .unwrap_or_default(),
        }
    }

    async fn user_by_pattern(
        &self,
        ctx: &mut dyn DirContext,
        username: &str,
        pattern: &str,
    ) -> Result<Option<User>, DirectoryError> {
        let dn = format_pattern(pattern, &escape_dn(username), username);
        let ids = self.user_attribute_ids();
        if ids.is_empty() {
            // nothing to read; existence is settled by the bind
            return Ok(Some(User {
                username: username.to_string(),
                dn,
                password: None,
                roles: Vec::new(),
            }));
        }
        match ctx.lookup(&dn, &ids).await {
            Ok(Some(attrs)) => Ok(Some(self.user_from_attributes(username, dn, &attrs))),
            Ok(None) | Err(DirectoryError::NameNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn user_by_search(
        &self,
        ctx: &mut dyn DirContext,
        username: &str,
        credentials: Option<&str>,
    ) -> Result<Option<User>, DirectoryError> {
        let Some(search) = self.config.user_search.as_deref() else {
            return Ok(None);
        };
        let request = SearchRequest {
            base: self.config.user_base.clone(),
            filter: format_pattern(search, &escape_filter(username), ""),
            scope: if self.config.user_subtree {
                SearchScope::Subtree
            } else {
                SearchScope::OneLevel
            },
            attributes: self.user_attribute_ids(),
            size_limit: self.config.size_limit,
            time_limit: self.config.time_limit,
        };

        let as_user = self.config.user_search_as_user && credentials.is_some();
        if let (true, Some(credentials)) = (as_user, credentials) {
            match ctx.bind(username, credentials).await {
                Ok(()) => {}
                Err(DirectoryError::InvalidCredentials) => {
                    self.restore_identity(ctx).await?;
                    return Ok(None);
                }
                Err(e) => return Err(e),
            }
        }
        let result = ctx.search(&request).await;
        if as_user {
            self.restore_identity(ctx).await?;
        }
        let mut entries = result?;
        match entries.len() {
            0 => Ok(None),
            1 => {
                let entry = entries.remove(0);
                Ok(Some(self.user_from_attributes(username, entry.dn, &entry.attributes)))
            }
            n => {
                warn!(user = %username, matches = n, "user search returned more than one entry");
                Ok(None)
            }
        }
    }

    async fn check_credentials(
        &self,
        ctx: &mut dyn DirContext,
        user: &User,
        credentials: &str,
    ) -> Result<bool, DirectoryError> {
        if self.config.user_password.is_some() {
            return Ok(user
                .password
                .as_deref()
                .is_some_and(|stored| self.handler.matches(credentials, stored)));
        }
        let outcome = ctx.bind(&user.dn, credentials).await;
        self.restore_identity(ctx).await?;
        match outcome {
            Ok(()) => Ok(true),
            Err(DirectoryError::InvalidCredentials) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn role_request(&self, filter: String) -> Option<SearchRequest> {
        let role_name = self.config.role_name.clone()?;
        Some(SearchRequest {
            base: self.config.role_base.clone(),
            filter,
            scope: if self.config.role_subtree {
                SearchScope::Subtree
            } else {
                SearchScope::OneLevel
            },
            attributes: vec![role_name],
            size_limit: self.config.size_limit,
            time_limit: self.config.time_limit,
        })
    }

    /// Role names for `user`: attribute roles, the common role, searched
    /// roles and, when enabled, roles of the groups those roles belong to.
    async fn roles(&self, ctx: &mut dyn DirContext, user: &User) -> Result<Vec<String>, DirectoryError> {
        let mut roles: BTreeSet<String> = user.roles.iter().cloned().collect();
        if let Some(common) = &self.config.common_role {
            roles.insert(common.clone());
        }
        let (Some(search), Some(role_name)) = (
            self.config.role_search.as_deref(),
            self.config.role_name.as_deref(),
        ) else {
            return Ok(roles.into_iter().collect());
        };

        let filter = format_pattern(search, &escape_filter(&user.dn), &escape_filter(&user.username));
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        if let Some(request) = self.role_request(filter) {
            for entry in ctx.search(&request).await? {
                let names = entry.attributes.values(role_name).to_vec();
                groups.insert(entry.dn, names);
            }
        }

        if self.config.role_nested {
            let mut visited: BTreeSet<String> = groups.keys().cloned().collect();
            let mut frontier: BTreeMap<String, Vec<String>> = groups.clone();
            let mut depth = 0;
            while !frontier.is_empty() {
                if depth >= self.config.role_nested_max_depth {
                    warn!(
                        user = %user.username,
                        depth,
                        "nested role search stopped at the depth limit"
                    );
                    break;
                }
                depth += 1;
                let mut next = BTreeMap::new();
                for (group_dn, names) in &frontier {
                    let name = names.first().map(String::as_str).unwrap_or_default();
                    let filter =
                        format_pattern(search, &escape_filter(group_dn), &escape_filter(name));
                    let Some(request) = self.role_request(filter) else {
                        continue;
                    };
                    for entry in ctx.search(&request).await? {
                        if visited.insert(entry.dn.clone()) {
                            let names = entry.attributes.values(role_name).to_vec();
                            next.insert(entry.dn, names);
                        }
                    }
                }
                groups.extend(next.iter().map(|(k, v)| (k.clone(), v.clone())));
                frontier = next;
            }
        }

        roles.extend(groups.into_values().flatten());
        Ok(roles.into_iter().collect())
    }

    /// Closes the cached connection, if any.
    pub async fn close(&self) {
        let mut guard = self.context.lock().await;
        if let Some(mut ctx) = guard.take() {
            ctx.close().await;
        }
        self.available.store(false, Ordering::Relaxed);
    }
}

#[async_trait]
impl Realm for JndiRealm {
    fn name(&self) -> &str {
        "JNDIRealm"
    }

    async fn start(&self) -> Result<(), RealmError> {
        let mut guard = self.context.lock().await;
        match self.open().await {
            Ok(ctx) => {
                *guard = Some(ctx);
                info!(url = %self.config.connection_url, "directory connection opened");
            }
            // the connection is retried on first use
            Err(e) => warn!(error = %e, "directory unavailable at start"),
        }
        self.available.store(guard.is_some(), Ordering::Relaxed);
        Ok(())
    }

    async fn authenticate(&self, username: &str, credentials: &str) -> Option<Principal> {
        if username.is_empty() || credentials.is_empty() {
            return None;
        }
        self.run(Op::Authenticate {
            username,
            credentials,
        })
        .await
    }

    async fn principal(&self, username: &str) -> Option<Principal> {
        if username.is_empty() {
            return None;
        }
        self.run(Op::Lookup { username }).await
    }

    /// `false` while no directory connection could be kept open.
    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    fn credential_handler(&self) -> Arc<dyn CredentialHandler> {
        Arc::clone(&self.handler)
    }
}
