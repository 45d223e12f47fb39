// SPDX-License-Identifier: AGPL-3.0-only
//! Realm delegating to a stack of pluggable login modules.
//!
//! The login configuration is a JSON file mapping application names to an
//! ordered module list; an application without its own entry uses `other`:
//!
//! ```json
//! { "Tomcat": [ { "module": "ldap", "flag": "requisite" }, { "module": "local", "flag": "sufficient" } ] }
//! ```
//!
//! Module names resolve against the modules injected at construction. The
//! configuration is read once, at start or on first use; if it cannot be read
//! or names an unknown module the realm reports itself unavailable.

use crate::credential::{CredentialHandler, MessageDigestCredentialHandler};
use crate::error::{LoginError, RealmError};
use crate::principal::{ExternalPrincipal, Principal};
use crate::realm::Realm;
use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error, warn};

/// Application entry used when the configured one is missing.
pub const DEFAULT_APP_NAME: &str = "other";

#[async_trait]
pub trait LoginModule: Send + Sync {
    /// Principals to attach to the subject on success.
    async fn login(&self, username: &str, credentials: &str)
    -> Result<Vec<ExternalPrincipal>, LoginError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlFlag {
    #[default]
    Required,
    Requisite,
    Sufficient,
    Optional,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModuleEntry {
    pub module: String,
    #[serde(default)]
    pub flag: ControlFlag,
}

type LoginConfiguration = HashMap<String, Vec<ModuleEntry>>;

struct ResolvedModule {
    name: String,
    flag: ControlFlag,
    module: Arc<dyn LoginModule>,
}

pub struct JaasRealm {
    app_name: String,
    config_path: PathBuf,
    modules: HashMap<String, Arc<dyn LoginModule>>,
    user_class_names: Vec<String>,
    role_class_names: Vec<String>,
    handler: Arc<dyn CredentialHandler>,
    stack: OnceCell<Option<Vec<ResolvedModule>>>,
}

impl JaasRealm {
    pub fn new(
        app_name: impl Into<String>,
        config_path: impl Into<PathBuf>,
        modules: HashMap<String, Arc<dyn LoginModule>>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            config_path: config_path.into(),
            modules,
            user_class_names: Vec::new(),
            role_class_names: Vec::new(),
            handler: Arc::new(MessageDigestCredentialHandler::default()),
            stack: OnceCell::new(),
        }
    }

    /// Comma separated class names of principals that identify the user.
    pub fn with_user_class_names(mut self, names: &str) -> Self {
        self.user_class_names = split_names(names);
        self
    }

    /// Comma separated class names of principals that carry role names.
    pub fn with_role_class_names(mut self, names: &str) -> Self {
        self.role_class_names = split_names(names);
        self
    }

    pub fn with_credential_handler(mut self, handler: Arc<dyn CredentialHandler>) -> Self {
        self.handler = handler;
        self
    }

    async fn stack(&self) -> Option<&[ResolvedModule]> {
        self.stack
            .get_or_init(|| async {
                match self.load_stack().await {
                    Ok(stack) => Some(stack),
                    Err(e) => {
                        error!(app = %self.app_name, error = %e, "login configuration unusable");
                        None
                    }
                }
            })
            .await
            .as_deref()
    }

    async fn load_stack(&self) -> Result<Vec<ResolvedModule>> {
        let raw = tokio::fs::read_to_string(&self.config_path)
            .await
            .with_context(|| {
                format!("reading login configuration {}", self.config_path.display())
            })?;
        let config: LoginConfiguration =
            serde_json::from_str(&raw).context("parsing login configuration")?;
        let entries = config
            .get(&self.app_name)
            .or_else(|| config.get(DEFAULT_APP_NAME))
            .ok_or_else(|| anyhow!("no login configuration for {}", self.app_name))?;
        entries
            .iter()
            .map(|entry| {
                let module = self
                    .modules
                    .get(&entry.module)
                    .cloned()
                    .ok_or_else(|| anyhow!("unknown login module {}", entry.module))?;
                Ok(ResolvedModule {
                    name: entry.module.clone(),
                    flag: entry.flag,
                    module,
                })
            })
            .collect()
    }

    /// Runs the module stack with the usual control-flag semantics.
    async fn login(
        &self,
        stack: &[ResolvedModule],
        username: &str,
        credentials: &str,
    ) -> Result<Vec<ExternalPrincipal>, LoginError> {
        let mut principals = Vec::new();
        let mut first_required_error: Option<LoginError> = None;
        let mut first_optional_error: Option<LoginError> = None;
        let mut any_success = false;
        let mut any_required = false;

        for entry in stack {
            let outcome = entry.module.login(username, credentials).await;
            if matches!(entry.flag, ControlFlag::Required | ControlFlag::Requisite) {
                any_required = true;
            }
            match (entry.flag, outcome) {
                (flag, Ok(found)) => {
                    debug!(module = %entry.name, "login module succeeded");
                    principals.extend(found);
                    any_success = true;
                    if flag == ControlFlag::Sufficient && first_required_error.is_none() {
                        return Ok(principals);
                    }
                }
                (ControlFlag::Required, Err(e)) => {
                    debug!(module = %entry.name, error = %e, "required login module failed");
                    first_required_error.get_or_insert(e);
                }
                (ControlFlag::Requisite, Err(e)) => {
                    debug!(module = %entry.name, error = %e, "requisite login module failed");
                    return Err(first_required_error.unwrap_or(e));
                }
                (_, Err(e)) => {
                    debug!(module = %entry.name, error = %e, "login module failed");
                    first_optional_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_required_error {
            return Err(e);
        }
        if !any_required && !any_success {
            return Err(first_optional_error.unwrap_or(LoginError::Failed));
        }
        Ok(principals)
    }

    fn create_principal(&self, username: &str, found: Vec<ExternalPrincipal>) -> Option<Principal> {
        let mut user_principal = None;
        let mut roles = Vec::new();
        for p in found {
            if user_principal.is_none() && self.user_class_names.contains(&p.class_name) {
                user_principal = Some(p.clone());
            }
            if self.role_class_names.contains(&p.class_name) {
                roles.push(p.name.clone());
            }
        }
        let Some(user_principal) = user_principal else {
            debug!(user = %username, "login succeeded but no user principal was found");
            return None;
        };
        Some(Principal::new(username, roles).with_user_principal(user_principal))
    }
}

fn split_names(names: &str) -> Vec<String> {
    names
        .split(',')
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(String::from)
        .collect()
}

#[async_trait]
impl Realm for JaasRealm {
    fn name(&self) -> &str {
        "JAASRealm"
    }

    async fn start(&self) -> Result<(), RealmError> {
        self.stack().await;
        Ok(())
    }

    async fn authenticate(&self, username: &str, credentials: &str) -> Option<Principal> {
        if username.is_empty() || credentials.is_empty() {
            return None;
        }
        let Some(stack) = self.stack().await else {
            warn!(app = %self.app_name, "JAAS realm unavailable");
            return None;
        };
        match self.login(stack, username, credentials).await {
            Ok(found) => self.create_principal(username, found),
            Err(LoginError::AccountExpired) => {
                debug!(user = %username, "account expired");
                None
            }
            Err(LoginError::CredentialExpired) => {
                debug!(user = %username, "credential expired");
                None
            }
            Err(LoginError::Failed) => {
                debug!(user = %username, "login failed");
                None
            }
            Err(e @ LoginError::Configuration(_)) => {
                error!(user = %username, error = %e, "login module misconfigured");
                None
            }
        }
    }

    async fn principal(&self, _username: &str) -> Option<Principal> {
        // no lookup without running the login modules
        None
    }

    /// Available until the configuration has been read and found unusable.
    fn is_available(&self) -> bool {
        self.stack.get().is_none_or(Option::is_some)
    }

    fn credential_handler(&self) -> Arc<dyn CredentialHandler> {
        Arc::clone(&self.handler)
    }
}
