// SPDX-License-Identifier: AGPL-3.0-only
//! Realm over SQL user and role tables.
//!
//! Every lookup opens its own connection from the [`DataSource`] and closes it
//! before returning. Statements are built from configured table and column
//! names when the realm is created; the optional user-attributes statement is
//! built on first use and cached.

use crate::credential::CredentialHandler;
use crate::principal::Principal;
use crate::realm::{CredentialStore, Realm, authenticate_with};
use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{error, warn};

/// Column name and text value, in select order.
pub type Row = Vec<(String, Option<String>)>;

#[async_trait]
pub trait DataSource: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DbConnection>>;
}

#[async_trait]
pub trait DbConnection: Send {
    /// Runs `sql` with `param` bound to `$1`.
    async fn query(&mut self, sql: &str, param: &str) -> Result<Vec<Row>>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// Selects every column except the credential column.
pub const ALL_ATTRIBUTES: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSourceConfig {
    pub user_table: String,
    pub user_name_col: String,
    pub user_cred_col: String,
    pub user_role_table: Option<String>,
    pub role_name_col: String,
    /// Comma separated columns copied into principal attributes, or `*`.
    pub user_attributes: Option<String>,
}

impl Default for DataSourceConfig {
    fn default() -> Self {
        Self {
            user_table: "users".into(),
            user_name_col: "user_name".into(),
            user_cred_col: "user_pass".into(),
            user_role_table: Some("user_roles".into()),
            role_name_col: "role_name".into(),
            user_attributes: None,
        }
    }
}

fn valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

pub struct DataSourceRealm {
    source: Arc<dyn DataSource>,
    handler: Arc<dyn CredentialHandler>,
    config: DataSourceConfig,
    credentials_sql: String,
    roles_sql: Option<String>,
    attributes_sql: OnceLock<Option<String>>,
    /// Whether the last connection attempt succeeded.
    available: AtomicBool,
}

impl DataSourceRealm {
    pub fn new(
        source: Arc<dyn DataSource>,
        handler: Arc<dyn CredentialHandler>,
        config: DataSourceConfig,
    ) -> Result<Self> {
        for name in [
            &config.user_table,
            &config.user_name_col,
            &config.user_cred_col,
            &config.role_name_col,
        ]
        .into_iter()
        .chain(config.user_role_table.as_ref())
        {
            if !valid_identifier(name) {
                bail!("invalid SQL identifier {name:?}");
            }
        }
        let credentials_sql = format!(
            "SELECT {} FROM {} WHERE {} = $1",
            config.user_cred_col, config.user_table, config.user_name_col
        );
        let roles_sql = config.user_role_table.as_ref().map(|table| {
            format!(
                "SELECT {} FROM {} WHERE {} = $1",
                config.role_name_col, table, config.user_name_col
            )
        });
        Ok(Self {
            source,
            handler,
            config,
            credentials_sql,
            roles_sql,
            attributes_sql: OnceLock::new(),
            available: AtomicBool::new(true),
        })
    }

    fn attributes_sql(&self) -> Option<&str> {
        self.attributes_sql
            .get_or_init(|| self.build_attributes_sql())
            .as_deref()
    }

    fn build_attributes_sql(&self) -> Option<String> {
        let wanted = self.config.user_attributes.as_deref()?.trim();
        let columns = if wanted == ALL_ATTRIBUTES {
            ALL_ATTRIBUTES.to_string()
        } else {
            let mut columns = Vec::new();
            for col in wanted.split(',').map(str::trim).filter(|c| !c.is_empty()) {
                if col.eq_ignore_ascii_case(&self.config.user_cred_col) {
                    warn!(column = col, "credential column cannot be a user attribute");
                    continue;
                }
                if !valid_identifier(col) {
                    warn!(column = col, "ignoring invalid user attribute column");
                    continue;
                }
                columns.push(col);
            }
            if columns.is_empty() {
                return None;
            }
            columns.join(", ")
        };
        Some(format!(
            "SELECT {} FROM {} WHERE {} = $1",
            columns, self.config.user_table, self.config.user_name_col
        ))
    }

    /// Opens a connection, runs one query, always closes the connection.
    async fn run(&self, sql: &str, username: &str) -> Result<Vec<Row>> {
        let connected = self.source.connect().await;
        self.available.store(connected.is_ok(), Ordering::Relaxed);
        let mut conn = connected?;
        let result = conn.query(sql, username).await;
        if let Err(e) = conn.close().await {
            warn!(error = %e, "closing database connection failed");
        }
        result
    }

    async fn roles(&self, username: &str) -> Result<Vec<String>> {
        let Some(sql) = self.roles_sql.as_deref() else {
            return Ok(Vec::new());
        };
        let rows = self.run(sql, username).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().and_then(|(_, v)| v))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect())
    }

    async fn attributes(&self, username: &str) -> Result<BTreeMap<String, String>> {
        let Some(sql) = self.attributes_sql() else {
            return Ok(BTreeMap::new());
        };
        let rows = self.run(sql, username).await?;
        let mut attributes = BTreeMap::new();
        if let Some(row) = rows.into_iter().next() {
            for (column, value) in row {
                if column.eq_ignore_ascii_case(&self.config.user_cred_col) {
                    continue;
                }
                if let Some(value) = value {
                    attributes.insert(column, value);
                }
            }
        }
        Ok(attributes)
    }
}

#[async_trait]
impl CredentialStore for DataSourceRealm {
    async fn stored_credential(&self, username: &str) -> Option<String> {
        match self.run(&self.credentials_sql, username).await {
            Ok(rows) => rows
                .into_iter()
                .next()
                .and_then(|row| row.into_iter().next())
                .and_then(|(_, v)| v)
                .map(|v| v.trim().to_string()),
            Err(e) => {
                error!(user = %username, error = %e, "credential lookup failed");
                None
            }
        }
    }

    async fn lookup_principal(&self, username: &str) -> Option<Principal> {
        let roles = match self.roles(username).await {
            Ok(roles) => roles,
            Err(e) => {
                error!(user = %username, error = %e, "role lookup failed");
                return None;
            }
        };
        let attributes = match self.attributes(username).await {
            Ok(attributes) => attributes,
            Err(e) => {
                error!(user = %username, error = %e, "user attribute lookup failed");
                return None;
            }
        };
        Some(Principal::new(username, roles).with_attributes(attributes))
    }
}

#[async_trait]
impl Realm for DataSourceRealm {
    fn name(&self) -> &str {
        "DataSourceRealm"
    }

    async fn authenticate(&self, username: &str, credentials: &str) -> Option<Principal> {
        authenticate_with(self, self.handler.as_ref(), username, credentials).await
    }

    async fn principal(&self, username: &str) -> Option<Principal> {
        self.stored_credential(username).await?;
        self.lookup_principal(username).await
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::Relaxed)
    }

    fn credential_handler(&self) -> Arc<dyn CredentialHandler> {
        Arc::clone(&self.handler)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeDb;
    use super::*;
    use crate::credential::MessageDigestCredentialHandler;
    use std::sync::atomic::Ordering;

    fn config() -> DataSourceConfig {
        DataSourceConfig {
            user_table: "users".into(),
            user_name_col: "name".into(),
            user_cred_col: "pass".into(),
            user_role_table: Some("user_roles".into()),
            role_name_col: "role".into(),
            user_attributes: None,
        }
    }

    fn realm(db: FakeDb, config: DataSourceConfig) -> (DataSourceRealm, Arc<FakeDb>) {
        let db = Arc::new(db);
        let realm = DataSourceRealm::new(
            db.clone(),
            Arc::new(MessageDigestCredentialHandler::default()),
            config,
        )
        .unwrap();
        (realm, db)
    }

    fn populated() -> FakeDb {
        let mut db = FakeDb::default();
        db.add_row("users", &[("name", "carol"), ("pass", " pw "), ("mail", "c@example.com")]);
        db.add_row("user_roles", &[("name", "carol"), ("role", "editor ")]);
        db.add_row("user_roles", &[("name", "carol"), ("role", "viewer")]);
        db
    }

    #[tokio::test]
    async fn unknown_user_with_empty_roles_table() {
        let mut db = FakeDb::default();
        db.tables.insert("users".into(), Vec::new());
        db.tables.insert("user_roles".into(), Vec::new());
        let (realm, db) = realm(db, config());
        assert!(realm.authenticate("nobody", "pw").await.is_none());
        assert_eq!(
            db.opened.load(Ordering::SeqCst),
            db.closed.load(Ordering::SeqCst)
        );
    }

    #[tokio::test]
    async fn trims_credentials_and_roles() {
        let (realm, db) = realm(populated(), config());
        let p = realm.authenticate("carol", "pw").await.unwrap();
        assert_eq!(p.roles(), &["editor".to_string(), "viewer".to_string()]);
        assert!(realm.authenticate("carol", " pw ").await.is_none());
        assert_eq!(
            db.opened.load(Ordering::SeqCst),
            db.closed.load(Ordering::SeqCst)
        );
        assert_eq!(
            db.statements.lock()[0],
            "SELECT pass FROM users WHERE name = $1"
        );
    }

    #[tokio::test]
    async fn no_role_table_means_no_roles() {
        let mut cfg = config();
        cfg.user_role_table = None;
        let (realm, _) = realm(populated(), cfg);
        let p = realm.authenticate("carol", "pw").await.unwrap();
        assert!(p.roles().is_empty());
    }

    #[tokio::test]
    async fn database_failure_is_a_failed_login() {
        let db = FakeDb {
            fail: true,
            ..Default::default()
        };
        let (realm, _) = realm(db, config());
        assert!(realm.authenticate("carol", "pw").await.is_none());
        assert!(realm.principal("carol").await.is_none());
    }

    #[tokio::test]
    async fn database_outage_does_not_lock_users_out() {
        use crate::lockout::{LockOutConfig, LockOutRealm};

        let (realm, db) = realm(populated(), config());
        let realm = Arc::new(realm);
        let lockout = LockOutRealm::new(
            realm.clone(),
            LockOutConfig {
                failure_count: 2,
                ..LockOutConfig::default()
            },
        );

        db.down.store(true, Ordering::SeqCst);
        for _ in 0..2 {
            assert!(lockout.authenticate("carol", "pw").await.is_none());
        }
        assert!(!realm.is_available());
        assert_eq!(lockout.cached_users(), 0);
        assert!(!lockout.is_locked("carol"));

        db.down.store(false, Ordering::SeqCst);
        assert!(lockout.authenticate("carol", "pw").await.is_some());
        assert!(realm.is_available());

        assert!(lockout.authenticate("carol", "wrong").await.is_none());
        assert_eq!(lockout.cached_users(), 1);
    }

    #[tokio::test]
    async fn attribute_statement_is_built_once() {
        let mut cfg = config();
        cfg.user_attributes = Some("mail, pass".into());
        let (realm, db) = realm(populated(), cfg);
        let p = realm.authenticate("carol", "pw").await.unwrap();
        assert_eq!(p.attribute("mail"), Some("c@example.com"));
        assert_eq!(p.attribute("pass"), None);
        realm.authenticate("carol", "pw").await.unwrap();

        let statements = db.statements.lock();
        let attribute_queries: Vec<&String> = statements
            .iter()
            .filter(|s| s.starts_with("SELECT mail"))
            .collect();
        assert_eq!(attribute_queries.len(), 2);
        assert_eq!(attribute_queries[0], "SELECT mail FROM users WHERE name = $1");
    }

    #[tokio::test]
    async fn star_selects_everything_but_the_credential() {
        let mut cfg = config();
        cfg.user_attributes = Some("*".into());
        let (realm, _) = realm(populated(), cfg);
        let p = realm.principal("carol").await.unwrap();
        assert_eq!(p.attribute("mail"), Some("c@example.com"));
        assert_eq!(p.attribute("name"), Some("carol"));
        assert_eq!(p.attribute("pass"), None);
    }

    #[test]
    fn rejects_unsafe_identifiers() {
        let mut cfg = config();
        cfg.user_table = "users; DROP TABLE users".into();
        let result = DataSourceRealm::new(
            Arc::new(FakeDb::default()),
            Arc::new(MessageDigestCredentialHandler::default()),
            cfg,
        );
        assert!(result.is_err());
    }
}
