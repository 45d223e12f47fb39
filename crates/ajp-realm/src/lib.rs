// SPDX-License-Identifier: AGPL-3.0-only
//! Realm authentication for the AJP connector: credential handlers, user
//! stores (in-memory, database, directory, pluggable login modules) and the
//! combined and lock-out realms layered on top of them.

pub mod clock;
pub mod combined;
pub mod credential;
pub mod datasource;
pub mod error;
pub mod jaas;
pub mod jndi;
pub mod lockout;
pub mod memory;
pub mod pg;
pub mod principal;
pub mod realm;
pub mod user_database;
pub mod users;

pub use clock::{Clock, ManualClock, SystemClock};
pub use combined::CombinedRealm;
pub use credential::{
    CredentialEncoding, CredentialHandler, DigestAlgorithm, MessageDigestCredentialHandler,
    NestedCredentialHandler, Pbkdf2Algorithm, SecretKeyCredentialHandler, digest_passwords,
};
pub use datasource::{DataSource, DataSourceConfig, DataSourceRealm, DbConnection};
pub use error::{DirectoryError, LoginError, RealmError};
pub use jaas::{ControlFlag, JaasRealm, LoginModule, ModuleEntry};
pub use jndi::{DirContext, DirContextFactory, JndiConfig, JndiRealm};
pub use lockout::{LockOutConfig, LockOutRealm};
pub use memory::MemoryRealm;
pub use pg::PgDataSource;
pub use principal::{ANY_ROLE, ExternalPrincipal, Principal};
pub use realm::{CredentialStore, Realm, authenticate_with};
pub use user_database::UserDatabaseRealm;
pub use users::{MemoryUserDatabase, UserDatabase, UsersDocument};
