// SPDX-License-Identifier: AGPL-3.0-only
use crate::channel::ChannelConfig;
use ajp_proto::{DEFAULT_PACKET_SIZE, MAX_PACKET_SIZE};
use ajp_realm::{
    CredentialEncoding, CredentialHandler, DataSourceConfig, DigestAlgorithm, LockOutConfig,
    MessageDigestCredentialHandler, Pbkdf2Algorithm, SecretKeyCredentialHandler,
};
use anyhow::{Context, Result};
use clap::{ArgAction, Parser, ValueEnum};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// JSON structured logging for log aggregation (ELK, Loki).
    Json,
}

/// How stored credentials are verified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum HandlerKind {
    /// Message digest (optionally salted and iterated); cleartext without --algorithm.
    #[default]
    MessageDigest,
    /// PBKDF2 key derivation.
    SecretKey,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "ajp-server", version, about = "AJP13 connector with realm authentication")]
pub struct Args {
    /// Print `password:stored` for each password using the configured credential handler, then exit.
    #[arg(long, value_name = "PASSWORD", num_args = 1..)]
    pub digest: Vec<String>,

    /// Address the AJP channel binds to.
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub host: IpAddr,

    /// First AJP port to try (0 disables the channel).
    #[arg(long, default_value_t = 8009)]
    pub port: u16,

    /// Last AJP port to try when lower ones are taken (default: port + 10).
    #[arg(long)]
    pub max_port: Option<u16>,

    /// Maximum concurrent AJP connections.
    #[arg(long, default_value_t = 200)]
    pub max_connections: usize,

    /// Disable Nagle's algorithm on accepted sockets.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub tcp_no_delay: bool,

    /// Idle read timeout in milliseconds (0 = wait forever).
    #[arg(long, default_value_t = 0)]
    pub so_timeout_ms: u64,

    /// AJP packet size in bytes (8192..=65536); must match the web server's setting.
    #[arg(long, default_value_t = DEFAULT_PACKET_SIZE, value_parser = parse_packet_size)]
    pub packet_size: usize,

    /// Secret every forward request must carry.
    #[arg(long)]
    pub secret: Option<String>,

    /// Honour SHUTDOWN packets from the local host.
    #[arg(long, default_value_t = false)]
    pub shutdown_enabled: bool,

    /// Listen address for HTTP health checks and Prometheus metrics (e.g., 127.0.0.1:8080).
    #[arg(long)]
    pub listen_http: Option<SocketAddr>,

    /// Log output format: text or json.
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Log filter directive (RUST_LOG syntax), used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// JSON users file for the in-memory realm; reloaded on SIGHUP.
    #[arg(long)]
    pub users_file: Option<PathBuf>,

    /// Realm name announced in WWW-Authenticate challenges.
    #[arg(long, default_value = "AJP")]
    pub realm_name: String,

    /// Role every authenticated user must hold.
    #[arg(long)]
    pub required_role: Option<String>,

    /// Credential handler used to verify stored passwords.
    #[arg(long, value_enum, default_value_t = HandlerKind::MessageDigest)]
    pub credential_handler: HandlerKind,

    /// Digest (MD5, SHA-1, SHA-256, SHA-384, SHA-512) or PBKDF2 algorithm name.
    #[arg(long)]
    pub algorithm: Option<String>,

    /// Iterations used when generating new stored credentials.
    #[arg(long)]
    pub iterations: Option<u32>,

    /// Salt length in bytes used when generating new stored credentials.
    #[arg(long)]
    pub salt_length: Option<usize>,

    /// PBKDF2 derived key length in bits.
    #[arg(long)]
    pub key_length: Option<usize>,

    /// Character encoding applied to passwords before digesting.
    #[arg(long, default_value = "UTF-8")]
    pub encoding: String,

    /// Warn when a stored credential cannot be parsed.
    #[arg(long, default_value_t = false)]
    pub log_invalid_stored_credentials: bool,

    /// Disable the lock-out layer.
    #[arg(long, default_value_t = false)]
    pub disable_lockout: bool,

    /// Failed attempts before a user is locked out.
    #[arg(long, default_value_t = 5)]
    pub failure_count: u32,

    /// Lock-out duration in seconds.
    #[arg(long, default_value_t = 300)]
    pub lock_out_time_secs: u64,

    /// Maximum number of users tracked by the lock-out cache.
    #[arg(long, default_value_t = 1000)]
    pub lockout_cache_size: usize,

    /// Warn when a failure record younger than this many seconds is evicted.
    #[arg(long, default_value_t = 3600)]
    pub cache_removal_warning_secs: u64,

    /// PostgreSQL URL; enables the database realm.
    #[arg(long)]
    pub db_url: Option<String>,

    #[arg(long, default_value = "users")]
    pub user_table: String,

    #[arg(long, default_value = "user_name")]
    pub user_name_col: String,

    #[arg(long, default_value = "user_pass")]
    pub user_cred_col: String,

    /// Table mapping users to roles; omit for a realm without roles.
    #[arg(long)]
    pub user_role_table: Option<String>,

    #[arg(long, default_value = "role_name")]
    pub role_name_col: String,

    /// Comma separated user-table columns exposed as principal attributes, or `*`.
    #[arg(long)]
    pub user_attributes: Option<String>,
}

fn parse_packet_size(s: &str) -> std::result::Result<usize, String> {
    let size: usize = s.parse().map_err(|e| format!("invalid packet size: {e}"))?;
    if !(DEFAULT_PACKET_SIZE..=MAX_PACKET_SIZE).contains(&size) {
        return Err(format!(
            "packet size must be between {DEFAULT_PACKET_SIZE} and {MAX_PACKET_SIZE}"
        ));
    }
    Ok(size)
}

impl Args {
    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            host: self.host,
            port: self.port,
            max_port: self.max_port.unwrap_or(self.port.saturating_add(10)),
            max_connections: self.max_connections,
            tcp_no_delay: self.tcp_no_delay,
            so_timeout: (self.so_timeout_ms > 0).then(|| Duration::from_millis(self.so_timeout_ms)),
            packet_size: self.packet_size,
        }
    }

    pub fn lockout_config(&self) -> Option<LockOutConfig> {
        if self.disable_lockout {
            return None;
        }
        Some(LockOutConfig {
            failure_count: self.failure_count,
            lock_out_time: Duration::from_secs(self.lock_out_time_secs),
            cache_size: self.lockout_cache_size,
            cache_removal_warning_time: Duration::from_secs(self.cache_removal_warning_secs),
        })
    }

    /// Database realm settings, present when --db-url is given.
    pub fn datasource_config(&self) -> Option<(String, DataSourceConfig)> {
        let url = self.db_url.clone()?;
        Some((
            url,
            DataSourceConfig {
                user_table: self.user_table.clone(),
                user_name_col: self.user_name_col.clone(),
                user_cred_col: self.user_cred_col.clone(),
                user_role_table: self.user_role_table.clone(),
                role_name_col: self.role_name_col.clone(),
                user_attributes: self.user_attributes.clone(),
            },
        ))
    }

    pub fn credential_handler(&self) -> Result<Arc<dyn CredentialHandler>> {
        let encoding = CredentialEncoding::parse(&self.encoding)
            .with_context(|| format!("unsupported credential encoding {:?}", self.encoding))?;
        match self.credential_handler {
            HandlerKind::MessageDigest => {
                let algorithm = match self.algorithm.as_deref() {
                    Some(name) => Some(
                        DigestAlgorithm::parse(name)
                            .with_context(|| format!("unsupported digest algorithm {name:?}"))?,
                    ),
                    None => None,
                };
                let mut handler = MessageDigestCredentialHandler::new(algorithm)
                    .with_encoding(encoding)
                    .with_log_invalid_stored_credentials(self.log_invalid_stored_credentials);
                if let Some(iterations) = self.iterations {
                    handler = handler.with_iterations(iterations);
                }
                if let Some(salt_length) = self.salt_length {
                    handler = handler.with_salt_length(salt_length);
                }
                Ok(Arc::new(handler))
            }
            HandlerKind::SecretKey => {
                let algorithm = match self.algorithm.as_deref() {
                    Some(name) => Pbkdf2Algorithm::parse(name)
                        .with_context(|| format!("unsupported PBKDF2 algorithm {name:?}"))?,
                    None => Pbkdf2Algorithm::default(),
                };
                let mut handler = SecretKeyCredentialHandler::new(algorithm)
                    .with_encoding(encoding)
                    .with_log_invalid_stored_credentials(self.log_invalid_stored_credentials);
                if let Some(iterations) = self.iterations {
                    handler = handler.with_iterations(iterations);
                }
                if let Some(salt_length) = self.salt_length {
                    handler = handler.with_salt_length(salt_length);
                }
                if let Some(bits) = self.key_length {
                    handler = handler.with_key_length(bits);
                }
                Ok(Arc::new(handler))
            }
        }
    }
}
