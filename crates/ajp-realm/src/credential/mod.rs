// SPDX-License-Identifier: AGPL-3.0-only
//! Credential handlers: verify an offered credential against its stored form
//! and derive new stored forms.
//!
//! Stored forms are self-describing. Verification reads salt and iteration
//! count from the stored string (`hexSalt$iterations$hexDigest`) instead of
//! the handler's own settings, so credentials generated under older settings
//! keep working.

mod digest;
mod nested;
mod secret_key;

pub use digest::{DigestAlgorithm, MessageDigestCredentialHandler};
pub use nested::NestedCredentialHandler;
pub use secret_key::{Pbkdf2Algorithm, SecretKeyCredentialHandler};

use openssl::memcmp;
use tracing::warn;

pub trait CredentialHandler: Send + Sync {
    /// Whether `input` is the credential that `stored` was generated from.
    /// Malformed stored forms never match.
    fn matches(&self, input: &str, stored: &str) -> bool;

    /// Generates a stored form for `input`; `None` when generation failed.
    fn mutate(&self, input: &str) -> Option<String>;
}

/// How input credentials are turned into bytes before digesting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CredentialEncoding {
    #[default]
    Utf8,
    Latin1,
}

impl CredentialEncoding {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "UTF-8" | "UTF8" => Some(Self::Utf8),
            "ISO-8859-1" | "ISO8859-1" | "LATIN1" => Some(Self::Latin1),
            _ => None,
        }
    }

    pub fn encode(&self, input: &str) -> Vec<u8> {
        match self {
            Self::Utf8 => input.as_bytes().to_vec(),
            Self::Latin1 => input
                .chars()
                .map(|c| if (c as u32) <= 0xFF { c as u8 } else { b'?' })
                .collect(),
        }
    }
}

/// Fixed-time comparison; unequal lengths fail early.
pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && memcmp::eq(a, b)
}

pub(crate) fn random_salt(len: usize) -> Option<Vec<u8>> {
    let mut salt = vec![0u8; len];
    if len > 0 {
        openssl::rand::rand_bytes(&mut salt).ok()?;
    }
    Some(salt)
}

/// Parts of a `hexSalt$iterations$hexDigest` stored credential.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct SaltedCredential {
    pub salt: Vec<u8>,
    pub iterations: u32,
    pub digest: Vec<u8>,
}

pub(crate) fn parse_salted(stored: &str) -> Option<SaltedCredential> {
    let (salt, rest) = stored.split_once('$')?;
    let (iterations, digest) = rest.split_once('$')?;
    let iterations: u32 = iterations.parse().ok()?;
    if iterations == 0 {
        return None;
    }
    Some(SaltedCredential {
        salt: hex::decode(salt).ok()?,
        iterations,
        digest: hex::decode(digest).ok()?,
    })
}

pub(crate) fn format_salted(salt: &[u8], iterations: u32, digest: &[u8]) -> String {
    format!("{}${}${}", hex::encode(salt), iterations, hex::encode(digest))
}

pub(crate) fn log_invalid(enabled: bool, handler: &str, reason: &str) {
    if enabled {
        warn!(handler, reason, "invalid stored credential");
    }
}

/// Runs every password through `handler` and formats `password:stored`.
pub fn digest_passwords<S: AsRef<str>>(
    handler: &dyn CredentialHandler,
    passwords: &[S],
) -> Vec<String> {
    passwords
        .iter()
        .map(|p| {
            let p = p.as_ref();
            match handler.mutate(p) {
                Some(stored) => format!("{p}:{stored}"),
                None => format!("{p}:<failed>"),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn salted_form_parses() {
        let parsed = parse_salted("0a0b$5$deadbeef").unwrap();
        assert_eq!(parsed.salt, vec![0x0a, 0x0b]);
        assert_eq!(parsed.iterations, 5);
        assert_eq!(parsed.digest, vec![0xde, 0xad, 0xbe, 0xef]);

        let empty_salt = parse_salted("$3$00ff").unwrap();
        assert!(empty_salt.salt.is_empty());
    }

    #[test]
    fn malformed_salted_forms_are_rejected() {
        assert_eq!(parse_salted("nodollar"), None);
        assert_eq!(parse_salted("aa$5"), None);
        assert_eq!(parse_salted("aa$x$00"), None);
        assert_eq!(parse_salted("aa$0$00"), None);
        assert_eq!(parse_salted("zz$5$00"), None);
        assert_eq!(parse_salted("aa$5$0"), None);
    }

    #[test]
    fn latin1_encoding() {
        assert_eq!(CredentialEncoding::Latin1.encode("caf\u{e9}"), vec![b'c', b'a', b'f', 0xE9]);
        assert_eq!(CredentialEncoding::Latin1.encode("\u{20ac}"), vec![b'?']);
        assert_eq!(CredentialEncoding::Utf8.encode("\u{e9}"), vec![0xC3, 0xA9]);
        assert_eq!(CredentialEncoding::parse("iso-8859-1"), Some(CredentialEncoding::Latin1));
        assert_eq!(CredentialEncoding::parse("EBCDIC"), None);
    }

    #[test]
    fn constant_time_eq_handles_lengths() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[test]
    fn digest_tool_formats_pairs() {
        let handler = MessageDigestCredentialHandler::new(Some(DigestAlgorithm::Sha256))
            .with_salt_length(0)
            .with_iterations(1);
        let out = digest_passwords(&handler, &["secret"]);
        assert_eq!(
            out,
            vec![
                "secret:2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"
                    .to_string()
            ]
        );
    }
}
