// SPDX-License-Identifier: AGPL-3.0-only
use super::{
    CredentialEncoding, CredentialHandler, constant_time_eq, format_salted, log_invalid,
    parse_salted, random_salt,
};
use openssl::hash::MessageDigest;
use openssl::pkcs5::pbkdf2_hmac;

const HANDLER: &str = "SecretKeyCredentialHandler";

pub const DEFAULT_KEY_LENGTH_BITS: usize = 160;
pub const DEFAULT_ITERATIONS: u32 = 20_000;
pub const DEFAULT_SALT_LENGTH: usize = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Pbkdf2Algorithm {
    #[default]
    HmacSha1,
    HmacSha256,
    HmacSha384,
    HmacSha512,
}

impl Pbkdf2Algorithm {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "PBKDF2WithHmacSHA1" => Some(Self::HmacSha1),
            "PBKDF2WithHmacSHA256" => Some(Self::HmacSha256),
            "PBKDF2WithHmacSHA384" => Some(Self::HmacSha384),
            "PBKDF2WithHmacSHA512" => Some(Self::HmacSha512),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::HmacSha1 => "PBKDF2WithHmacSHA1",
            Self::HmacSha256 => "PBKDF2WithHmacSHA256",
            Self::HmacSha384 => "PBKDF2WithHmacSHA384",
            Self::HmacSha512 => "PBKDF2WithHmacSHA512",
        }
    }

    fn message_digest(&self) -> MessageDigest {
        match self {
            Self::HmacSha1 => MessageDigest::sha1(),
            Self::HmacSha256 => MessageDigest::sha256(),
            Self::HmacSha384 => MessageDigest::sha384(),
            Self::HmacSha512 => MessageDigest::sha512(),
        }
    }
}

/// PBKDF2 key-derivation handler. Only the `salt$iterations$key` form is
/// understood.
#[derive(Debug, Clone)]
pub struct SecretKeyCredentialHandler {
    algorithm: Pbkdf2Algorithm,
    encoding: CredentialEncoding,
    key_length_bits: usize,
    iterations: u32,
    salt_length: usize,
    log_invalid_stored_credentials: bool,
}

impl Default for SecretKeyCredentialHandler {
    fn default() -> Self {
        Self::new(Pbkdf2Algorithm::default())
    }
}

impl SecretKeyCredentialHandler {
    pub fn new(algorithm: Pbkdf2Algorithm) -> Self {
        Self {
            algorithm,
            encoding: CredentialEncoding::Utf8,
            key_length_bits: DEFAULT_KEY_LENGTH_BITS,
            iterations: DEFAULT_ITERATIONS,
            salt_length: DEFAULT_SALT_LENGTH,
            log_invalid_stored_credentials: false,
        }
    }

    pub fn with_encoding(mut self, encoding: CredentialEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_key_length(mut self, bits: usize) -> Self {
        self.key_length_bits = bits.max(8);
        self
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = iterations.max(1);
        self
    }

    pub fn with_salt_length(mut self, salt_length: usize) -> Self {
        self.salt_length = salt_length;
        self
    }

    pub fn with_log_invalid_stored_credentials(mut self, enabled: bool) -> Self {
        self.log_invalid_stored_credentials = enabled;
        self
    }

    fn derive(&self, input: &str, salt: &[u8], iterations: u32, key_len: usize) -> Option<Vec<u8>> {
        let password = self.encoding.encode(input);
        let mut key = vec![0u8; key_len];
        pbkdf2_hmac(
            &password,
            salt,
            iterations as usize,
            self.algorithm.message_digest(),
            &mut key,
        )
        .ok()?;
        Some(key)
    }
}

impl CredentialHandler for SecretKeyCredentialHandler {
    fn matches(&self, input: &str, stored: &str) -> bool {
        let Some(salted) = parse_salted(stored) else {
            log_invalid(
                self.log_invalid_stored_credentials,
                HANDLER,
                "expected salt$iterations$key",
            );
            return false;
        };
        if salted.digest.is_empty() {
            return false;
        }
        // key length follows the stored value, not the handler setting
        self.derive(input, &salted.salt, salted.iterations, salted.digest.len())
            .is_some_and(|actual| constant_time_eq(&actual, &salted.digest))
    }

    fn mutate(&self, input: &str) -> Option<String> {
        let salt = random_salt(self.salt_length)?;
        let key = self.derive(input, &salt, self.iterations, self.key_length_bits / 8)?;
        Some(format_salted(&salt, self.iterations, &key))
    }
}
