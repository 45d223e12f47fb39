// SPDX-License-Identifier: AGPL-3.0-only
use super::{
    CredentialEncoding, CredentialHandler, constant_time_eq, format_salted, log_invalid,
    parse_salted, random_salt,
};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use openssl::hash::{Hasher, MessageDigest, hash};

const HANDLER: &str = "MessageDigestCredentialHandler";
/// SHA-1 output length inside `{SSHA}` values.
const SSHA_DIGEST_LEN: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DigestAlgorithm {
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "MD5" => Some(Self::Md5),
            "SHA" | "SHA1" | "SHA-1" => Some(Self::Sha1),
            "SHA256" | "SHA-256" => Some(Self::Sha256),
            "SHA384" | "SHA-384" => Some(Self::Sha384),
            "SHA512" | "SHA-512" => Some(Self::Sha512),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "MD5",
            Self::Sha1 => "SHA-1",
            Self::Sha256 => "SHA-256",
            Self::Sha384 => "SHA-384",
            Self::Sha512 => "SHA-512",
        }
    }

    fn message_digest(&self) -> MessageDigest {
        match self {
            Self::Md5 => MessageDigest::md5(),
            Self::Sha1 => MessageDigest::sha1(),
            Self::Sha256 => MessageDigest::sha256(),
            Self::Sha384 => MessageDigest::sha384(),
            Self::Sha512 => MessageDigest::sha512(),
        }
    }
}

/// Digests `parts` in order, then re-digests the result `iterations - 1` times.
fn iterated_digest(algorithm: DigestAlgorithm, iterations: u32, parts: &[&[u8]]) -> Option<Vec<u8>> {
    let md = algorithm.message_digest();
    let mut hasher = Hasher::new(md).ok()?;
    for part in parts {
        hasher.update(part).ok()?;
    }
    let mut out = hasher.finish().ok()?.to_vec();
    for _ in 1..iterations {
        out = hash(md, &out).ok()?.to_vec();
    }
    Some(out)
}

/// Message-digest based handler. Without an algorithm it stores and compares
/// cleartext.
#[derive(Debug, Clone)]
pub struct MessageDigestCredentialHandler {
    algorithm: Option<DigestAlgorithm>,
    encoding: CredentialEncoding,
    iterations: u32,
    salt_length: usize,
    log_invalid_stored_credentials: bool,
}

impl Default for MessageDigestCredentialHandler {
    fn default() -> Self {
        Self::new(None)
    }
}

impl MessageDigestCredentialHandler {
    pub fn new(algorithm: Option<DigestAlgorithm>) -> Self {
        Self {
            algorithm,
            encoding: CredentialEncoding::Utf8,
            iterations: 1,
            salt_length: 0,
            log_invalid_stored_credentials: false,
        }
    }

    pub fn with_encoding(mut self, encoding: CredentialEncoding) -> Self {
        self.encoding = encoding;
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

    pub fn algorithm(&self) -> Option<DigestAlgorithm> {
        self.algorithm
    }

    fn matches_base64(&self, algorithm: DigestAlgorithm, input: &[u8], encoded: &str) -> bool {
        let Ok(expected) = STANDARD.decode(encoded) else {
            log_invalid(self.log_invalid_stored_credentials, HANDLER, "bad base64");
            return false;
        };
        iterated_digest(algorithm, 1, &[input])
            .is_some_and(|actual| constant_time_eq(&actual, &expected))
    }

    fn matches_ssha(&self, input: &[u8], encoded: &str) -> bool {
        let decoded = match STANDARD.decode(encoded) {
            Ok(d) if d.len() >= SSHA_DIGEST_LEN => d,
            _ => {
                log_invalid(self.log_invalid_stored_credentials, HANDLER, "bad {SSHA} value");
                return false;
            }
        };
        let (expected, salt) = decoded.split_at(SSHA_DIGEST_LEN);
        iterated_digest(DigestAlgorithm::Sha1, 1, &[input, salt])
            .is_some_and(|actual| constant_time_eq(&actual, expected))
    }

    fn matches_salted(&self, algorithm: DigestAlgorithm, input: &[u8], stored: &str) -> bool {
        let Some(salted) = parse_salted(stored) else {
            log_invalid(
                self.log_invalid_stored_credentials,
                HANDLER,
                "expected salt$iterations$digest",
            );
            return false;
        };
        iterated_digest(algorithm, salted.iterations, &[salted.salt.as_slice(), input])
            .is_some_and(|actual| constant_time_eq(&actual, &salted.digest))
    }
}

impl CredentialHandler for MessageDigestCredentialHandler {
    fn matches(&self, input: &str, stored: &str) -> bool {
        let Some(algorithm) = self.algorithm else {
            return constant_time_eq(input.as_bytes(), stored.as_bytes());
        };
        let input = self.encoding.encode(input);
        if let Some(rest) = stored.strip_prefix("{MD5}") {
            return self.matches_base64(DigestAlgorithm::Md5, &input, rest);
        }
        if let Some(rest) = stored.strip_prefix("{SHA}") {
            return self.matches_base64(DigestAlgorithm::Sha1, &input, rest);
        }
        if let Some(rest) = stored.strip_prefix("{SSHA}") {
            return self.matches_ssha(&input, rest);
        }
        if stored.contains('$') {
            return self.matches_salted(algorithm, &input, stored);
        }
        match iterated_digest(algorithm, 1, &[input.as_slice()]) {
            Some(actual) => constant_time_eq(
                hex::encode(actual).as_bytes(),
                stored.to_ascii_lowercase().as_bytes(),
            ),
            None => false,
        }
    }

    fn mutate(&self, input: &str) -> Option<String> {
        let Some(algorithm) = self.algorithm else {
            return Some(input.to_string());
        };
        let salt = random_salt(self.salt_length)?;
        let input = self.encoding.encode(input);
        let digest = iterated_digest(algorithm, self.iterations, &[salt.as_slice(), input.as_slice()])?;
        if self.salt_length == 0 && self.iterations == 1 {
            Some(hex::encode(digest))
        } else {
            Some(format_salted(&salt, self.iterations, &digest))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha256() -> MessageDigestCredentialHandler {
        MessageDigestCredentialHandler::new(Some(DigestAlgorithm::Sha256))
    }

    const SECRET_SHA256: &str = "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b";

    #[test]
    fn stored_format_is_detected_without_configuration() {
        let handler = sha256();
        assert!(handler.matches("secret", SECRET_SHA256));
        assert!(handler.matches("secret", &SECRET_SHA256.to_ascii_uppercase()));
        assert!(handler.matches("secret", "{SHA}5en6G6MezRroT3XKqkdPOmY/BfQ="));
        assert!(handler.matches("secret", "{MD5}Xr4ilOzQ4PCOq3aQ0qbuaQ=="));
        assert!(handler.matches("secret", "{SSHA}gVK8WC9YyFT1gMsQHTGCgT3sSv5zYWx0"));
        assert!(handler.matches(
            "secret",
            "73616c74$5$ccfaa43beae7e8fe0876c138b6b4f786cfe75e02b869600c031595ae70dc287b"
        ));
    }

    #[test]
    fn wrong_password_fails_every_format() {
        let handler = sha256();
        assert!(!handler.matches("Secret", SECRET_SHA256));
        assert!(!handler.matches("Secret", "{SHA}5en6G6MezRroT3XKqkdPOmY/BfQ="));
        assert!(!handler.matches("Secret", "{SSHA}gVK8WC9YyFT1gMsQHTGCgT3sSv5zYWx0"));
        assert!(!handler.matches(
            "Secret",
            "73616c74$5$ccfaa43beae7e8fe0876c138b6b4f786cfe75e02b869600c031595ae70dc287b"
        ));
    }

    #[test]
    fn malformed_stored_credentials_do_not_match() {
        let handler = sha256().with_log_invalid_stored_credentials(true);
        assert!(!handler.matches("secret", "salt$5$deadbeef"));
        assert!(!handler.matches("secret", "00$five$deadbeef"));
        assert!(!handler.matches("secret", "00$5"));
        assert!(!handler.matches("secret", "{SHA}!!!"));
        assert!(!handler.matches("secret", "{SSHA}c2hvcnQ="));
        assert!(!handler.matches("secret", "not-hex"));
    }

    #[test]
    fn mutate_round_trips_with_salt_and_iterations() {
        let handler = sha256().with_salt_length(16).with_iterations(1000);
        let stored = handler.mutate("p@ss").unwrap();
        let parts: Vec<&str> = stored.split('$').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 32);
        assert_eq!(parts[1], "1000");
        assert!(handler.matches("p@ss", &stored));
        assert!(!handler.matches("p@sS", &stored));

        // fresh salt every time
        assert_ne!(handler.mutate("p@ss").unwrap(), stored);
    }

    #[test]
    fn plain_form_only_without_salt_and_single_iteration() {
        let plain = sha256().mutate("secret").unwrap();
        assert_eq!(plain, SECRET_SHA256);

        let iterated = sha256().with_iterations(3).mutate("secret").unwrap();
        assert!(iterated.starts_with("$3$"));
        assert!(sha256().matches("secret", &iterated));
    }

    #[test]
    fn verification_ignores_handler_defaults() {
        let stored = MessageDigestCredentialHandler::new(Some(DigestAlgorithm::Md5))
            .with_salt_length(4)
            .with_iterations(7)
            .mutate("secret")
            .unwrap();
        let other = MessageDigestCredentialHandler::new(Some(DigestAlgorithm::Md5));
        assert!(other.matches("secret", &stored));
        assert!(other.matches("secret", "0102$1$8d10925f4835f3213b3c07cf55c66081"));
    }

    #[test]
    fn cleartext_without_algorithm() {
        let handler = MessageDigestCredentialHandler::default();
        assert!(handler.matches("tomcat", "tomcat"));
        assert!(!handler.matches("tomcat", "Tomcat"));
        assert_eq!(handler.mutate("tomcat").as_deref(), Some("tomcat"));
    }

    #[test]
    fn different_passwords_do_not_collide() {
        let handler = sha256().with_salt_length(8);
        for (a, b) in [("a", "b"), ("password", "password1"), ("", " ")] {
            let stored = handler.mutate(b).unwrap();
            assert!(!handler.matches(a, &stored));
        }
    }

    #[test]
    fn algorithm_names() {
        assert_eq!(DigestAlgorithm::parse("sha-256"), Some(DigestAlgorithm::Sha256));
        assert_eq!(DigestAlgorithm::parse("SHA"), Some(DigestAlgorithm::Sha1));
        assert_eq!(DigestAlgorithm::parse("whirlpool"), None);
        assert_eq!(DigestAlgorithm::Sha512.name(), "SHA-512");
    }
}
