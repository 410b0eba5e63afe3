use anyhow::{anyhow, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use zeroize::Zeroize;

/// Stream access token.
///
/// The token is zeroized on drop and never printed; `Debug` and log lines show a
/// short fingerprint instead.
#[derive(Clone)]
pub struct Credential {
    token: String,
    expired: bool,
}

impl Credential {
    pub fn new(token: &str, expired: bool) -> Result<Self> {
        validate_token(token)?;
        Ok(Self {
            token: token.to_string(),
            expired,
        })
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn is_expired(&self) -> bool {
        self.expired
    }

    pub fn mark_expired(&mut self) {
        self.expired = true;
    }

    /// Replace the token and clear the expired flag.
    pub fn refresh(&mut self, token: &str) -> Result<()> {
        validate_token(token)?;
        self.token.zeroize();
        self.token = token.to_string();
        self.expired = false;
        Ok(())
    }

    /// First 8 hex chars of SHA-256(token), safe for logs.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.token.as_bytes());
        hex::encode(&digest[..4])
    }
}

impl Drop for Credential {
    fn drop(&mut self) {
        self.token.zeroize();
    }
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("fingerprint", &self.fingerprint())
            .field("expired", &self.expired)
            .finish()
    }
}

fn token_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9._~-]+$").expect("static token regex"))
}

/// Tokens are substituted into URLs, so only unreserved URL characters are allowed.
pub fn validate_token(token: &str) -> Result<()> {
    if token.is_empty() {
        return Err(anyhow!("credential token must not be empty"));
    }
    if !token_pattern().is_match(token) {
        return Err(anyhow!(
            "credential token contains characters outside [A-Za-z0-9._~-]"
        ));
    }
    Ok(())
}
