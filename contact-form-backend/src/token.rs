//! Freshness tokens proving that a form was rendered between two seconds and fifteen minutes
//! before it was submitted.
//!
//! A token is `"<issued_at>:<base64(HMAC-SHA256(secret, issued_at))>"`, where `issued_at` is
//! the decimal Unix timestamp at which the form script was served. Validation is stateless, so
//! a captured token may be replayed until it expires.

use crate::settings::{ConfigError, MIN_TOKEN_SECRET_LEN};
use base64::{engine::general_purpose::STANDARD, Engine};
use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use std::{fmt::Display, str::FromStr};

type HmacSha256 = Hmac<Sha256>;

/// Tokens younger than this were most likely filled in by a script.
pub const MIN_TOKEN_AGE_SECS: i64 = 2;
pub const MAX_TOKEN_AGE_SECS: i64 = 900;

const GENERATED_SECRET_LEN: usize = 32;

#[derive(Clone)]
pub struct TokenSecret(Vec<u8>);

impl TokenSecret {
    /// Uses the configured secret if there is one, otherwise generates a fresh one which lives
    /// as long as the process.
    pub fn resolve(configured: Option<&str>) -> Result<Self, ConfigError> {
        match configured {
            Some(secret) => Self::from_configured(secret),
            None => Ok(Self::generate()),
        }
    }

    pub fn from_configured(secret: &str) -> Result<Self, ConfigError> {
        if secret.len() < MIN_TOKEN_SECRET_LEN {
            return Err(ConfigError::TokenSecretTooShort);
        }
        Ok(Self(secret.as_bytes().to_vec()))
    }

    pub fn generate() -> Self {
        let mut secret = vec![0; GENERATED_SECRET_LEN];
        OsRng.fill_bytes(&mut secret);
        Self(secret)
    }

    pub fn issue(&self, now: i64) -> String {
        FreshnessToken {
            issued_at: now,
            mac: self.mac(now).finalize().into_bytes().to_vec(),
        }
        .to_string()
    }

    /// Fails closed: anything which does not parse is invalid.
    pub fn validate(&self, token: &str, now: i64) -> bool {
        let Ok(token) = token.parse::<FreshnessToken>() else {
            return false;
        };
        let Some(age) = now.checked_sub(token.issued_at) else {
            return false;
        };
        if !(MIN_TOKEN_AGE_SECS..=MAX_TOKEN_AGE_SECS).contains(&age) {
            return false;
        }
        self.mac(token.issued_at).verify_slice(&token.mac).is_ok()
    }

    fn mac(&self, issued_at: i64) -> HmacSha256 {
        let mut mac = HmacSha256::new_from_slice(&self.0).expect("HMAC accepts keys of any length");
        mac.update(issued_at.to_string().as_bytes());
        mac
    }
}

impl std::fmt::Debug for TokenSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "TokenSecret(<redacted>)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreshnessToken {
    pub issued_at: i64,
    pub mac: Vec<u8>,
}

impl Display for FreshnessToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.issued_at, STANDARD.encode(&self.mac))
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct MalformedToken;

impl Display for MalformedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Malformed freshness token")
    }
}

impl std::error::Error for MalformedToken {}

impl FromStr for FreshnessToken {
    type Err = MalformedToken;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (issued_at_text, mac_text) = s.split_once(':').ok_or(MalformedToken)?;
        let issued_at: i64 = issued_at_text.parse().map_err(|_| MalformedToken)?;
        // The MAC covers the canonical rendering, so "+17" or "017" must not stand in for "17".
        if issued_at.to_string() != issued_at_text {
            return Err(MalformedToken);
        }
        let mac = STANDARD.decode(mac_text).map_err(|_| MalformedToken)?;
        Ok(Self { issued_at, mac })
    }
}
