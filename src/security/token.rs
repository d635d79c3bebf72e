// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bearer token validation.
//!
//! Tokens are issued elsewhere; this module only checks them. Two
//! validators ship with the crate:
//!
//! - [`StaticTokenValidator`]: opaque tokens looked up in a table.
//! - [`HmacTokenValidator`]: `base64url(claims).base64url(signature)` where
//!   the signature is HMAC-SHA256 over the encoded claims segment.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use crate::task::epoch_millis;

type HmacSha256 = Hmac<Sha256>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,
    #[error("token signature is invalid")]
    BadSignature,
    #[error("token has expired")]
    Expired,
    #[error("token is not recognized")]
    Unknown,
    /// Validator could not reach its backing state
    #[error("token validator unavailable: {0}")]
    Unavailable(String),
}

/// What a valid token grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Identity the token was issued to (a player id, or an operator name)
    pub sub: String,
    pub scopes: Vec<String>,
    /// Expiry, epoch millis
    pub exp: i64,
}

impl TokenClaims {
    pub fn new(sub: impl Into<String>, scopes: &[&str], exp: i64) -> Self {
        Self {
            sub: sub.into(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            exp,
        }
    }

    /// Exact match, or a `namespace:*` grant covering it.
    #[must_use]
    pub fn has_scope(&self, required: &str) -> bool {
        self.scopes.iter().any(|granted| {
            granted == required
                || granted
                    .strip_suffix('*')
                    .map(|prefix| prefix.ends_with(':') && required.starts_with(prefix))
                    .unwrap_or(false)
        })
    }

    #[must_use]
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.exp <= now_ms
    }
}

pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: &str) -> Result<TokenClaims, TokenError>;
}

/// In-memory token table.
#[derive(Default)]
pub struct StaticTokenValidator {
    tokens: DashMap<String, TokenClaims>,
}

impl StaticTokenValidator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, token: impl Into<String>, claims: TokenClaims) {
        self.tokens.insert(token.into(), claims);
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.tokens.remove(token).is_some()
    }
}

impl TokenValidator for StaticTokenValidator {
    fn validate(&self, token: &str) -> Result<TokenClaims, TokenError> {
        let claims = self.tokens.get(token).map(|c| c.clone()).ok_or(TokenError::Unknown)?;
        if claims.is_expired(epoch_millis()) {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }
}

/// Validates HMAC-SHA256 signed claim tokens against a shared key.
pub struct HmacTokenValidator {
    key: Vec<u8>,
}

impl HmacTokenValidator {
    pub fn new(key: impl AsRef<[u8]>) -> Self {
        Self {
            key: key.as_ref().to_vec(),
        }
    }

    fn mac(&self) -> Result<HmacSha256, TokenError> {
        HmacSha256::new_from_slice(&self.key).map_err(|e| TokenError::Unavailable(e.to_string()))
    }
}

impl TokenValidator for HmacTokenValidator {
    fn validate(&self, token: &str) -> Result<TokenClaims, TokenError> {
        let (claims_b64, sig_b64) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let signature = URL_SAFE_NO_PAD.decode(sig_b64).map_err(|_| TokenError::Malformed)?;

        let mut mac = self.mac()?;
        mac.update(claims_b64.as_bytes());
        mac.verify_slice(&signature).map_err(|_| TokenError::BadSignature)?;

        let claims_json = URL_SAFE_NO_PAD.decode(claims_b64).map_err(|_| TokenError::Malformed)?;
        let claims: TokenClaims = serde_json::from_slice(&claims_json).map_err(|_| TokenError::Malformed)?;
        if claims.is_expired(epoch_millis()) {
            return Err(TokenError::Expired);
        }
        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(key: &[u8], claims: &TokenClaims) -> String {
        let body = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
        let mut mac = HmacSha256::new_from_slice(key).unwrap();
        mac.update(body.as_bytes());
        let sig = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        format!("{}.{}", body, sig)
    }

    fn future() -> i64 {
        epoch_millis() + 60_000
    }

    #[test]
    fn test_scope_matching() {
        let claims = TokenClaims::new("p1", &["queue:read", "admin:*"], future());
        assert!(claims.has_scope("queue:read"));
        assert!(!claims.has_scope("queue:write"));
        assert!(claims.has_scope("admin:queues:write"));
        assert!(!claims.has_scope("adminx"));
    }

    #[test]
    fn test_static_validator() {
        let validator = StaticTokenValidator::new();
        validator.insert("good", TokenClaims::new("p1", &["queue:read"], future()));
        validator.insert("old", TokenClaims::new("p1", &["queue:read"], 1));

        assert_eq!(validator.validate("good").unwrap().sub, "p1");
        assert_eq!(validator.validate("old"), Err(TokenError::Expired));
        assert_eq!(validator.validate("nope"), Err(TokenError::Unknown));
        assert!(validator.revoke("good"));
        assert_eq!(validator.validate("good"), Err(TokenError::Unknown));
    }

    #[test]
    fn test_hmac_validator_accepts_signed_token() {
        let validator = HmacTokenValidator::new(b"secret");
        let claims = TokenClaims::new("p1", &["queue:write"], future());
        let token = sign(b"secret", &claims);
        assert_eq!(validator.validate(&token).unwrap(), claims);
    }

    #[test]
    fn test_hmac_validator_rejects_tampering() {
        let validator = HmacTokenValidator::new(b"secret");
        let token = sign(b"other-key", &TokenClaims::new("p1", &["queue:write"], future()));
        assert_eq!(validator.validate(&token), Err(TokenError::BadSignature));

        assert_eq!(validator.validate("no-dot"), Err(TokenError::Malformed));

        let expired = sign(b"secret", &TokenClaims::new("p1", &["queue:write"], 1));
        assert_eq!(validator.validate(&expired), Err(TokenError::Expired));
    }
}
