//! Signed capability tokens.
//!
//! A token is a bearer credential proving the kernel granted `cap` to
//! `app_id`. Encoding is three dot-separated URL-safe base64 segments
//! (header, payload, signature); the signature is HMAC-SHA256 over the raw
//! `header.payload` bytes with a key that lives only in process memory.
//!
//! The key is generated at startup, is not exportable, and rotates every
//! process lifetime: a restart invalidates every outstanding token, which is
//! the intended failure mode for a kernel that regenerates its apps anyway.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashSet;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use helion_guard::Capability;

type HmacSha256 = Hmac<Sha256>;

/// Constant token header: algorithm and token type.
const HEADER_JSON: &str = r#"{"alg":"HS256","typ":"LLMOS-CAP"}"#;

/// Default token lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(4 * 60 * 60);

/// The signed claims inside a token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenPayload {
    /// The app the capability was granted to.
    pub app_id: String,
    /// The granted capability.
    pub cap: Capability,
    /// Expiry as unix seconds.
    pub exp: u64,
    /// 128-bit random nonce, hex-encoded; the unit of revocation.
    pub nonce: String,
}

/// Why verification failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenError {
    /// Not three dot-separated base64 segments, or wrong header.
    Malformed,
    /// The HMAC did not match.
    InvalidSignature,
    /// Signature matched but the payload did not decode.
    InvalidPayload,
    /// `exp` is in the past.
    Expired,
    /// The nonce is in the revocation set.
    Revoked,
}

impl TokenError {
    /// Stable wire name for API bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenError::Malformed => "malformed",
            TokenError::InvalidSignature => "invalid_signature",
            TokenError::InvalidPayload => "invalid_payload",
            TokenError::Expired => "expired",
            TokenError::Revoked => "revoked",
        }
    }
}

/// The outcome of verifying a token.
#[derive(Debug, Clone)]
pub struct Verification {
    /// True iff the signature matched, the token is unexpired and unrevoked.
    pub valid: bool,
    /// The decoded payload, present when the signature matched.
    pub payload: Option<TokenPayload>,
    /// Populated when `valid` is false.
    pub error: Option<TokenError>,
}

impl Verification {
    fn fail(error: TokenError) -> Self {
        Self {
            valid: false,
            payload: None,
            error: Some(error),
        }
    }

    fn fail_with(error: TokenError, payload: TokenPayload) -> Self {
        Self {
            valid: false,
            payload: Some(payload),
            error: Some(error),
        }
    }
}

/// Process-scoped token signer/verifier with a revocation set.
pub struct TokenService {
    /// Signing key. Private, no accessor; dies with the process.
    key: [u8; 32],
    revoked: RwLock<HashSet<String>>,
    ttl: Duration,
}

impl TokenService {
    /// Generate a fresh signing key from the OS RNG.
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TTL)
    }

    /// Generate a fresh key with a non-default TTL (tests use short ones).
    pub fn with_ttl(ttl: Duration) -> Self {
        let mut key = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut key);
        Self {
            key,
            revoked: RwLock::new(HashSet::new()),
            ttl,
        }
    }

    /// Sign a capability for an app, returning the encoded token.
    pub fn issue(&self, app_id: &str, cap: Capability) -> String {
        let mut nonce = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let payload = TokenPayload {
            app_id: app_id.to_string(),
            cap,
            exp: now_unix() + self.ttl.as_secs(),
            nonce: hex::encode(nonce),
        };

        let header_b64 = URL_SAFE_NO_PAD.encode(HEADER_JSON);
        let payload_json = serde_json::to_string(&payload).expect("payload serializes");
        let payload_b64 = URL_SAFE_NO_PAD.encode(&payload_json);

        let signing_input = format!("{header_b64}.{payload_b64}");
        let sig = self.sign(signing_input.as_bytes());
        format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(sig))
    }

    /// Verify a token: structure, signature (constant-time), payload,
    /// expiry, revocation — in that order.
    pub fn verify(&self, token: &str) -> Verification {
        let mut parts = token.split('.');
        let (header_b64, payload_b64, sig_b64) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(h), Some(p), Some(s), None) if !h.is_empty() && !p.is_empty() => (h, p, s),
                _ => return Verification::fail(TokenError::Malformed),
            };

        let header = match URL_SAFE_NO_PAD.decode(header_b64) {
            Ok(h) => h,
            Err(_) => return Verification::fail(TokenError::Malformed),
        };
        if header != HEADER_JSON.as_bytes() {
            return Verification::fail(TokenError::Malformed);
        }

        let sig = match URL_SAFE_NO_PAD.decode(sig_b64) {
            Ok(s) => s,
            Err(_) => return Verification::fail(TokenError::Malformed),
        };

        // Constant-time comparison via Mac::verify_slice.
        let signing_input = format!("{header_b64}.{payload_b64}");
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts 32-byte keys");
        mac.update(signing_input.as_bytes());
        if mac.verify_slice(&sig).is_err() {
            return Verification::fail(TokenError::InvalidSignature);
        }

        let payload: TokenPayload = match URL_SAFE_NO_PAD
            .decode(payload_b64)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
        {
            Some(p) => p,
            None => return Verification::fail(TokenError::InvalidPayload),
        };

        if now_unix() > payload.exp {
            return Verification::fail_with(TokenError::Expired, payload);
        }
        if self.revoked.read().contains(&payload.nonce) {
            return Verification::fail_with(TokenError::Revoked, payload);
        }

        Verification {
            valid: true,
            payload: Some(payload),
            error: None,
        }
    }

    /// Revoke a single token.
    ///
    /// Best effort: a token that does not parse has nothing to revoke and is
    /// silently ignored (it could never verify anyway).
    pub fn revoke(&self, token: &str) {
        if let Some(nonce) = Self::nonce_of(token) {
            self.revoked.write().insert(nonce);
        }
    }

    /// Number of revoked nonces (diagnostics).
    pub fn revoked_count(&self) -> usize {
        self.revoked.read().len()
    }

    fn nonce_of(token: &str) -> Option<String> {
        let payload_b64 = token.split('.').nth(1)?;
        let bytes = URL_SAFE_NO_PAD.decode(payload_b64).ok()?;
        let payload: TokenPayload = serde_json::from_slice(&bytes).ok()?;
        Some(payload.nonce)
    }

    fn sign(&self, message: &[u8]) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("hmac accepts 32-byte keys");
        mac.update(message);
        mac.finalize().into_bytes().to_vec()
    }
}

impl Default for TokenService {
    fn default() -> Self {
        Self::new()
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_then_verify() {
        let svc = TokenService::new();
        let token = svc.issue("app-1", Capability::StorageLocal);
        let v = svc.verify(&token);
        assert!(v.valid, "error: {:?}", v.error);
        let payload = v.payload.unwrap();
        assert_eq!(payload.app_id, "app-1");
        assert_eq!(payload.cap, Capability::StorageLocal);
    }

    #[test]
    fn token_has_three_segments() {
        let svc = TokenService::new();
        let token = svc.issue("a", Capability::UiWindow);
        assert_eq!(token.split('.').count(), 3);
    }

    #[test]
    fn fabricated_signature_is_invalid_signature() {
        let svc = TokenService::new();
        let token = svc.issue("a", Capability::UiWindow);
        let mut parts: Vec<&str> = token.split('.').collect();
        let zeros = URL_SAFE_NO_PAD.encode([0u8; 32]);
        parts[2] = &zeros;
        let forged = parts.join(".");
        let v = svc.verify(&forged);
        assert!(!v.valid);
        assert_eq!(v.error, Some(TokenError::InvalidSignature));
    }

    #[test]
    fn any_single_bit_flip_invalidates() {
        let svc = TokenService::new();
        let token = svc.issue("a", Capability::UiWindow);
        // Flip one character in each segment in turn.
        for (i, _) in token.char_indices().step_by(7) {
            let mut bytes = token.clone().into_bytes();
            bytes[i] = if bytes[i] == b'A' { b'B' } else { b'A' };
            let Ok(mutated) = String::from_utf8(bytes) else {
                continue;
            };
            if mutated == token {
                continue;
            }
            let v = svc.verify(&mutated);
            assert!(
                !v.valid,
                "bit flip at {i} still verified: {mutated}"
            );
            assert!(matches!(
                v.error,
                Some(
                    TokenError::InvalidSignature
                        | TokenError::Malformed
                        | TokenError::InvalidPayload
                )
            ));
        }
    }

    #[test]
    fn wrong_structure_is_malformed() {
        let svc = TokenService::new();
        for junk in ["", "abc", "a.b", "a.b.c.d", "..."] {
            let v = svc.verify(junk);
            assert!(!v.valid);
            assert_eq!(v.error, Some(TokenError::Malformed), "input: {junk:?}");
        }
    }

    #[test]
    fn expired_token_reports_expired() {
        let svc = TokenService::with_ttl(Duration::ZERO);
        let token = svc.issue("a", Capability::UiWindow);
        std::thread::sleep(Duration::from_millis(1100));
        let v = svc.verify(&token);
        assert!(!v.valid);
        assert_eq!(v.error, Some(TokenError::Expired));
    }

    #[test]
    fn revoked_token_reports_revoked() {
        let svc = TokenService::new();
        let token = svc.issue("a", Capability::UiWindow);
        svc.revoke(&token);
        let v = svc.verify(&token);
        assert!(!v.valid);
        assert_eq!(v.error, Some(TokenError::Revoked));
    }

    #[test]
    fn revoking_garbage_is_a_noop() {
        let svc = TokenService::new();
        svc.revoke("not a token");
        assert_eq!(svc.revoked_count(), 0);
    }

    #[test]
    fn tokens_from_another_service_do_not_verify() {
        let a = TokenService::new();
        let b = TokenService::new();
        let token = a.issue("app", Capability::UiWindow);
        let v = b.verify(&token);
        assert!(!v.valid);
        assert_eq!(v.error, Some(TokenError::InvalidSignature));
    }
}
