//! Webhook Signature Verification
//!
//! The platform signs every webhook call with
//! `sha1(sorted(token_secret, timestamp, nonce).concat())` in lowercase hex.

use chrono::Utc;
use sha1::{Digest, Sha1};

/// Signature inputs taken from a webhook query string
#[derive(Debug, Clone, Copy)]
pub struct SignatureParams<'a> {
    pub signature: &'a str,
    pub timestamp: &'a str,
    pub nonce: &'a str,
}

/// Checks webhook signatures for one service
#[derive(Clone)]
pub struct SignatureVerifier {
    token_secret: String,
    /// Maximum allowed clock distance of `timestamp`, in seconds; 0 disables the check
    window_secs: u64,
}

impl SignatureVerifier {
    pub fn new(token_secret: impl Into<String>, window_secs: u64) -> Self {
        Self {
            token_secret: token_secret.into(),
            window_secs,
        }
    }

    /// Signature the platform would send for `timestamp` and `nonce`
    pub fn sign(&self, timestamp: &str, nonce: &str) -> String {
        compute_signature(&[&self.token_secret, timestamp, nonce])
    }

    pub fn verify(&self, params: &SignatureParams<'_>) -> bool {
        self.verify_at(params, Utc::now().timestamp())
    }

    /// Verify against an explicit clock, `now` in unix seconds
    pub fn verify_at(&self, params: &SignatureParams<'_>, now: i64) -> bool {
        if params.signature.is_empty() || params.timestamp.is_empty() || params.nonce.is_empty() {
            return false;
        }

        if self.window_secs > 0 {
            let Ok(timestamp) = params.timestamp.parse::<i64>() else {
                return false;
            };
            if now.abs_diff(timestamp) > self.window_secs {
                tracing::debug!(timestamp, now, "Webhook timestamp outside window");
                return false;
            }
        }

        self.sign(params.timestamp, params.nonce) == params.signature
    }
}

/// Sort `parts`, concatenate them and return the sha1 digest as lowercase hex
pub fn compute_signature(parts: &[&str]) -> String {
    let mut sorted = parts.to_vec();
    sorted.sort_unstable();

    let mut hasher = Sha1::new();
    for part in sorted {
        hasher.update(part.as_bytes());
    }
    hex::encode(hasher.finalize())
}
