//! HMAC-SHA256 signing keys
//!
//! The ledger holds two independent keys: one seals individual events, the
//! other seals checkpoints and export headers. Compromising one does not let
//! an attacker forge the other.

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::config::KeyConfig;
use crate::error::{LedgerError, LedgerResult};

type HmacSha256 = Hmac<Sha256>;

/// A keyed HMAC-SHA256 instance. Cloning shares no mutable state.
#[derive(Clone)]
pub struct SigningKey {
    mac: HmacSha256,
}

impl SigningKey {
    pub fn new(secret: impl AsRef<[u8]>) -> LedgerResult<Self> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(LedgerError::Crypto("signing key must not be empty".to_string()));
        }

        let mac = HmacSha256::new_from_slice(secret)
            .map_err(|e| LedgerError::Crypto(format!("Invalid HMAC key: {}", e)))?;
        Ok(Self { mac })
    }

    /// Lowercase hex HMAC of `data`.
    pub fn sign(&self, data: &[u8]) -> String {
        let mut mac = self.mac.clone();
        mac.update(data);
        hex::encode(mac.finalize().into_bytes())
    }

    /// Constant-time comparison against a hex signature.
    pub fn verify(&self, data: &[u8], signature_hex: &str) -> bool {
        let Ok(expected) = hex::decode(signature_hex) else {
            return false;
        };

        let mut mac = self.mac.clone();
        mac.update(data);
        mac.verify_slice(&expected).is_ok()
    }
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SigningKey(<redacted>)")
    }
}

/// The event key and the checkpoint key, kept together for wiring.
#[derive(Debug, Clone)]
pub struct LedgerKeys {
    pub event: SigningKey,
    pub checkpoint: SigningKey,
}

impl LedgerKeys {
    pub fn new(event_secret: impl AsRef<[u8]>, checkpoint_secret: impl AsRef<[u8]>) -> LedgerResult<Self> {
        Ok(Self {
            event: SigningKey::new(event_secret)?,
            checkpoint: SigningKey::new(checkpoint_secret)?,
        })
    }

    pub fn from_config(config: &KeyConfig) -> LedgerResult<Self> {
        Self::new(config.event_key.as_bytes(), config.checkpoint_key.as_bytes())
    }
}

/// Plain SHA-256 of `data`, lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_is_deterministic() {
        let key = SigningKey::new(b"0123456789abcdef0123456789abcdef").unwrap();
        let a = key.sign(b"payload");
        let b = key.sign(b"payload");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_verify_rejects_other_key() {
        let key = SigningKey::new(b"0123456789abcdef0123456789abcdef").unwrap();
        let other = SigningKey::new(b"fedcba9876543210fedcba9876543210").unwrap();
        let sig = key.sign(b"payload");

        assert!(key.verify(b"payload", &sig));
        assert!(!other.verify(b"payload", &sig));
        assert!(!key.verify(b"payload!", &sig));
        assert!(!key.verify(b"payload", "not-hex"));
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(SigningKey::new(b"").is_err());
    }

    #[test]
    fn test_known_hmac_vector() {
        // RFC 4231 test case 2
        let key = SigningKey::new(b"Jefe").unwrap();
        assert_eq!(
            key.sign(b"what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }
}
