use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::SignError;

/// Ed25519 seed. Wiped from memory when dropped; never serialized.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    seed: [u8; 32],
}

impl KeyMaterial {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self { seed }
    }

    pub fn from_hex(s: &str) -> Result<Self, SignError> {
        let mut bytes = hex::decode(s.trim()).map_err(|e| SignError::InvalidKey(e.to_string()))?;
        let res = <[u8; 32]>::try_from(bytes.as_slice())
            .map(Self::from_seed)
            .map_err(|_| SignError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())));
        bytes.zeroize();
        res
    }

    pub fn generate() -> Self {
        let key = SigningKey::generate(&mut OsRng);
        Self::from_seed(key.to_bytes())
    }

    pub(crate) fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.seed)
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key().verifying_key())
    }

    /// Hex seed, for handing a freshly generated key to a secret store.
    pub fn to_hex(&self) -> String {
        hex::encode(self.seed)
    }
}

/// Fresh key pair for `rpl keygen`: the seed goes to the secret store, the public key into config.
pub fn generate_keypair() -> (KeyMaterial, PublicKey) {
    let key = KeyMaterial::generate();
    let public = key.public_key();
    (key, public)
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("KeyMaterial(<redacted>)")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PublicKey(pub(crate) VerifyingKey);

impl PublicKey {
    pub fn from_hex(s: &str) -> Result<Self, SignError> {
        let bytes = hex::decode(s.trim()).map_err(|e| SignError::InvalidKey(e.to_string()))?;
        let arr = <[u8; 32]>::try_from(bytes.as_slice())
            .map_err(|_| SignError::InvalidKey(format!("expected 32 bytes, got {}", bytes.len())))?;
        VerifyingKey::from_bytes(&arr)
            .map(PublicKey)
            .map_err(|e| SignError::InvalidKey(e.to_string()))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    /// First 16 hex chars of sha256(public key).
    pub fn key_id(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.0.as_bytes());
        hex::encode(hasher.finalize())[..16].to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip_preserves_public_key() {
        let key = KeyMaterial::generate();
        let again = KeyMaterial::from_hex(&key.to_hex()).unwrap();
        assert_eq!(key.public_key(), again.public_key());
        let pk = PublicKey::from_hex(&key.public_key().to_hex()).unwrap();
        assert_eq!(pk.key_id().len(), 16);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(KeyMaterial::from_hex("abcd").is_err());
        assert!(PublicKey::from_hex("zz").is_err());
    }

    #[test]
    fn debug_does_not_leak_seed() {
        let key = KeyMaterial::from_seed([7u8; 32]);
        assert_eq!(format!("{key:?}"), "KeyMaterial(<redacted>)");
    }
}
