use std::sync::Arc;

use async_trait::async_trait;
use ed25519_dalek::Signer as _;
use rpl_core::{Image, Signature};
use rpl_registry::Registry;
use tracing::info;

use crate::{PublicKey, SecretStore, SignError};

/// Domain prefix so an image signature can never be replayed as another kind of signature.
const PAYLOAD_PREFIX: &str = "rpl-image-signature-v1\n";

fn payload(digest: &str) -> Vec<u8> {
    format!("{PAYLOAD_PREFIX}{digest}").into_bytes()
}

#[async_trait]
pub trait Signer: Send + Sync {
    async fn sign(&self, image: &Image) -> Result<Signature, SignError>;
}

/// Signs pushed digests. The key is fetched per call and dropped (zeroized) before returning.
pub struct SigningService {
    secrets: Arc<dyn SecretStore>,
    registry: Arc<dyn Registry>,
}

impl SigningService {
    pub fn new(secrets: Arc<dyn SecretStore>, registry: Arc<dyn Registry>) -> Self {
        Self { secrets, registry }
    }
}

#[async_trait]
impl Signer for SigningService {
    async fn sign(&self, image: &Image) -> Result<Signature, SignError> {
        if !self.registry.contains(&image.repository, &image.digest).await? {
            return Err(SignError::NotPushed {
                repository: image.repository.clone(),
                digest: image.digest.clone(),
            });
        }

        let key = self.secrets.signing_key().await?;
        let signer_key_id = key.public_key().key_id();
        let sig = key.signing_key().sign(&payload(&image.digest));
        drop(key);

        info!(digest = %image.digest, key_id = %signer_key_id, "image signed");
        Ok(Signature {
            image_digest: image.digest.clone(),
            signer_key_id,
            signature_bytes: sig.to_bytes().to_vec(),
        })
    }
}

/// True iff `sig` was produced by `key` over exactly `digest`.
pub fn verify(digest: &str, sig: &Signature, key: &PublicKey) -> bool {
    if sig.image_digest != digest || sig.signer_key_id != key.key_id() {
        return false;
    }
    let Ok(raw) = ed25519_dalek::Signature::from_slice(&sig.signature_bytes) else {
        return false;
    };
    key.0.verify_strict(&payload(digest), &raw).is_ok()
}

/// Like [`verify`], as a `Result` for use in the deploy path.
pub fn ensure_verified(digest: &str, sig: &Signature, key: &PublicKey) -> Result<(), SignError> {
    if verify(digest, sig, key) {
        Ok(())
    } else {
        Err(SignError::VerificationFailed(digest.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KeyMaterial, StaticSecretStore};
    use proptest::prelude::*;
    use rpl_core::ImageRef;
    use rpl_registry::InMemoryRegistry;

    async fn pushed(registry: &InMemoryRegistry, tag: &str) -> Image {
        registry
            .push(&ImageRef {
                repository: "reg/app".into(),
                tag: tag.into(),
            })
            .await
            .unwrap()
    }

    fn service(seed: [u8; 32], registry: Arc<InMemoryRegistry>) -> SigningService {
        SigningService::new(Arc::new(StaticSecretStore::new(seed)), registry)
    }

    #[tokio::test]
    async fn signs_pushed_digest_and_verifies() {
        let registry = Arc::new(InMemoryRegistry::new());
        let image = pushed(&registry, "b1").await;
        let sig = service([3u8; 32], registry.clone()).sign(&image).await.unwrap();
        let pk = KeyMaterial::from_seed([3u8; 32]).public_key();
        assert_eq!(sig.image_digest, image.digest);
        assert!(verify(&image.digest, &sig, &pk));
        assert!(ensure_verified(&image.digest, &sig, &pk).is_ok());
    }

    #[tokio::test]
    async fn refuses_unpushed_digest() {
        let registry = Arc::new(InMemoryRegistry::new());
        let image = Image {
            repository: "reg/app".into(),
            tag: "b1".into(),
            digest: "sha256:00".into(),
        };
        let err = service([3u8; 32], registry).sign(&image).await.unwrap_err();
        assert!(matches!(err, SignError::NotPushed { .. }));
    }

    #[tokio::test]
    async fn other_key_does_not_verify() {
        let registry = Arc::new(InMemoryRegistry::new());
        let image = pushed(&registry, "b1").await;
        let sig = service([3u8; 32], registry).sign(&image).await.unwrap();
        let other = KeyMaterial::from_seed([4u8; 32]).public_key();
        assert!(!verify(&image.digest, &sig, &other));
    }

    proptest! {
        #[test]
        fn roundtrip_and_tamper(seed in any::<[u8; 32]>(), digest in "sha256:[0-9a-f]{64}", flip in 0usize..64) {
            let key = KeyMaterial::from_seed(seed);
            let pk = key.public_key();
            let raw = key.signing_key().sign(&payload(&digest));
            let sig = Signature {
                image_digest: digest.clone(),
                signer_key_id: pk.key_id(),
                signature_bytes: raw.to_bytes().to_vec(),
            };
            prop_assert!(verify(&digest, &sig, &pk));

            let mut tampered = sig.clone();
            tampered.signature_bytes[flip] ^= 0x01;
            prop_assert!(!verify(&digest, &tampered, &pk));

            let other_digest = format!("{}0", &digest[..digest.len() - 1]);
            if other_digest != digest {
                prop_assert!(!verify(&other_digest, &sig, &pk));
            }
        }
    }
}
