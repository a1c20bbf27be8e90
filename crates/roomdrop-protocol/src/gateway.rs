//! Encryption gateway contract and a local stand-in.
//!
//! The real gateway is a threshold-encryption network: payloads are
//! encrypted under an access condition and the network only releases the
//! key to callers proving they satisfy it. The coordinator depends on the
//! [`EncryptionGateway`] trait alone.

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use hkdf::Hkdf;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::config::ConditionSpec;

/// Errors surfaced by an encryption gateway.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GatewayError {
    /// The caller does not meet the access condition. Not retryable as-is.
    #[error("condition not satisfied: {0}")]
    ConditionNotSatisfied(String),

    #[error("{0}")]
    Failed(String),
}

/// What the coordinator knows about a payload when asking for decryption.
#[derive(Debug, Clone)]
pub struct DecryptContext {
    pub file_id: String,
    /// The announced condition description.
    pub access_condition: String,
}

/// Encrypt-under-condition / decrypt-with-proof.
#[async_trait::async_trait]
pub trait EncryptionGateway: Send + Sync {
    async fn encrypt(
        &self,
        plaintext: &[u8],
        condition: &ConditionSpec,
    ) -> Result<Vec<u8>, GatewayError>;

    async fn decrypt(
        &self,
        ciphertext: &[u8],
        context: &DecryptContext,
    ) -> Result<Vec<u8>, GatewayError>;
}

// ── Local stand-in ────────────────────────────────────────────────────

/// Decides whether the local account satisfies a condition.
#[async_trait::async_trait]
pub trait ConditionOracle: Send + Sync {
    async fn is_satisfied(&self, condition: &ConditionSpec) -> Result<bool, String>;
}

/// Oracle with a fixed answer.
#[derive(Debug, Clone, Copy)]
pub struct StaticOracle(pub bool);

#[async_trait::async_trait]
impl ConditionOracle for StaticOracle {
    async fn is_satisfied(&self, _condition: &ConditionSpec) -> Result<bool, String> {
        Ok(self.0)
    }
}

/// HKDF info string for domain separation.
const SEAL_INFO: &[u8] = b"roomdrop-condition-seal-xchacha20poly1305-v1";

const SEAL_VERSION: u8 = 1;

/// Sealed payload as stored in the content-addressed store.
#[derive(Debug, Serialize, Deserialize)]
struct SealedPayload {
    version: u8,
    condition: ConditionSpec,
    nonce: [u8; 24],
    ciphertext: Vec<u8>,
}

/// In-process gateway for tests, the simulator and single-operator setups.
///
/// Seals with XChaCha20-Poly1305 under a key derived (HKDF-SHA256) from a
/// network secret shared by all participants and from the condition
/// itself. The condition description is bound as associated data.
/// Before opening, the [`ConditionOracle`] must approve the condition.
pub struct LocalConditionGateway<O> {
    network_secret: [u8; 32],
    oracle: O,
}

impl<O: ConditionOracle> LocalConditionGateway<O> {
    pub fn new(network_secret: [u8; 32], oracle: O) -> Self {
        Self {
            network_secret,
            oracle,
        }
    }

    fn cipher_for(&self, condition: &ConditionSpec) -> Result<XChaCha20Poly1305, GatewayError> {
        let salt = format!("{}:{}", condition.chain, condition.description());
        let hkdf = Hkdf::<Sha256>::new(Some(salt.as_bytes()), &self.network_secret);
        let mut key = [0u8; 32];
        hkdf.expand(SEAL_INFO, &mut key)
            .map_err(|e| GatewayError::Failed(format!("key derivation failed: {e}")))?;
        Ok(XChaCha20Poly1305::new(&key.into()))
    }
}

#[async_trait::async_trait]
impl<O: ConditionOracle> EncryptionGateway for LocalConditionGateway<O> {
    async fn encrypt(
        &self,
        plaintext: &[u8],
        condition: &ConditionSpec,
    ) -> Result<Vec<u8>, GatewayError> {
        let cipher = self.cipher_for(condition)?;

        let mut nonce = [0u8; 24];
        rand::rng().fill_bytes(&mut nonce);

        let aad = condition.description();
        let ciphertext = cipher
            .encrypt(
                &XNonce::from(nonce),
                Payload {
                    msg: plaintext,
                    aad: aad.as_bytes(),
                },
            )
            .map_err(|e| GatewayError::Failed(format!("encryption failed: {e}")))?;

        let sealed = SealedPayload {
            version: SEAL_VERSION,
            condition: condition.clone(),
            nonce,
            ciphertext,
        };
        rmp_serde::to_vec(&sealed).map_err(|e| GatewayError::Failed(e.to_string()))
    }

    async fn decrypt(
        &self,
        ciphertext: &[u8],
        context: &DecryptContext,
    ) -> Result<Vec<u8>, GatewayError> {
        let sealed: SealedPayload = rmp_serde::from_slice(ciphertext)
            .map_err(|e| GatewayError::Failed(format!("not a sealed payload: {e}")))?;

        let description = sealed.condition.description();
        if !context.access_condition.is_empty() && context.access_condition != description {
            tracing::warn!(
                file_id = %context.file_id,
                announced = %context.access_condition,
                sealed = %description,
                "announced condition differs from sealed condition"
            );
        }

        let satisfied = self
            .oracle
            .is_satisfied(&sealed.condition)
            .await
            .map_err(|e| GatewayError::Failed(format!("condition check failed: {e}")))?;
        if !satisfied {
            return Err(GatewayError::ConditionNotSatisfied(description));
        }

        let cipher = self.cipher_for(&sealed.condition)?;
        cipher
            .decrypt(
                &XNonce::from(sealed.nonce),
                Payload {
                    msg: &sealed.ciphertext,
                    aad: description.as_bytes(),
                },
            )
            .map_err(|e| GatewayError::Failed(format!("decryption failed: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(condition: &ConditionSpec) -> DecryptContext {
        DecryptContext {
            file_id: "cid".into(),
            access_condition: condition.description(),
        }
    }

    #[tokio::test]
    async fn seal_and_open() {
        let gateway = LocalConditionGateway::new([7; 32], StaticOracle(true));
        let condition = ConditionSpec::default();

        let sealed = gateway.encrypt(b"secret bytes", &condition).await.unwrap();
        assert_ne!(sealed, b"secret bytes".to_vec());

        let opened = gateway.decrypt(&sealed, &ctx(&condition)).await.unwrap();
        assert_eq!(opened, b"secret bytes".to_vec());
    }

    #[tokio::test]
    async fn unsatisfied_condition_is_distinguished() {
        let sender = LocalConditionGateway::new([7; 32], StaticOracle(true));
        let receiver = LocalConditionGateway::new([7; 32], StaticOracle(false));
        let condition = ConditionSpec::default();

        let sealed = sender.encrypt(b"data", &condition).await.unwrap();
        let err = receiver.decrypt(&sealed, &ctx(&condition)).await.unwrap_err();
        assert_eq!(err, GatewayError::ConditionNotSatisfied("balance > 0".into()));
    }

    #[tokio::test]
    async fn wrong_network_secret_fails_generically() {
        let sender = LocalConditionGateway::new([1; 32], StaticOracle(true));
        let receiver = LocalConditionGateway::new([2; 32], StaticOracle(true));
        let condition = ConditionSpec::default();

        let sealed = sender.encrypt(b"data", &condition).await.unwrap();
        let err = receiver.decrypt(&sealed, &ctx(&condition)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Failed(_)));
    }

    #[tokio::test]
    async fn garbage_ciphertext_fails() {
        let gateway = LocalConditionGateway::new([1; 32], StaticOracle(true));
        let err = gateway
            .decrypt(b"plain bytes", &ctx(&ConditionSpec::default()))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Failed(_)));
    }
}
