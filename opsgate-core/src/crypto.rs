use std::collections::HashMap;

use aes_gcm::aead::Aead;
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use async_trait::async_trait;
use opsgate_common::helpers::rng::get_crypto_rng;
use rand::RngCore;

pub const DATA_KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

const CONTEXT_SESSION_ID: &str = "aws:ssm:SessionId";
const CONTEXT_TARGET_ID: &str = "aws:ssm:TargetId";

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("KMS decrypt failed: {0}")]
    KmsDecryptFailed(String),
    #[error("unexpected data key length {0}")]
    InvalidKeyLength(usize),
    #[error("encryption failed")]
    EncryptFailed,
    #[error("decryption failed")]
    DecryptFailed,
    #[error("cipher has no data key yet")]
    KeyNotReady,
}

/// Key-unwrapping capability provided by the embedding agent.
#[async_trait]
pub trait KmsFacade: Send + Sync {
    async fn decrypt(
        &self,
        ciphertext: &[u8],
        encryption_context: &HashMap<String, String>,
    ) -> Result<Vec<u8>, CryptoError>;
}

/// AES-256-GCM cipher bound to a session data key. The key is delivered
/// wrapped and unwrapped once per session via [`KmsFacade`]; every
/// encryption uses a fresh CSPRNG nonce prepended to the ciphertext.
pub struct BlockCipher {
    kms_key_id: String,
    cipher: Option<Aes256Gcm>,
}

impl BlockCipher {
    pub fn new(kms_key_id: impl Into<String>) -> Self {
        BlockCipher {
            kms_key_id: kms_key_id.into(),
            cipher: None,
        }
    }

    pub fn kms_key_id(&self) -> &str {
        &self.kms_key_id
    }

    pub fn is_ready(&self) -> bool {
        self.cipher.is_some()
    }

    /// Unwraps a session data key. The encryption context binds the
    /// wrapped key to this session and target.
    pub async fn unwrap_data_key(
        facade: &dyn KmsFacade,
        wrapped_key: &[u8],
        session_id: &str,
        instance_id: &str,
    ) -> Result<Vec<u8>, CryptoError> {
        let mut context = HashMap::new();
        context.insert(CONTEXT_SESSION_ID.to_owned(), session_id.to_owned());
        context.insert(CONTEXT_TARGET_ID.to_owned(), instance_id.to_owned());
        facade.decrypt(wrapped_key, &context).await
    }

    pub fn set_key(&mut self, key: &[u8]) -> Result<(), CryptoError> {
        if key.len() != DATA_KEY_LEN {
            return Err(CryptoError::InvalidKeyLength(key.len()));
        }
        self.cipher =
            Some(Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeyLength(key.len()))?);
        Ok(())
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = self.cipher.as_ref().ok_or(CryptoError::KeyNotReady)?;

        let mut nonce = [0u8; NONCE_LEN];
        get_crypto_rng().fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptFailed)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let cipher = self.cipher.as_ref().ok_or(CryptoError::KeyNotReady)?;
        if data.len() < NONCE_LEN {
            return Err(CryptoError::DecryptFailed);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) struct FakeKms {
        pub plaintext_key: Vec<u8>,
    }

    #[async_trait]
    impl KmsFacade for FakeKms {
        async fn decrypt(
            &self,
            _ciphertext: &[u8],
            encryption_context: &HashMap<String, String>,
        ) -> Result<Vec<u8>, CryptoError> {
            assert!(encryption_context.contains_key(CONTEXT_SESSION_ID));
            assert!(encryption_context.contains_key(CONTEXT_TARGET_ID));
            Ok(self.plaintext_key.clone())
        }
    }

    fn ready_cipher() -> BlockCipher {
        let mut cipher = BlockCipher::new("key-id");
        cipher.set_key(&[7u8; DATA_KEY_LEN]).unwrap();
        cipher
    }

    #[tokio::test]
    async fn test_unwrap_key_builds_session_context() {
        let kms = FakeKms {
            plaintext_key: vec![1u8; DATA_KEY_LEN],
        };
        let key = BlockCipher::unwrap_data_key(&kms, b"wrapped", "sess-1", "i-1234")
            .await
            .unwrap();
        assert_eq!(key.len(), DATA_KEY_LEN);
    }

    #[test]
    fn test_round_trip() {
        let cipher = ready_cipher();
        let ct = cipher.encrypt(b"attack at dawn").unwrap();
        assert_ne!(&ct[NONCE_LEN..], b"attack at dawn".as_slice());
        assert_eq!(cipher.decrypt(&ct).unwrap(), b"attack at dawn");
    }

    #[test]
    fn test_nonces_are_unique_per_call() {
        let cipher = ready_cipher();
        let a = cipher.encrypt(b"x").unwrap();
        let b = cipher.encrypt(b"x").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn test_tag_mismatch_is_rejected() {
        let cipher = ready_cipher();
        let mut ct = cipher.encrypt(b"payload").unwrap();
        let last = ct.len() - 1;
        ct[last] ^= 0x01;
        assert!(matches!(cipher.decrypt(&ct), Err(CryptoError::DecryptFailed)));
    }

    #[test]
    fn test_rejects_short_keys_and_missing_key() {
        let mut cipher = BlockCipher::new("key-id");
        assert!(matches!(
            cipher.set_key(&[0u8; 16]),
            Err(CryptoError::InvalidKeyLength(16))
        ));
        assert!(matches!(cipher.encrypt(b"x"), Err(CryptoError::KeyNotReady)));
    }
}
