use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;

use crate::domain::{error::CipherError, model::EncryptionKey, port::Cipher};

const NONCE_SIZE: usize = 12;

/// AES-256-GCM. Output layout is `nonce (12 bytes) || ciphertext+tag`.
#[derive(Clone, Copy, Debug, Default)]
pub struct AesGcmCipher;

impl AesGcmCipher {
    fn cipher(key: &EncryptionKey) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()))
    }
}

impl Cipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8], key: &EncryptionKey) -> Result<Vec<u8>, CipherError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let sealed = Self::cipher(key)
            .encrypt(&nonce, plaintext)
            .map_err(|_| CipherError::Authentication)?;
        let mut output = Vec::with_capacity(NONCE_SIZE + sealed.len());
        output.extend_from_slice(&nonce);
        output.extend_from_slice(&sealed);
        Ok(output)
    }

    fn decrypt(&self, ciphertext: &[u8], key: &EncryptionKey) -> Result<Vec<u8>, CipherError> {
        if ciphertext.len() < NONCE_SIZE {
            return Err(CipherError::TooShort);
        }
        let (nonce, sealed) = ciphertext.split_at(NONCE_SIZE);
        Self::cipher(key)
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|_| CipherError::Authentication)
    }
}
