//! Encryption at rest for clipboard contents.
//!
//! AES-256-CFB keyed with SHA-256 over the caller's public key wire form
//! and a server-side entropy value. The scheme is confidentiality in
//! depth, not an authenticated cipher: a wrong key decrypts to garbage
//! rather than an error, and tampering goes undetected. Rotating the
//! server entropy invalidates every stored clipboard at once.

use aes::cipher::{AsyncStreamCipher, KeyIvInit};
use aes::Aes256;
use anyhow::{anyhow, Result};
use rand::RngCore;
use sha2::{Digest, Sha256};

type CfbEncryptor = cfb_mode::Encryptor<Aes256>;
type CfbDecryptor = cfb_mode::Decryptor<Aes256>;

/// AES block size; the per-item IV length.
pub const IV_LEN: usize = 16;

/// Derives the per-user key. The public key binds the ciphertext to the
/// user, the entropy binds it to this server instance.
pub fn derive_key(pubkey_wire: &[u8], entropy: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(pubkey_wire);
    hasher.update(entropy.as_bytes());
    hasher.finalize().into()
}

pub fn random_iv() -> [u8; IV_LEN] {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// Encrypts in place. CFB is a stream construction, so the ciphertext has
/// exactly the plaintext's length.
pub fn encrypt(key: &[u8; 32], iv: &[u8; IV_LEN], data: &mut [u8]) -> Result<()> {
    let cipher = CfbEncryptor::new_from_slices(key, iv)
        .map_err(|_| anyhow!("could not build cipher"))?;
    cipher.encrypt(data);
    Ok(())
}

/// Decrypts in place with the stored IV.
pub fn decrypt(key: &[u8; 32], iv: &[u8], data: &mut [u8]) -> Result<()> {
    let cipher = CfbDecryptor::new_from_slices(key, iv)
        .map_err(|_| anyhow!("could not build cipher, bad iv"))?;
    cipher.decrypt(data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_restores_the_plaintext() {
        let key = derive_key(b"ssh-ed25519 wire bytes", "server-entropy");
        let iv = random_iv();

        let plaintext = b"hello clipboard".to_vec();
        let mut buf = plaintext.clone();
        encrypt(&key, &iv, &mut buf).unwrap();
        assert_ne!(buf, plaintext);
        assert_eq!(buf.len(), plaintext.len());

        decrypt(&key, &iv, &mut buf).unwrap();
        assert_eq!(buf, plaintext);
    }

    #[test]
    fn a_different_key_decrypts_to_garbage() {
        let key = derive_key(b"key one", "entropy");
        let other = derive_key(b"key two", "entropy");
        let iv = random_iv();

        let mut buf = b"sensitive".to_vec();
        encrypt(&key, &iv, &mut buf).unwrap();
        decrypt(&other, &iv, &mut buf).unwrap();
        assert_ne!(buf, b"sensitive");
    }

    #[test]
    fn entropy_participates_in_the_key() {
        assert_ne!(derive_key(b"key", "a"), derive_key(b"key", "b"));
        assert_eq!(derive_key(b"key", "a"), derive_key(b"key", "a"));
    }

    #[test]
    fn empty_plaintext_is_fine() {
        let key = derive_key(b"key", "entropy");
        let iv = random_iv();
        let mut buf: Vec<u8> = Vec::new();
        encrypt(&key, &iv, &mut buf).unwrap();
        assert!(buf.is_empty());
    }
}
