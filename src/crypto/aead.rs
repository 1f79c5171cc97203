//! AEAD encryption for WireGuard
//!
//! ChaCha20-Poly1305 with a 64-bit little-endian counter nonce for handshake
//! payloads and transport data; XChaCha20-Poly1305 for cookie replies.

use chacha20poly1305::{
    aead::{Aead, AeadInPlace, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce, XChaCha20Poly1305, XNonce,
};

use super::KEY_LEN;
use crate::error::CryptoError;

/// Authentication tag length
pub const TAG_LEN: usize = 16;

/// ChaCha20-Poly1305 nonce length
pub const NONCE_LEN: usize = 12;

/// XChaCha20-Poly1305 nonce length
pub const XNONCE_LEN: usize = 24;

/// 4 zero bytes followed by the counter, little-endian
fn counter_nonce(counter: u64) -> Nonce {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[4..].copy_from_slice(&counter.to_le_bytes());
    Nonce::clone_from_slice(&nonce)
}

/// Encrypt `plaintext`, returning ciphertext with the tag appended
pub fn encrypt(
    key: &[u8; KEY_LEN],
    counter: u64,
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    ChaCha20Poly1305::new(Key::from_slice(key))
        .encrypt(&counter_nonce(counter), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Encryption)
}

/// Decrypt and authenticate `ciphertext` (tag included)
pub fn decrypt(
    key: &[u8; KEY_LEN],
    counter: u64,
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }

    ChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt(&counter_nonce(counter), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::Decryption)
}

/// Encrypt `buffer` in place and append the tag. Used on the data path.
pub fn encrypt_in_place(
    key: &[u8; KEY_LEN],
    counter: u64,
    buffer: &mut Vec<u8>,
) -> Result<(), CryptoError> {
    ChaCha20Poly1305::new(Key::from_slice(key))
        .encrypt_in_place(&counter_nonce(counter), &[], buffer)
        .map_err(|_| CryptoError::Encryption)
}

/// Decrypt `buffer` in place; on success the tag is stripped
pub fn decrypt_in_place(
    key: &[u8; KEY_LEN],
    counter: u64,
    buffer: &mut Vec<u8>,
) -> Result<(), CryptoError> {
    if buffer.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }

    ChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt_in_place(&counter_nonce(counter), &[], buffer)
        .map_err(|_| CryptoError::Decryption)
}

/// Encrypt using XChaCha20-Poly1305 (cookie replies)
pub fn xencrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    XChaCha20Poly1305::new(Key::from_slice(key))
        .encrypt(XNonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::Encryption)
}

/// Decrypt using XChaCha20-Poly1305 (cookie replies)
pub fn xdecrypt(
    key: &[u8; KEY_LEN],
    nonce: &[u8; XNONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::Decryption);
    }

    XChaCha20Poly1305::new(Key::from_slice(key))
        .decrypt(XNonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::Decryption)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let key = [3u8; 32];
        let ciphertext = encrypt(&key, 42, b"Hello, WireGuard!", b"aad").unwrap();
        assert_eq!(ciphertext.len(), 17 + TAG_LEN);

        let decrypted = decrypt(&key, 42, &ciphertext, b"aad").unwrap();
        assert_eq!(decrypted, b"Hello, WireGuard!");
    }

    #[test]
    fn test_decrypt_rejects_wrong_counter_or_aad() {
        let key = [3u8; 32];
        let ciphertext = encrypt(&key, 42, b"payload", b"aad").unwrap();

        assert!(decrypt(&key, 43, &ciphertext, b"aad").is_err());
        assert!(decrypt(&key, 42, &ciphertext, b"other").is_err());
        assert!(decrypt(&[4u8; 32], 42, &ciphertext, b"aad").is_err());
    }

    #[test]
    fn test_in_place_matches_detached() {
        let key = [5u8; 32];
        let mut buffer = b"in place payload".to_vec();
        encrypt_in_place(&key, 9, &mut buffer).unwrap();
        assert_eq!(buffer, encrypt(&key, 9, b"in place payload", &[]).unwrap());

        decrypt_in_place(&key, 9, &mut buffer).unwrap();
        assert_eq!(buffer, b"in place payload");
    }

    #[test]
    fn test_short_ciphertext_rejected() {
        let key = [5u8; 32];
        let mut short = vec![0u8; TAG_LEN - 1];
        assert!(decrypt_in_place(&key, 0, &mut short).is_err());
        assert!(xdecrypt(&key, &[0u8; XNONCE_LEN], &short, &[]).is_err());
    }

    #[test]
    fn test_empty_plaintext_is_tag_only() {
        let key = [0u8; 32];
        let ciphertext = encrypt(&key, 0, &[], &[]).unwrap();
        assert_eq!(ciphertext.len(), TAG_LEN);
        assert!(decrypt(&key, 0, &ciphertext, &[]).unwrap().is_empty());
    }

    #[test]
    fn test_xchacha_roundtrip() {
        let key = [1u8; 32];
        let nonce = [2u8; XNONCE_LEN];
        let ciphertext = xencrypt(&key, &nonce, b"cookie", b"mac1").unwrap();
        assert_eq!(xdecrypt(&key, &nonce, &ciphertext, b"mac1").unwrap(), b"cookie");
        assert!(xdecrypt(&key, &nonce, &ciphertext, b"mac2").is_err());
    }
}
