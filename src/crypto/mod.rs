//! Cryptographic primitives for WireGuard
//!
//! - BLAKE2s hashing, keyed MAC and HMAC-based key derivation (blake2s)
//! - ChaCha20-Poly1305 and XChaCha20-Poly1305 AEAD (aead)
//! - X25519 Diffie-Hellman (x25519)
//! - Noise symmetric state for the IKpsk2 pattern (noise)

pub mod aead;
pub mod blake2s;
pub mod noise;
pub mod x25519;

/// Length of every key handled by the protocol (static, ephemeral, symmetric, preshared)
pub const KEY_LEN: usize = 32;

/// Constant-time comparison of two equal-length byte strings
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// True if every byte is zero, evaluated without early exit
pub fn is_zero(data: &[u8]) -> bool {
    data.iter().fold(0u8, |acc, b| acc | b) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abcd", b"abcd"));
        assert!(!constant_time_eq(b"abcd", b"abce"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }

    #[test]
    fn test_is_zero() {
        assert!(is_zero(&[0u8; 32]));
        let mut key = [0u8; 32];
        key[31] = 1;
        assert!(!is_zero(&key));
    }
}
