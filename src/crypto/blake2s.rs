//! BLAKE2s primitives for WireGuard
//!
//! HASH is BLAKE2s-256, MAC is keyed BLAKE2s-128 and the KDF is the HKDF
//! construction over HMAC-BLAKE2s.

use blake2::{
    digest::{consts::U16, FixedOutput, Mac as MacTrait, Update},
    Blake2s256, Blake2sMac, Digest,
};
use hmac::SimpleHmac;
use zeroize::Zeroize;

type HmacBlake2s = SimpleHmac<Blake2s256>;

/// Length of BLAKE2s-256 hash output
pub const HASH_LEN: usize = 32;

/// Length of a WireGuard MAC (MAC1, MAC2, cookie)
pub const MAC_LEN: usize = 16;

/// BLAKE2s-256 hash of a single input
pub fn hash(data: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, data);
    hasher.finalize().into()
}

/// HASH(a || b)
pub fn hash_two(a: &[u8], b: &[u8]) -> [u8; HASH_LEN] {
    let mut hasher = Blake2s256::new();
    Digest::update(&mut hasher, a);
    Digest::update(&mut hasher, b);
    hasher.finalize().into()
}

/// Keyed BLAKE2s with a 16-byte output.
///
/// The key is either a 32-byte derived key (MAC1, cookie secret) or a
/// 16-byte cookie (MAC2); both are within BLAKE2s' 1..=32 byte key range.
pub fn mac(key: &[u8], data: &[u8]) -> [u8; MAC_LEN] {
    mac_parts(key, &[data])
}

/// Keyed BLAKE2s over several concatenated inputs
pub fn mac_parts(key: &[u8], parts: &[&[u8]]) -> [u8; MAC_LEN] {
    let mut mac = Blake2sMac::<U16>::new_from_slice(key).expect("MAC key is 1..=32 bytes");
    for part in parts {
        MacTrait::update(&mut mac, part);
    }
    mac.finalize_fixed().into()
}

/// HMAC-BLAKE2s (RFC 2104 construction)
pub fn hmac(key: &[u8], data: &[u8]) -> [u8; HASH_LEN] {
    let mut mac = HmacBlake2s::new_from_slice(key).expect("HMAC accepts any key length");
    Update::update(&mut mac, data);
    mac.finalize_fixed().into()
}

/// HKDF expand over HMAC-BLAKE2s producing `N` chained outputs
fn kdf<const N: usize>(key: &[u8; HASH_LEN], input: &[u8]) -> [[u8; HASH_LEN]; N] {
    let mut prk = hmac(key, input);
    let mut out = [[0u8; HASH_LEN]; N];
    let mut block = [0u8; HASH_LEN + 1];

    for i in 0..N {
        let counter = (i + 1) as u8;
        out[i] = if i == 0 {
            hmac(&prk, &[counter])
        } else {
            block[..HASH_LEN].copy_from_slice(&out[i - 1]);
            block[HASH_LEN] = counter;
            hmac(&prk, &block)
        };
    }

    prk.zeroize();
    block.zeroize();
    out
}

/// KDF1(key, input) -> t0
pub fn kdf1(key: &[u8; HASH_LEN], input: &[u8]) -> [u8; HASH_LEN] {
    let [t0] = kdf::<1>(key, input);
    t0
}

/// KDF2(key, input) -> (t0, t1)
pub fn kdf2(key: &[u8; HASH_LEN], input: &[u8]) -> ([u8; HASH_LEN], [u8; HASH_LEN]) {
    let [t0, t1] = kdf::<2>(key, input);
    (t0, t1)
}

/// KDF3(key, input) -> (t0, t1, t2)
pub fn kdf3(
    key: &[u8; HASH_LEN],
    input: &[u8],
) -> ([u8; HASH_LEN], [u8; HASH_LEN], [u8; HASH_LEN]) {
    let [t0, t1, t2] = kdf::<3>(key, input);
    (t0, t1, t2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_empty_known_value() {
        // BLAKE2s-256("") from RFC 7693 test vectors
        let expected =
            hex::decode("69217a3079908094e11121d042354a7c1f55b6482ca1a51e1b250dfd1ed0eef9")
                .unwrap();
        assert_eq!(hash(&[]).as_slice(), expected.as_slice());
    }

    #[test]
    fn test_hash_two_is_concatenation() {
        assert_eq!(hash_two(b"hello", b"world"), hash(b"helloworld"));
    }

    #[test]
    fn test_mac_parts_is_concatenation() {
        let key = [7u8; 32];
        assert_eq!(mac_parts(&key, &[b"ab", b"cd"]), mac(&key, b"abcd"));

        let cookie = [9u8; MAC_LEN];
        assert_ne!(mac(&cookie, b"abcd"), mac(&key, b"abcd"));
    }

    #[test]
    fn test_kdf_outputs_chain() {
        let key = [0u8; 32];
        let input = b"test input";

        let k1 = kdf1(&key, input);
        let (k2a, k2b) = kdf2(&key, input);
        let (k3a, k3b, k3c) = kdf3(&key, input);

        // Each output is a prefix of the longer expansions
        assert_eq!(k1, k2a);
        assert_eq!(k2a, k3a);
        assert_eq!(k2b, k3b);
        assert_ne!(k3b, k3c);

        // t1 = HMAC(prk, t0 || 0x02)
        let prk = hmac(&key, input);
        let mut block = k1.to_vec();
        block.push(2);
        assert_eq!(hmac(&prk, &block), k2b);
    }
}
