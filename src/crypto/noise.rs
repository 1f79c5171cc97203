//! Noise symmetric state for WireGuard
//!
//! Pattern: Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s. The state is the pair
//! (chaining key, hash) both handshake roles evolve in lockstep.

use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{aead, blake2s, x25519};
use crate::error::CryptoError;

/// Noise protocol construction string
pub const CONSTRUCTION: &[u8] = b"Noise_IKpsk2_25519_ChaChaPoly_BLAKE2s";

/// WireGuard identifier string
pub const IDENTIFIER: &[u8] = b"WireGuard v1 zx2c4 Jason@zx2c4.com";

/// Label for MAC1 key derivation
pub const LABEL_MAC1: &[u8] = b"mac1----";

/// Label for cookie key derivation
pub const LABEL_COOKIE: &[u8] = b"cookie--";

/// Hash length (also chaining key length)
pub const HASH_LEN: usize = 32;

/// Chaining key and hash accumulator of an in-progress handshake
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricState {
    pub chaining_key: [u8; HASH_LEN],
    pub hash: [u8; HASH_LEN],
}

impl SymmetricState {
    /// InitialChainKey = HASH(CONSTRUCTION)
    pub fn initial_chain_key() -> [u8; HASH_LEN] {
        blake2s::hash(CONSTRUCTION)
    }

    /// InitialHash = HASH(InitialChainKey || IDENTIFIER)
    pub fn initial_hash() -> [u8; HASH_LEN] {
        blake2s::hash_two(&Self::initial_chain_key(), IDENTIFIER)
    }

    /// Fresh state with the responder's static public key mixed in.
    ///
    /// Both roles start here: the initiator with the peer's key, the
    /// responder with its own.
    pub fn new(responder_static: &[u8; 32]) -> Self {
        let mut state = Self {
            chaining_key: Self::initial_chain_key(),
            hash: Self::initial_hash(),
        };
        state.mix_hash(responder_static);
        state
    }

    /// Resume from a stored (chaining key, hash) pair
    pub fn resume(chaining_key: [u8; HASH_LEN], hash: [u8; HASH_LEN]) -> Self {
        Self { chaining_key, hash }
    }

    /// h = HASH(h || data)
    pub fn mix_hash(&mut self, data: &[u8]) {
        self.hash = blake2s::hash_two(&self.hash, data);
    }

    /// ck = KDF1(ck, data)
    pub fn mix_key(&mut self, data: &[u8]) {
        self.chaining_key = blake2s::kdf1(&self.chaining_key, data);
    }

    /// (ck, k) = KDF2(ck, DH(private, public)), returning k
    pub fn mix_dh(
        &mut self,
        private_key: &[u8; 32],
        public_key: &[u8; 32],
    ) -> Result<[u8; 32], CryptoError> {
        let mut shared = x25519::dh(private_key, public_key)?;
        let key = self.mix_secret(&shared);
        shared.zeroize();
        Ok(key)
    }

    /// ck = KDF1(ck, DH(private, public))
    pub fn mix_key_dh(
        &mut self,
        private_key: &[u8; 32],
        public_key: &[u8; 32],
    ) -> Result<(), CryptoError> {
        let mut shared = x25519::dh(private_key, public_key)?;
        self.mix_key(&shared);
        shared.zeroize();
        Ok(())
    }

    /// (ck, k) = KDF2(ck, secret), returning k
    pub fn mix_secret(&mut self, secret: &[u8; 32]) -> [u8; 32] {
        let (chaining_key, key) = blake2s::kdf2(&self.chaining_key, secret);
        self.chaining_key = chaining_key;
        key
    }

    /// (ck, tau, k) = KDF3(ck, psk); h = HASH(h || tau), returning k
    pub fn mix_psk(&mut self, psk: &[u8; 32]) -> [u8; 32] {
        let (chaining_key, mut tau, key) = blake2s::kdf3(&self.chaining_key, psk);
        self.chaining_key = chaining_key;
        self.mix_hash(&tau);
        tau.zeroize();
        key
    }

    /// c = AEAD(k, 0, plaintext, h); h = HASH(h || c)
    pub fn encrypt_and_hash(
        &mut self,
        key: &[u8; 32],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let ciphertext = aead::encrypt(key, 0, plaintext, &self.hash)?;
        self.mix_hash(&ciphertext);
        Ok(ciphertext)
    }

    /// p = AEAD-Open(k, 0, c, h); h = HASH(h || c)
    pub fn decrypt_and_hash(
        &mut self,
        key: &[u8; 32],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let plaintext = aead::decrypt(key, 0, ciphertext, &self.hash)?;
        self.mix_hash(ciphertext);
        Ok(plaintext)
    }

    /// Split the final chaining key into (initiator→responder, responder→initiator) keys
    pub fn split(&self) -> ([u8; 32], [u8; 32]) {
        blake2s::kdf2(&self.chaining_key, &[])
    }
}

/// mac1_key = HASH(LABEL_MAC1 || public_key)
pub fn mac1_key(public_key: &[u8; 32]) -> [u8; 32] {
    blake2s::hash_two(LABEL_MAC1, public_key)
}

/// cookie_key = HASH(LABEL_COOKIE || public_key)
pub fn cookie_key(public_key: &[u8; 32]) -> [u8; 32] {
    blake2s::hash_two(LABEL_COOKIE, public_key)
}
