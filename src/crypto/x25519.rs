//! X25519 Diffie-Hellman for WireGuard

use rand::rngs::OsRng;
use x25519_dalek::{PublicKey, StaticSecret};

use super::KEY_LEN;
use crate::error::CryptoError;

/// Generate a new X25519 keypair, returned as (private, public)
pub fn generate_keypair() -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
    let secret = StaticSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret.to_bytes(), public.to_bytes())
}

/// Derive the public key for a private key
pub fn public_key(private_key: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let secret = StaticSecret::from(*private_key);
    PublicKey::from(&secret).to_bytes()
}

/// Apply the Curve25519 clamping to a private key
pub fn clamp(private_key: &mut [u8; KEY_LEN]) {
    private_key[0] &= 248;
    private_key[31] = (private_key[31] & 127) | 64;
}

/// X25519(private, public).
///
/// Fails when the peer's point has small order, i.e. the shared secret is
/// all zeros.
pub fn dh(
    private_key: &[u8; KEY_LEN],
    public_key: &[u8; KEY_LEN],
) -> Result<[u8; KEY_LEN], CryptoError> {
    let secret = StaticSecret::from(*private_key);
    let shared = secret.diffie_hellman(&PublicKey::from(*public_key));
    if !shared.was_contributory() {
        return Err(CryptoError::DiffieHellman);
    }
    Ok(shared.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dh_shared_secret_agrees() {
        let (alice_private, alice_public) = generate_keypair();
        let (bob_private, bob_public) = generate_keypair();

        assert_eq!(
            dh(&alice_private, &bob_public).unwrap(),
            dh(&bob_private, &alice_public).unwrap()
        );
        assert_eq!(public_key(&alice_private), alice_public);
    }

    #[test]
    fn test_dh_rejects_low_order_point() {
        let (private, _) = generate_keypair();
        assert!(dh(&private, &[0u8; 32]).is_err());

        let mut one = [0u8; 32];
        one[0] = 1;
        assert!(dh(&private, &one).is_err());
    }

    #[test]
    fn test_public_key_rfc7748_vector() {
        let private: [u8; 32] =
            hex::decode("77076d0a7318a57d3c16c17251b26645df4c2f87ebc0992ab177fba51db92c2a")
                .unwrap()
                .try_into()
                .unwrap();
        let expected =
            hex::decode("8520f0098930a754748b7ddcb43ef75a0dbf3a0d26381af4eba4a98eaa9b4e6a")
                .unwrap();
        assert_eq!(public_key(&private).as_slice(), expected.as_slice());
    }

    #[test]
    fn test_clamp() {
        let mut key = [0xffu8; 32];
        clamp(&mut key);
        assert_eq!(key[0], 0xf8);
        assert_eq!(key[31], 0x7f);
    }
}
