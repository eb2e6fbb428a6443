pub mod hex;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::{rngs::OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::convert::TryFrom;
use std::error::Error;
use std::fmt::{Display, Formatter};

pub const IDENTITY_ID_LEN: usize = 32;
pub const PUBLIC_KEY_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 64;
pub const CHALLENGE_LEN: usize = 32;
pub const TOKEN_LEN: usize = 16;

#[derive(Debug)]
pub enum CryptoError {
    InvalidKey,
    Signature,
}

impl Display for CryptoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKey => write!(f, "invalid key material"),
            Self::Signature => write!(f, "signature error"),
        }
    }
}

impl Error for CryptoError {}

/// SHA-256 digest of arbitrary bytes.
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// Derives the network identifier of an identity from its public key.
pub fn identity_id(public_key: &[u8]) -> [u8; IDENTITY_ID_LEN] {
    sha256(public_key)
}

/// Generates a fresh 32-byte conversation challenge.
pub fn random_challenge() -> [u8; CHALLENGE_LEN] {
    let mut challenge = [0u8; CHALLENGE_LEN];
    OsRng.fill_bytes(&mut challenge);
    challenge
}

/// Generates a fresh 128-bit opaque token.
pub fn random_token() -> [u8; TOKEN_LEN] {
    let mut token = [0u8; TOKEN_LEN];
    OsRng.fill_bytes(&mut token);
    token
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityKeyPair {
    pub public: [u8; PUBLIC_KEY_LEN],
    pub private: [u8; 32],
}

impl IdentityKeyPair {
    /// Derives a deterministic key pair from seed material.
    pub fn from_seed(seed: &[u8]) -> Result<Self, CryptoError> {
        if seed.len() < 32 {
            return Err(CryptoError::InvalidKey);
        }
        let digest = Sha256::digest(seed);
        let mut private = [0u8; 32];
        private.copy_from_slice(&digest);
        let signing = SigningKey::from_bytes(&private);
        let public: [u8; PUBLIC_KEY_LEN] = signing.verifying_key().to_bytes();
        Ok(Self { public, private })
    }

    /// Generates a key pair from operating system entropy.
    pub fn generate() -> Self {
        let mut private = [0u8; 32];
        OsRng.fill_bytes(&mut private);
        let signing = SigningKey::from_bytes(&private);
        let public: [u8; PUBLIC_KEY_LEN] = signing.verifying_key().to_bytes();
        Self { public, private }
    }

    /// Signs a message with Ed25519.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        let signing = SigningKey::from_bytes(&self.private);
        signing.sign(message).to_bytes()
    }

    /// The identity network id of this key pair.
    pub fn identity_id(&self) -> [u8; IDENTITY_ID_LEN] {
        identity_id(&self.public)
    }
}

/// Verifies an Ed25519 signature over a message.
pub fn verify_signature(
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<(), CryptoError> {
    let key_bytes: [u8; PUBLIC_KEY_LEN] =
        public_key.try_into().map_err(|_| CryptoError::InvalidKey)?;
    let verifying = VerifyingKey::from_bytes(&key_bytes).map_err(|_| CryptoError::InvalidKey)?;
    let sig = Signature::try_from(signature).map_err(|_| CryptoError::Signature)?;
    verifying
        .verify(message, &sig)
        .map_err(|_| CryptoError::Signature)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_id_is_sha256_of_public_key() {
        let keys = IdentityKeyPair::from_seed(b"identity-identity-identity-seed!").unwrap();
        let id = identity_id(&keys.public);
        let expected = Sha256::digest(keys.public);
        assert_eq!(&id[..], &expected[..]);
        assert_eq!(keys.identity_id(), id);
    }

    #[test]
    fn sign_verify_roundtrip() {
        let keys = IdentityKeyPair::from_seed(b"sign-sign-sign-sign-sign-sign-32").unwrap();
        let signature = keys.sign(b"challenge");
        verify_signature(&keys.public, b"challenge", &signature).unwrap();
    }

    #[test]
    fn verify_rejects_tampered_message() {
        let keys = IdentityKeyPair::from_seed(b"tamper-tamper-tamper-tamper-32!!").unwrap();
        let signature = keys.sign(b"challenge");
        assert!(verify_signature(&keys.public, b"other", &signature).is_err());
    }

    #[test]
    fn verify_rejects_short_key() {
        let keys = IdentityKeyPair::generate();
        let signature = keys.sign(b"payload");
        assert!(matches!(
            verify_signature(&keys.public[..16], b"payload", &signature),
            Err(CryptoError::InvalidKey)
        ));
    }

    #[test]
    fn seed_too_short_is_rejected() {
        assert!(IdentityKeyPair::from_seed(b"short").is_err());
    }

    #[test]
    fn challenges_and_tokens_differ() {
        assert_ne!(random_challenge(), random_challenge());
        assert_ne!(random_token(), random_token());
    }
}
