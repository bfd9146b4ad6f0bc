//! Cryptographic primitives for NNCP nodes.
//!
//! Provides three things:
//!   1. BLAKE3 hashing: node ids, envelope key derivation
//!   2. X25519 exchange keypairs: envelope payload encryption
//!   3. Ed25519 signing keypairs: envelope sender authentication
//!
//! Private key material derives ZeroizeOnDrop and is wiped from memory when
//! dropped. There is no unsafe code in this module.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

// ── BLAKE3 ────────────────────────────────────────────────────────────────────

/// Hash a byte slice, returning a 32-byte BLAKE3 digest.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Context string for envelope payload keys. Changing it breaks every
/// packet already sitting in a spool.
const ENVELOPE_KEY_CONTEXT: &str = "nncp 2024-01 envelope payload key";

/// Derive the symmetric payload key of one envelope.
///
///   key = BLAKE3-derive_key(ctx, shared || ephemeral_pub || recipient_pub)
pub fn derive_envelope_key(
    shared: &[u8; 32],
    ephemeral_pub: &[u8; 32],
    recipient_pub: &[u8; 32],
) -> Zeroizing<[u8; 32]> {
    let mut material = Zeroizing::new([0u8; 96]);
    material[..32].copy_from_slice(shared);
    material[32..64].copy_from_slice(ephemeral_pub);
    material[64..].copy_from_slice(recipient_pub);
    Zeroizing::new(blake3::derive_key(ENVELOPE_KEY_CONTEXT, &*material))
}

// ── Exchange keypair ──────────────────────────────────────────────────────────

/// A node's long-term X25519 exchange keypair.
///
/// Senders combine a fresh ephemeral key with the recipient's exchange
/// public key; only the recipient can recompute the shared secret.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct ExchangeKeypair {
    private: Zeroizing<[u8; 32]>,
    pub public: [u8; 32],
}

impl ExchangeKeypair {
    /// Generate a new random X25519 keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(secret.to_bytes()),
            public: *public.as_bytes(),
        }
    }

    /// Reconstruct a keypair from stored private key bytes.
    /// The public key is derived deterministically from the private key.
    pub fn from_private(private_bytes: [u8; 32]) -> Self {
        let secret = StaticSecret::from(private_bytes);
        let public = PublicKey::from(&secret);
        Self {
            private: Zeroizing::new(private_bytes),
            public: *public.as_bytes(),
        }
    }

    pub fn private_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(*self.private)
    }

    /// X25519 with a peer public key. Fails on a non-contributory result
    /// (low-order peer key).
    pub fn diffie_hellman(&self, peer_public: &[u8; 32]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let secret = StaticSecret::from(*self.private);
        let shared = secret.diffie_hellman(&PublicKey::from(*peer_public));
        if !shared.was_contributory() {
            return Err(CryptoError::WeakKey);
        }
        Ok(Zeroizing::new(*shared.as_bytes()))
    }
}

/// One-shot ephemeral X25519 agreement used when sealing an envelope.
/// Returns (ephemeral public key, shared secret).
pub fn ephemeral_agreement(
    recipient_public: &[u8; 32],
) -> Result<([u8; 32], Zeroizing<[u8; 32]>), CryptoError> {
    let secret = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    let shared = secret.diffie_hellman(&PublicKey::from(*recipient_public));
    if !shared.was_contributory() {
        return Err(CryptoError::WeakKey);
    }
    Ok((*public.as_bytes(), Zeroizing::new(*shared.as_bytes())))
}

// ── Signing keypair ───────────────────────────────────────────────────────────

/// A node's long-term Ed25519 signing keypair. The node id is derived from
/// its public half.
pub struct SigningKeypair {
    key: SigningKey,
}

impl SigningKeypair {
    pub fn generate() -> Self {
        Self {
            key: SigningKey::generate(&mut OsRng),
        }
    }

    /// Reconstruct from the stored 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    pub fn seed(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.key.to_bytes())
    }

    pub fn public(&self) -> [u8; 32] {
        self.key.verifying_key().to_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.key.sign(message).to_bytes()
    }
}

/// Verify an Ed25519 signature made by `public` over `message`.
pub fn verify(public: &[u8; 32], message: &[u8], signature: &[u8; 64]) -> Result<(), CryptoError> {
    let key = VerifyingKey::from_bytes(public).map_err(|_| CryptoError::BadPublicKey)?;
    let sig = ed25519_dalek::Signature::from_bytes(signature);
    key.verify(message, &sig)
        .map_err(|_| CryptoError::BadSignature)
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("non-contributory key agreement")]
    WeakKey,
    #[error("malformed public key")]
    BadPublicKey,
    #[error("signature verification failed")]
    BadSignature,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
