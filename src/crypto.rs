//! Cryptographic primitives and trait abstractions.
//!
//! This module provides:
//! - [`RandomSource`], the injectable source of randomness used for token
//!   generation, nonces, and random record selection
//! - [`RuntimeAead`], the runtime-polymorphic AEAD used to seal the key ring
//!   at rest and to run the HKDF protection scheme
//!
//! # Testing
//!
//! Production code uses [`OsRandom`]. Tests inject [`SeededRandom`] to make
//! record generation and selection reproducible.

use crate::{key::SecretKey, Algorithm, Error, Result};
use aead::{generic_array::typenum::U12, Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::{
    ChaCha20Poly1305, Key as ChaChaKey, Nonce as ChaChaNonce, XChaCha20Poly1305, XNonce,
};
use rand::Rng;
use rand_chacha::ChaCha20Rng;
use rand_core::{RngCore, SeedableRng};
use std::sync::Mutex;

type AesKey = aes_gcm::Key<Aes256Gcm>;
type AesNonce = aes_gcm::Nonce<U12>;

/// A shareable source of cryptographically secure randomness.
///
/// Implementations must be safe to call from many threads at once.
pub trait RandomSource: Send + Sync {
    /// Fill `dest` with random bytes.
    ///
    /// # Errors
    /// Returns an error if the underlying generator fails (e.g. the system
    /// entropy source is unavailable).
    fn fill_bytes(&self, dest: &mut [u8]) -> Result<()>;

    /// Pick an index uniformly from `0..upper`.
    ///
    /// # Errors
    /// Returns an error when `upper` is zero.
    fn pick(&self, upper: usize) -> Result<usize>;
}

fn check_range(upper: usize) -> Result<()> {
    if upper == 0 {
        return Err(Error::crypto("pick", "cannot pick from an empty range"));
    }
    Ok(())
}

/// Operating system CSPRNG. Stateless, so every call is independent.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill_bytes(&self, dest: &mut [u8]) -> Result<()> {
        rand::rngs::OsRng.try_fill_bytes(dest).map_err(|e| {
            Error::crypto("fill_bytes", &format!("failed to fill secure bytes: {}", e))
        })
    }

    fn pick(&self, upper: usize) -> Result<usize> {
        check_range(upper)?;
        Ok(rand::rngs::OsRng.gen_range(0..upper))
    }
}

/// Deterministic ChaCha20 generator behind a mutex, for reproducible tests.
pub struct SeededRandom {
    rng: Mutex<ChaCha20Rng>,
}

impl SeededRandom {
    /// Create a generator from a 64-bit seed
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(ChaCha20Rng::seed_from_u64(seed)),
        }
    }

    /// Create a generator seeded from system entropy
    pub fn from_entropy() -> Self {
        Self {
            rng: Mutex::new(ChaCha20Rng::from_entropy()),
        }
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut ChaCha20Rng) -> T) -> T {
        // The RNG state stays valid even if a holder panicked.
        let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut rng)
    }
}

impl RandomSource for SeededRandom {
    fn fill_bytes(&self, dest: &mut [u8]) -> Result<()> {
        self.with_rng(|rng| rng.try_fill_bytes(dest)).map_err(|e| {
            Error::crypto("fill_bytes", &format!("failed to fill secure bytes: {}", e))
        })
    }

    fn pick(&self, upper: usize) -> Result<usize> {
        check_range(upper)?;
        Ok(self.with_rng(|rng| rng.gen_range(0..upper)))
    }
}

/// Trait for AEAD (Authenticated Encryption with Associated Data) operations.
///
/// **CRITICAL**: nonces must never be reused with the same key.
pub trait AEAD {
    /// Authentication tag size in bytes.
    const TAG_SIZE: usize;

    /// Encrypt plaintext with associated data. The tag is appended.
    ///
    /// # Errors
    /// Returns an error if the key or nonce size does not match the
    /// algorithm, or the encryption fails.
    fn encrypt(
        &self,
        key: &SecretKey,
        nonce: &[u8],
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>>;

    /// Decrypt ciphertext with associated data.
    ///
    /// # Errors
    /// Returns an error if authentication fails (ciphertext or AAD was
    /// tampered with, or the wrong key was used) or the sizes are invalid.
    fn decrypt(
        &self,
        key: &SecretKey,
        nonce: &[u8],
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>>;
}

/// Runtime-polymorphic AEAD adapter; the algorithm comes from the key.
pub struct RuntimeAead;

impl RuntimeAead {
    fn check_sizes(key: &SecretKey, nonce: &[u8]) -> Result<()> {
        let algorithm = key.algorithm();
        if key.expose_secret().len() != algorithm.key_size() {
            return Err(Error::crypto(
                "key_validation",
                &format!(
                    "invalid key size: expected {}, got {}",
                    algorithm.key_size(),
                    key.expose_secret().len()
                ),
            ));
        }
        if nonce.len() != algorithm.nonce_size() {
            return Err(Error::crypto(
                "nonce_validation",
                &format!(
                    "{:?} requires {}-byte nonce, got {}",
                    algorithm,
                    algorithm.nonce_size(),
                    nonce.len()
                ),
            ));
        }
        Ok(())
    }
}

impl AEAD for RuntimeAead {
    const TAG_SIZE: usize = 16;

    fn encrypt(
        &self,
        key: &SecretKey,
        nonce: &[u8],
        plaintext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>> {
        Self::check_sizes(key, nonce)?;
        let payload = Payload {
            msg: plaintext,
            aad: associated_data,
        };
        let result = match key.algorithm() {
            Algorithm::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new(ChaChaKey::from_slice(key.expose_secret()));
                cipher.encrypt(ChaChaNonce::from_slice(nonce), payload)
            }
            Algorithm::XChaCha20Poly1305 => {
                let cipher = XChaCha20Poly1305::new(ChaChaKey::from_slice(key.expose_secret()));
                cipher.encrypt(XNonce::from_slice(nonce), payload)
            }
            Algorithm::Aes256Gcm => {
                let cipher = Aes256Gcm::new(AesKey::from_slice(key.expose_secret()));
                cipher.encrypt(AesNonce::from_slice(nonce), payload)
            }
        };
        result.map_err(|e| {
            Error::crypto(
                "encrypt",
                &format!("{:?} encryption failed: {}", key.algorithm(), e),
            )
        })
    }

    fn decrypt(
        &self,
        key: &SecretKey,
        nonce: &[u8],
        ciphertext: &[u8],
        associated_data: &[u8],
    ) -> Result<Vec<u8>> {
        Self::check_sizes(key, nonce)?;
        let payload = Payload {
            msg: ciphertext,
            aad: associated_data,
        };
        let result = match key.algorithm() {
            Algorithm::ChaCha20Poly1305 => {
                let cipher = ChaCha20Poly1305::new(ChaChaKey::from_slice(key.expose_secret()));
                cipher.decrypt(ChaChaNonce::from_slice(nonce), payload)
            }
            Algorithm::XChaCha20Poly1305 => {
                let cipher = XChaCha20Poly1305::new(ChaChaKey::from_slice(key.expose_secret()));
                cipher.decrypt(XNonce::from_slice(nonce), payload)
            }
            Algorithm::Aes256Gcm => {
                let cipher = Aes256Gcm::new(AesKey::from_slice(key.expose_secret()));
                cipher.decrypt(AesNonce::from_slice(nonce), payload)
            }
        };
        result.map_err(|e| {
            Error::crypto(
                "decrypt",
                &format!("{:?} decryption failed: {}", key.algorithm(), e),
            )
        })
    }
}

/// Generate a fresh nonce of the size `algorithm` expects
pub fn generate_nonce(random: &dyn RandomSource, algorithm: Algorithm) -> Result<Vec<u8>> {
    let mut nonce = vec![0u8; algorithm.nonce_size()];
    random.fill_bytes(&mut nonce)?;
    Ok(nonce)
}
