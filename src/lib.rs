//! rust-keyring: a rotating security-token key ring and privacy data protector
//!
//! A [`keyring::KeyRing`] owns a batch of randomly generated security tokens,
//! persisted sealed at rest and lazily loaded behind a lock and a cache. The
//! [`privacy::PrivacyDataProtector`] picks a random record for every
//! `protect` call and embeds the record's index next to the ciphertext, so
//! data protected under any key in the ring remains readable.
//!
//! ```no_run
//! use rust_keyring::config::ProtectionOptions;
//! use rust_keyring::key::SecretKey;
//! use rust_keyring::privacy::{DataProtector, PrivacyDataProtector};
//! use rust_keyring::storage::SealingKey;
//! use rust_keyring::Algorithm;
//!
//! # fn main() -> rust_keyring::Result<()> {
//! let options = ProtectionOptions::default().with_tokens_directory("/var/lib/app/tokens");
//! let sealing = SealingKey::Key(SecretKey::generate(Algorithm::XChaCha20Poly1305)?);
//! let protector = PrivacyDataProtector::from_options(&options, sealing)?;
//!
//! let protected = protector.protect("alice@example.com")?;
//! assert_eq!(protector.unprotect(&protected)?, "alice@example.com");
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

pub mod audit;
pub mod config;
pub mod crypto;
pub mod error;
pub mod key;
pub mod keyring;
pub mod privacy;
pub mod protector;
pub mod storage;

pub use error::{Error, ErrorCode, Result};

use crate::crypto::{OsRandom, RandomSource};

/// Length in bytes of an [`AlgorithmIdentifier`].
pub const IDENTIFIER_LEN: usize = 16;

/// A 128-bit opaque identifier.
///
/// Used both as the payload of a security token and as the index of a key
/// ring record. The lowercase hex string is the canonical form: it is what
/// gets persisted and embedded in protected payloads, and two identifiers are
/// equal exactly when their canonical strings are.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AlgorithmIdentifier([u8; IDENTIFIER_LEN]);

impl AlgorithmIdentifier {
    /// Generates a new random identifier from the operating system CSPRNG.
    pub fn generate() -> Result<Self> {
        Self::generate_with(&OsRandom)
    }

    /// Generates a new random identifier from the given source.
    pub fn generate_with(random: &dyn RandomSource) -> Result<Self> {
        let mut bytes = [0u8; IDENTIFIER_LEN];
        random.fill_bytes(&mut bytes)?;
        Ok(Self(bytes))
    }

    /// Parse the hex form. Either case is accepted.
    ///
    /// # Errors
    /// [`Error::InvalidFormat`] if the input is not hex or does not decode
    /// to exactly 16 bytes.
    pub fn parse(input: &str) -> Result<Self> {
        let decoded = hex::decode(input)
            .map_err(|e| Error::invalid_format(input, format!("not a hex string: {e}")))?;
        let bytes: [u8; IDENTIFIER_LEN] = decoded.try_into().map_err(|v: Vec<u8>| {
            Error::invalid_format(
                input,
                format!("expected {IDENTIFIER_LEN} bytes, got {}", v.len()),
            )
        })?;
        Ok(Self(bytes))
    }

    /// Create an identifier from raw bytes.
    pub const fn from_bytes(bytes: [u8; IDENTIFIER_LEN]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub const fn as_bytes(&self) -> &[u8; IDENTIFIER_LEN] {
        &self.0
    }

    /// Canonical lowercase hex encoding.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for AlgorithmIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for AlgorithmIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AlgorithmIdentifier({})", self.to_hex())
    }
}

impl FromStr for AlgorithmIdentifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for AlgorithmIdentifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for AlgorithmIdentifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// AEAD algorithms available for sealing the key ring at rest
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    /// ChaCha20-Poly1305 AEAD
    ChaCha20Poly1305,
    /// XChaCha20-Poly1305 AEAD (extended nonce)
    XChaCha20Poly1305,
    /// AES-256-GCM AEAD
    Aes256Gcm,
}

impl Algorithm {
    /// Get the key size in bytes for the algorithm
    pub const fn key_size(&self) -> usize {
        32
    }

    /// Get the nonce size in bytes for the algorithm
    pub const fn nonce_size(&self) -> usize {
        match self {
            Self::XChaCha20Poly1305 => 24,
            Self::ChaCha20Poly1305 | Self::Aes256Gcm => 12,
        }
    }
}
