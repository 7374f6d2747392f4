//! Key material: sealing keys, key ring records, and key derivation

use crate::crypto::{OsRandom, RandomSource};
use crate::{Algorithm, AlgorithmIdentifier, Error, Result, IDENTIFIER_LEN};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::SystemTime;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A cryptographic key is automatically zeroed on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    /// The actual key material
    bytes: Vec<u8>,
    /// Algorithm this key is for
    #[zeroize(skip)]
    algorithm: Algorithm,
}

impl SecretKey {
    /// Create a new SecretKey from raw bytes
    ///
    /// # Errors
    /// Return error if the key doesn't match the algorithm
    pub fn from_bytes(bytes: Vec<u8>, algorithm: Algorithm) -> Result<Self> {
        if bytes.len() != algorithm.key_size() {
            return Err(Error::crypto(
                "key_validation",
                format!(
                    "invalid key size: expected {}, got {}",
                    algorithm.key_size(),
                    bytes.len()
                ),
            ));
        }

        Ok(Self { bytes, algorithm })
    }

    /// Generate a new random key for the given algorithm
    pub fn generate(algorithm: Algorithm) -> Result<Self> {
        Self::generate_with(&OsRandom, algorithm)
    }

    /// Generate a new key from an explicit random source
    pub fn generate_with(random: &dyn RandomSource, algorithm: Algorithm) -> Result<Self> {
        let mut buf = vec![0u8; algorithm.key_size()];
        random.fill_bytes(&mut buf)?;
        Self::from_bytes(buf, algorithm)
    }

    /// Get the algorithm for this key
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Expose the raw key material
    ///
    /// # Safety
    /// This exposes the raw key material. The caller is responsible
    /// for ensuring it doesn't leak
    pub fn expose_secret(&self) -> &[u8] {
        &self.bytes
    }

    /// Constant-time equality comparison
    pub fn ct_eq(&self, other: &Self) -> bool {
        if self.algorithm != other.algorithm {
            return false;
        }
        self.bytes.ct_eq(&other.bytes).into()
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretKey")
            .field("algorithm", &self.algorithm)
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// One rotation key of a key ring.
///
/// The `token` is the secret: the hex form of a random
/// [`AlgorithmIdentifier`]. The `index` is derived from the token with
/// SHA-256, so it can travel next to ciphertext without revealing the token,
/// and re-deriving from the same token always yields the same index.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct KeyRecord {
    index: String,
    token: String,
    #[zeroize(skip)]
    created_time: SystemTime,
}

impl KeyRecord {
    /// Generate a record around a fresh random token
    pub fn generate(random: &dyn RandomSource) -> Result<Self> {
        let token = AlgorithmIdentifier::generate_with(random)?.to_hex();
        Ok(Self {
            index: Self::derive_index(&token).to_hex(),
            token,
            created_time: SystemTime::now(),
        })
    }

    /// Rebuild a record from an existing token
    ///
    /// # Errors
    /// [`Error::InvalidFormat`] if the token is not an identifier.
    pub fn from_token(token: &str, created_time: SystemTime) -> Result<Self> {
        let identifier = AlgorithmIdentifier::parse(token)?;
        let token = identifier.to_hex();
        Ok(Self {
            index: Self::derive_index(&token).to_hex(),
            token,
            created_time,
        })
    }

    /// Index for a token: the first 16 bytes of its SHA-256 digest
    pub fn derive_index(token: &str) -> AlgorithmIdentifier {
        let digest = Sha256::digest(token.as_bytes());
        let mut bytes = [0u8; IDENTIFIER_LEN];
        bytes.copy_from_slice(&digest[..IDENTIFIER_LEN]);
        AlgorithmIdentifier::from_bytes(bytes)
    }

    /// Lookup key of this record
    pub fn index(&self) -> &str {
        &self.index
    }

    /// The serialized security token
    pub fn token(&self) -> &str {
        &self.token
    }

    /// When the record was generated
    pub fn created_time(&self) -> SystemTime {
        self.created_time
    }

    /// Parse the token back into its identifier
    ///
    /// # Errors
    /// [`Error::InvalidFormat`] if the token is empty or corrupt.
    pub fn identifier(&self) -> Result<AlgorithmIdentifier> {
        if self.token.is_empty() {
            return Err(Error::invalid_format("", "empty security token"));
        }
        AlgorithmIdentifier::parse(&self.token)
    }

    /// True when the token parses and still derives the stored index
    pub fn verify(&self) -> bool {
        match self.identifier() {
            Ok(_) => Self::derive_index(&self.token).to_hex() == self.index,
            Err(_) => false,
        }
    }
}

impl fmt::Debug for KeyRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyRecord")
            .field("index", &self.index)
            .field("token", &"[REDACTED]")
            .field("created_time", &self.created_time)
            .finish()
    }
}

/// Trait for the key derivation functions
pub trait KeyDerivation {
    /// Derive a key from the input material
    fn derive(&self, input: &[u8], salt: &[u8], info: &[u8]) -> Result<SecretKey>;
}

/// HKDF-SHA256 key derivation producing a key for `algorithm`
pub struct HkdfSha256 {
    algorithm: Algorithm,
}

impl HkdfSha256 {
    /// Create a derivation targeting the given algorithm
    pub const fn new(algorithm: Algorithm) -> Self {
        Self { algorithm }
    }
}

impl KeyDerivation for HkdfSha256 {
    fn derive(&self, input: &[u8], salt: &[u8], info: &[u8]) -> Result<SecretKey> {
        use hkdf::Hkdf;

        let hkdf = Hkdf::<Sha256>::new(Some(salt), input);
        let mut okm = vec![0u8; self.algorithm.key_size()];
        hkdf.expand(info, &mut okm)
            .map_err(|e| Error::crypto("hkdf_expand", format!("HKDF expansion failed: {}", e)))?;

        SecretKey::from_bytes(okm, self.algorithm)
    }
}
