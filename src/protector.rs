//! Symmetric protection keyed by key ring records
//!
//! The [`CipherScheme::Legacy`] scheme derives both the AES key and the IV
//! from the 16 identifier bytes (`key = id ++ reverse(id)`,
//! `iv = reverse(id)`). That layout is kept so existing payloads stay
//! readable; it is not a proper KDF, and the same plaintext under the same
//! record always encrypts to the same ciphertext. [`CipherScheme::Hkdf`] is
//! the upgrade: an HKDF-derived key with AES-256-GCM and a random nonce. It
//! still reads legacy payloads, so a deployment can switch schemes without
//! re-encrypting stored data first.
//!
//! Legacy payloads are always whole AES blocks. HKDF payloads never are: one
//! that would end on a block boundary gets a trailing zero byte and the
//! padded tag. The payload length alone therefore selects the decryption
//! path, and a damaged HKDF payload is never retried as CBC.

use crate::config::CipherScheme;
use crate::crypto::{generate_nonce, OsRandom, RandomSource, RuntimeAead, AEAD};
use crate::key::{HkdfSha256, KeyDerivation};
use crate::keyring::KeyRing;
use crate::{Algorithm, AlgorithmIdentifier, Error, Result, IDENTIFIER_LEN};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::sync::Arc;
use tracing::debug;
use zeroize::{Zeroize, ZeroizeOnDrop};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// First byte of an HKDF-scheme payload
const HKDF_PAYLOAD_TAG: u8 = 0x02;
/// First byte of an HKDF-scheme payload carrying one trailing zero byte
const HKDF_PADDED_PAYLOAD_TAG: u8 = 0x03;
const AES_BLOCK_SIZE: usize = 16;
const HKDF_SALT: &[u8] = b"rust-keyring/payload/v2";
const HKDF_INFO: &[u8] = b"privacy-data-protector";
const HKDF_ALGORITHM: Algorithm = Algorithm::Aes256Gcm;

/// Key and IV for the legacy scheme
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CipherParams {
    key: [u8; 2 * IDENTIFIER_LEN],
    iv: [u8; IDENTIFIER_LEN],
}

impl CipherParams {
    /// `key = bytes ++ reverse(bytes)`, `iv = reverse(bytes)`
    pub fn derive(identifier: &AlgorithmIdentifier) -> Self {
        let bytes = identifier.as_bytes();
        let mut iv = *bytes;
        iv.reverse();

        let mut key = [0u8; 2 * IDENTIFIER_LEN];
        key[..IDENTIFIER_LEN].copy_from_slice(bytes);
        key[IDENTIFIER_LEN..].copy_from_slice(&iv);

        Self { key, iv }
    }

    /// AES-256 key
    pub fn key(&self) -> &[u8; 2 * IDENTIFIER_LEN] {
        &self.key
    }

    /// CBC initialization vector
    pub fn iv(&self) -> &[u8; IDENTIFIER_LEN] {
        &self.iv
    }

    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256CbcEnc::new_from_slices(&self.key, &self.iv)
            .map_err(|e| Error::crypto("encrypt", format!("AES-256-CBC setup failed: {}", e)))?;
        Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256CbcDec::new_from_slices(&self.key, &self.iv)
            .map_err(|e| Error::crypto("decrypt", format!("AES-256-CBC setup failed: {}", e)))?;
        cipher.decrypt_padded_vec_mut::<Pkcs7>(ciphertext).map_err(|_| {
            Error::crypto("decrypt", "AES-256-CBC decryption failed: bad length or padding")
        })
    }
}

/// Encrypts and decrypts under the record a key ring index names
pub trait TokenProtector: Send + Sync {
    /// Encrypt `plaintext` under the record `index`, returning base64
    fn protect(&self, index: &str, plaintext: &str) -> Result<String>;

    /// Decrypt base64 `ciphertext` produced under the record `index`
    fn unprotect(&self, index: &str, ciphertext: &str) -> Result<String>;
}

/// [`TokenProtector`] backed by a [`KeyRing`]
pub struct SecurityTokenProtector {
    key_ring: Arc<KeyRing>,
    scheme: CipherScheme,
    random: Arc<dyn RandomSource>,
}

impl SecurityTokenProtector {
    /// Legacy-scheme protector over `key_ring`
    pub fn new(key_ring: Arc<KeyRing>) -> Self {
        Self {
            key_ring,
            scheme: CipherScheme::Legacy,
            random: Arc::new(OsRandom),
        }
    }

    /// Select the cipher scheme for new payloads
    pub fn with_scheme(mut self, scheme: CipherScheme) -> Self {
        self.scheme = scheme;
        self
    }

    /// Random source for HKDF-scheme nonces
    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    /// The key ring records are resolved from
    pub fn key_ring(&self) -> &Arc<KeyRing> {
        &self.key_ring
    }

    /// The active cipher scheme
    pub fn scheme(&self) -> CipherScheme {
        self.scheme
    }

    fn hkdf_encrypt(&self, identifier: &AlgorithmIdentifier, plaintext: &[u8]) -> Result<Vec<u8>> {
        let key = HkdfSha256::new(HKDF_ALGORITHM).derive(
            identifier.as_bytes(),
            HKDF_SALT,
            HKDF_INFO,
        )?;
        let nonce = generate_nonce(self.random.as_ref(), HKDF_ALGORITHM)?;

        let unpadded_len = 1 + nonce.len() + plaintext.len() + RuntimeAead::TAG_SIZE;
        let padded = unpadded_len % AES_BLOCK_SIZE == 0;
        let tag = if padded {
            HKDF_PADDED_PAYLOAD_TAG
        } else {
            HKDF_PAYLOAD_TAG
        };
        let ciphertext = RuntimeAead.encrypt(&key, &nonce, plaintext, &[tag])?;

        let mut out = Vec::with_capacity(unpadded_len + usize::from(padded));
        out.push(tag);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        if padded {
            out.push(0);
        }
        Ok(out)
    }

    fn hkdf_decrypt(identifier: &AlgorithmIdentifier, payload: &[u8]) -> Result<Vec<u8>> {
        let (tag, body) = match payload.split_first() {
            Some((&HKDF_PAYLOAD_TAG, body)) => (HKDF_PAYLOAD_TAG, body),
            Some((&HKDF_PADDED_PAYLOAD_TAG, rest)) => match rest.split_last() {
                Some((&0, body)) => (HKDF_PADDED_PAYLOAD_TAG, body),
                _ => return Err(Error::crypto("unprotect", "invalid HKDF payload filler")),
            },
            _ => return Err(Error::crypto("unprotect", "unknown payload tag")),
        };

        let nonce_size = HKDF_ALGORITHM.nonce_size();
        if body.len() < nonce_size + RuntimeAead::TAG_SIZE {
            return Err(Error::crypto("unprotect", "HKDF payload is truncated"));
        }
        let (nonce, ciphertext) = body.split_at(nonce_size);
        let key = HkdfSha256::new(HKDF_ALGORITHM).derive(
            identifier.as_bytes(),
            HKDF_SALT,
            HKDF_INFO,
        )?;
        RuntimeAead.decrypt(&key, nonce, ciphertext, &[tag])
    }
}

impl TokenProtector for SecurityTokenProtector {
    fn protect(&self, index: &str, plaintext: &str) -> Result<String> {
        let identifier = self.key_ring.identifier(index)?;
        let plaintext = plaintext.as_bytes();
        let ciphertext = match self.scheme {
            CipherScheme::Legacy => CipherParams::derive(&identifier).encrypt(plaintext)?,
            CipherScheme::Hkdf => self.hkdf_encrypt(&identifier, plaintext)?,
        };
        Ok(STANDARD.encode(ciphertext))
    }

    fn unprotect(&self, index: &str, ciphertext: &str) -> Result<String> {
        let identifier = self.key_ring.identifier(index)?;
        let payload = STANDARD
            .decode(ciphertext)
            .map_err(|e| Error::malformed(format!("ciphertext is not base64: {}", e)))?;

        let plaintext = match self.scheme {
            CipherScheme::Hkdf if payload.len() % AES_BLOCK_SIZE != 0 => {
                Self::hkdf_decrypt(&identifier, &payload)?
            }
            CipherScheme::Hkdf => {
                debug!(index, "block-aligned payload, reading it as legacy");
                CipherParams::derive(&identifier).decrypt(&payload)?
            }
            CipherScheme::Legacy => CipherParams::derive(&identifier).decrypt(&payload)?,
        };

        String::from_utf8(plaintext).map_err(|_| {
            Error::crypto_with_index("unprotect", "decrypted payload is not valid UTF-8", index)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::SeededRandom;
    use crate::storage::MemoryRecordStore;
    use crate::ErrorCode;

    fn key_ring(key_count: usize) -> Arc<KeyRing> {
        Arc::new(
            KeyRing::new(Arc::new(MemoryRecordStore::new()))
                .with_key_count(key_count)
                .with_random(Arc::new(SeededRandom::new(17))),
        )
    }

    #[test]
    fn test_legacy_params_layout() {
        let mut bytes = [0u8; 16];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        let params = CipherParams::derive(&AlgorithmIdentifier::from_bytes(bytes));

        let reversed: Vec<u8> = (0..16u8).rev().collect();
        assert_eq!(&params.key()[..16], &bytes);
        assert_eq!(&params.key()[16..], reversed.as_slice());
        assert_eq!(params.iv().as_slice(), reversed.as_slice());
        // The IV is the second half of the key
        assert_eq!(&params.key()[16..], params.iv());
    }

    #[test]
    fn test_legacy_round_trip_and_determinism() {
        let ring = key_ring(2);
        let protector = SecurityTokenProtector::new(ring.clone());
        let indexes = ring.all_indexes().unwrap();

        let a = protector.protect(&indexes[0], "hello").unwrap();
        let b = protector.protect(&indexes[0], "hello").unwrap();
        assert_eq!(a, b);
        // one AES block, base64-padded
        assert_eq!(a.len(), 24);
        assert_eq!(protector.unprotect(&indexes[0], &a).unwrap(), "hello");

        let other = protector.protect(&indexes[1], "hello").unwrap();
        assert_ne!(a, other);
    }

    #[test]
    fn test_edge_plaintexts_round_trip() {
        let ring = key_ring(1);
        let index = ring.current_index().unwrap();
        let long = "x".repeat(4096);
        for scheme in [CipherScheme::Legacy, CipherScheme::Hkdf] {
            let protector = SecurityTokenProtector::new(ring.clone()).with_scheme(scheme);
            let plaintexts = [
                "",
                "a",
                "exactly sixteen!",
                "naïve café ✓ 个人信息",
                long.as_str(),
            ];
            for plaintext in plaintexts {
                let ciphertext = protector.protect(&index, plaintext).unwrap();
                assert_eq!(protector.unprotect(&index, &ciphertext).unwrap(), plaintext);
            }
        }
    }

    #[test]
    fn test_unknown_index_is_key_not_found() {
        let ring = key_ring(2);
        let protector = SecurityTokenProtector::new(ring.clone());
        let foreign = "ff".repeat(16);

        let err = protector.protect(&foreign, "hello").unwrap_err();
        assert_eq!(err.code(), ErrorCode::KeyNotFound);

        let index = ring.current_index().unwrap();
        let ciphertext = protector.protect(&index, "hello").unwrap();
        let err = protector.unprotect(&foreign, &ciphertext).unwrap_err();
        assert_eq!(err.code(), ErrorCode::KeyNotFound);
    }

    #[test]
    fn test_non_base64_ciphertext_is_malformed() {
        let ring = key_ring(1);
        let protector = SecurityTokenProtector::new(ring.clone());
        let index = ring.current_index().unwrap();
        let err = protector.unprotect(&index, "not*base64!").unwrap_err();
        assert_eq!(err.code(), ErrorCode::MalformedPayload);
    }

    #[test]
    fn test_truncated_legacy_ciphertext_fails() {
        let ring = key_ring(1);
        let protector = SecurityTokenProtector::new(ring.clone());
        let index = ring.current_index().unwrap();
        // 5 bytes is not a whole AES block
        let truncated = STANDARD.encode([1u8, 2, 3, 4, 5]);
        let err = protector.unprotect(&index, &truncated).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CryptoFailure);
    }

    #[test]
    fn test_hkdf_scheme_is_randomized() {
        let ring = key_ring(1);
        let protector =
            SecurityTokenProtector::new(ring.clone()).with_scheme(CipherScheme::Hkdf);
        let index = ring.current_index().unwrap();

        let a = protector.protect(&index, "hello").unwrap();
        let b = protector.protect(&index, "hello").unwrap();
        assert_ne!(a, b);
        assert_eq!(protector.unprotect(&index, &a).unwrap(), "hello");
        assert_eq!(protector.unprotect(&index, &b).unwrap(), "hello");
    }

    #[test]
    fn test_hkdf_scheme_reads_legacy_payloads() {
        let ring = key_ring(3);
        let legacy = SecurityTokenProtector::new(ring.clone());
        let upgraded =
            SecurityTokenProtector::new(ring.clone()).with_scheme(CipherScheme::Hkdf);

        for index in ring.all_indexes().unwrap() {
            let old = legacy.protect(&index, "stored before the upgrade").unwrap();
            assert_eq!(
                upgraded.unprotect(&index, &old).unwrap(),
                "stored before the upgrade"
            );
        }
    }

    #[test]
    fn test_legacy_scheme_rejects_hkdf_payloads() {
        let ring = key_ring(1);
        let index = ring.current_index().unwrap();
        let upgraded =
            SecurityTokenProtector::new(ring.clone()).with_scheme(CipherScheme::Hkdf);
        let legacy = SecurityTokenProtector::new(ring.clone());

        // 1 + 12 + 5 + 16 = 34 bytes, never a whole number of AES blocks
        let payload = upgraded.protect(&index, "hello").unwrap();
        assert!(legacy.unprotect(&index, &payload).is_err());
    }

    #[test]
    fn test_tampered_hkdf_payload_fails() {
        let ring = key_ring(1);
        let index = ring.current_index().unwrap();
        let protector =
            SecurityTokenProtector::new(ring.clone()).with_scheme(CipherScheme::Hkdf);

        let ciphertext = protector.protect(&index, "hello").unwrap();
        let mut payload = STANDARD.decode(ciphertext).unwrap();
        let last = payload.len() - 1;
        payload[last] ^= 0x01;

        let err = protector.unprotect(&index, &STANDARD.encode(&payload)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::CryptoFailure);
    }

    #[test]
    fn test_hkdf_payloads_never_end_on_a_block_boundary() {
        let ring = key_ring(1);
        let index = ring.current_index().unwrap();
        let protector = SecurityTokenProtector::new(ring.clone())
            .with_scheme(CipherScheme::Hkdf)
            .with_random(Arc::new(SeededRandom::new(5)));

        for len in 0..64 {
            let plaintext = "p".repeat(len);
            let ciphertext = protector.protect(&index, &plaintext).unwrap();
            let payload = STANDARD.decode(&ciphertext).unwrap();

            assert_ne!(payload.len() % AES_BLOCK_SIZE, 0, "plaintext length {len}");
            let padded = payload[0] == HKDF_PADDED_PAYLOAD_TAG;
            assert_eq!(padded, (29 + len) % AES_BLOCK_SIZE == 0);
            assert_eq!(protector.unprotect(&index, &ciphertext).unwrap(), plaintext);
        }
    }

    #[test]
    fn test_damaged_hkdf_payload_is_never_read_as_legacy() {
        let ring = key_ring(1);
        let index = ring.current_index().unwrap();
        let protector = SecurityTokenProtector::new(ring.clone())
            .with_scheme(CipherScheme::Hkdf)
            .with_random(Arc::new(SeededRandom::new(6)));

        for len in 0..48 {
            let payload = STANDARD
                .decode(protector.protect(&index, &"d".repeat(len)).unwrap())
                .unwrap();

            for position in [0, 1, payload.len() / 2, payload.len() - 1] {
                let mut damaged = payload.clone();
                damaged[position] ^= 0x01;
                let err = protector
                    .unprotect(&index, &STANDARD.encode(&damaged))
                    .unwrap_err();
                assert_eq!(
                    err.code(),
                    ErrorCode::CryptoFailure,
                    "length {len}, byte {position}"
                );
            }
        }
    }
}
