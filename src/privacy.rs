//! Caller-facing protection of privacy data
//!
//! Protected payloads look like `"{index}{separator}{ciphertext}"`: the index
//! of the randomly chosen key ring record, the configured separator, and the
//! base64 ciphertext.

use crate::audit::{self, AuditEvent};
use crate::config::{is_valid_separator, ProtectionOptions, DEFAULT_KEY_SEPARATOR};
use crate::keyring::KeyRing;
use crate::protector::{SecurityTokenProtector, TokenProtector};
use crate::storage::{FileRecordStore, SealingKey};
use crate::{Error, Result};
use std::sync::Arc;
use tracing::debug;

/// Protects and unprotects whole strings
pub trait DataProtector: Send + Sync {
    /// Protect `data` under a randomly chosen record
    fn protect(&self, data: &str) -> Result<String>;

    /// Recover the data from a protected payload
    fn unprotect(&self, data: &str) -> Result<String>;
}

/// Facade combining index selection, protection, and the payload format
pub struct PrivacyDataProtector<P: TokenProtector = SecurityTokenProtector> {
    key_ring: Arc<KeyRing>,
    protector: P,
    separator: char,
}

impl PrivacyDataProtector<SecurityTokenProtector> {
    /// Protector over `key_ring` with the legacy scheme and `:` separator
    pub fn new(key_ring: Arc<KeyRing>) -> Self {
        let protector = SecurityTokenProtector::new(Arc::clone(&key_ring));
        Self::with_protector(key_ring, protector)
    }

    /// Wire a file-backed key ring and protector from `options`
    pub fn from_options(options: &ProtectionOptions, sealing: SealingKey) -> Result<Self> {
        options.validate()?;
        let store = Arc::new(FileRecordStore::new(options.key_ring_path(), sealing));
        let key_ring = Arc::new(KeyRing::from_options(options, store)?);
        let protector =
            SecurityTokenProtector::new(Arc::clone(&key_ring)).with_scheme(options.cipher_scheme);

        debug!(
            location = key_ring.location(),
            scheme = ?options.cipher_scheme,
            "privacy data protector configured"
        );
        Self::with_protector(key_ring, protector).with_separator(options.key_separator)
    }
}

impl<P: TokenProtector> PrivacyDataProtector<P> {
    /// Facade over an arbitrary token protector
    pub fn with_protector(key_ring: Arc<KeyRing>, protector: P) -> Self {
        Self {
            key_ring,
            protector,
            separator: DEFAULT_KEY_SEPARATOR,
        }
    }

    /// Use a different separator; it must match whoever unprotects
    ///
    /// # Errors
    /// [`Error::ConfigurationError`] if the separator can occur inside an
    /// index or a base64 ciphertext.
    pub fn with_separator(mut self, separator: char) -> Result<Self> {
        if !is_valid_separator(separator) {
            return Err(Error::config(format!(
                "key separator {:?} may occur inside an index or ciphertext",
                separator
            )));
        }
        self.separator = separator;
        Ok(self)
    }

    /// The separator placed between index and ciphertext
    pub fn separator(&self) -> char {
        self.separator
    }

    /// The key ring indexes are drawn from
    pub fn key_ring(&self) -> &Arc<KeyRing> {
        &self.key_ring
    }

    fn split<'a>(&self, data: &'a str) -> Result<(&'a str, &'a str)> {
        match data.split_once(self.separator) {
            Some((index, value)) if !index.is_empty() && !value.is_empty() => Ok((index, value)),
            _ => Err(Error::malformed("Malformed data")),
        }
    }
}

impl<P: TokenProtector> DataProtector for PrivacyDataProtector<P> {
    fn protect(&self, data: &str) -> Result<String> {
        let protected = self.key_ring.current_index().and_then(|current| {
            let ciphertext = self.protector.protect(&current, data)?;
            Ok((current, ciphertext))
        });
        let (current, ciphertext) = match protected {
            Ok(protected) => protected,
            Err(e) => {
                audit::record(
                    self.key_ring.audit_logger(),
                    AuditEvent::ErrorOccurred {
                        operation: "protect".to_string(),
                        error_type: e.code().to_string(),
                        message: e.to_string(),
                    },
                );
                return Err(e);
            }
        };

        audit::record(
            self.key_ring.audit_logger(),
            AuditEvent::DataProtected {
                index: current.clone(),
                data_size: data.len(),
            },
        );
        Ok(format!("{}{}{}", current, self.separator, ciphertext))
    }

    fn unprotect(&self, data: &str) -> Result<String> {
        let parts = self.split(data);
        let index = parts.as_ref().ok().map(|(index, _)| index.to_string());
        let result = parts.and_then(|(index, value)| self.protector.unprotect(index, value));

        audit::record(
            self.key_ring.audit_logger(),
            AuditEvent::DataUnprotected {
                index,
                success: result.is_ok(),
            },
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditLogger;
    use crate::config::CipherScheme;
    use crate::key::SecretKey;
    use crate::storage::MemoryRecordStore;
    use crate::{Algorithm, ErrorCode};
    use std::collections::HashSet;
    use std::sync::Mutex;
    use tempfile::tempdir;

    fn protector(key_count: usize) -> PrivacyDataProtector {
        let ring = KeyRing::new(Arc::new(MemoryRecordStore::new())).with_key_count(key_count);
        PrivacyDataProtector::new(Arc::new(ring))
    }

    #[test]
    fn test_scenario_three_keys() {
        let protector = protector(3);
        let protected = protector.protect("hello").unwrap();

        assert_eq!(protected.matches(':').count(), 1);
        let (index, _) = protected.split_once(':').unwrap();
        let all = protector.key_ring().all_indexes().unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().any(|i| i == index));

        assert_eq!(protector.unprotect(&protected).unwrap(), "hello");
    }

    #[test]
    fn test_protect_rotates_indexes() {
        let protector = protector(5);
        let used: HashSet<String> = (0..1000)
            .map(|_| {
                let protected = protector.protect("x").unwrap();
                protected.split_once(':').unwrap().0.to_string()
            })
            .collect();
        assert!(used.len() >= 2);
    }

    #[test]
    fn test_malformed_payloads() {
        let protector = protector(2);
        for bad in ["no-separator-here", ":ciphertext", "index:", ":", ""] {
            let err = protector.unprotect(bad).unwrap_err();
            assert_eq!(err.code(), ErrorCode::MalformedPayload, "input {bad:?}");
        }
    }

    #[test]
    fn test_foreign_index_is_rejected() {
        let protector = protector(2);
        let protected = protector.protect("secret").unwrap();
        let (_, ciphertext) = protected.split_once(':').unwrap();

        let forged = format!("{}:{}", "0".repeat(32), ciphertext);
        let err = protector.unprotect(&forged).unwrap_err();
        assert_eq!(err.code(), ErrorCode::KeyNotFound);
    }

    #[test]
    fn test_payload_from_unrelated_ring_is_rejected() {
        let ours = protector(2);
        let theirs = protector(2);
        let protected = theirs.protect("not yours").unwrap();
        assert!(ours.unprotect(&protected).unwrap_err().is_key_not_found());
    }

    #[test]
    fn test_custom_separator() {
        let protector = protector(2).with_separator('|').unwrap();
        let protected = protector.protect("hello").unwrap();
        assert!(!protected.contains(':'));
        assert_eq!(protected.matches('|').count(), 1);
        assert_eq!(protector.unprotect(&protected).unwrap(), "hello");
        assert!(protector.unprotect(&protected.replace('|', ":")).is_err());
    }

    #[test]
    fn test_separator_inside_index_alphabet_is_rejected() {
        for bad in ['a', 'F', '0', '9', '+', '/', '=', ' ', '\n'] {
            let err = protector(2).with_separator(bad).err().unwrap();
            assert_eq!(err.code(), ErrorCode::ConfigurationError, "separator {bad:?}");
        }

        for good in ['#', '|', '.', '$'] {
            let protector = protector(2).with_separator(good).unwrap();
            for i in 0..50 {
                let data = format!("value {}", i);
                let protected = protector.protect(&data).unwrap();
                assert_eq!(protector.unprotect(&protected).unwrap(), data);
            }
        }
    }

    #[test]
    fn test_failed_protect_is_audited() {
        let logger = Arc::new(Mutex::new(MemoryAuditLogger::new()));
        let ring = KeyRing::new(Arc::new(MemoryRecordStore::with_records(Vec::new())))
            .with_audit_logger(logger.clone());
        let protector = PrivacyDataProtector::new(Arc::new(ring));

        let err = protector.protect("hello").unwrap_err();
        assert_eq!(err.code(), ErrorCode::StorageFailure);

        let logger = logger.lock().unwrap();
        let failures = logger.count_event_type(|e| {
            matches!(e, AuditEvent::ErrorOccurred { operation, error_type, .. }
                if operation == "protect" && error_type == "STORAGE_FAILURE")
        });
        assert_eq!(failures, 1);
        assert_eq!(
            logger.count_event_type(|e| matches!(e, AuditEvent::DataProtected { .. })),
            0
        );
    }

    #[test]
    fn test_from_options_persists_and_reopens() {
        let temp_dir = tempdir().unwrap();
        let options = ProtectionOptions::default()
            .with_tokens_directory(temp_dir.path().join("tokens"))
            .with_key_count(4)
            .with_key_separator('#')
            .with_cipher_scheme(CipherScheme::Hkdf);
        let key = SecretKey::generate(Algorithm::XChaCha20Poly1305).unwrap();

        let first =
            PrivacyDataProtector::from_options(&options, SealingKey::Key(key.clone())).unwrap();
        let protected = first.protect("persisted").unwrap();
        assert!(options.key_ring_path().exists());
        assert_eq!(first.separator(), '#');

        // A second process with the same options and key reads it back
        let second = PrivacyDataProtector::from_options(&options, SealingKey::Key(key)).unwrap();
        assert_eq!(second.unprotect(&protected).unwrap(), "persisted");
        assert_eq!(
            first.key_ring().all_indexes().unwrap(),
            second.key_ring().all_indexes().unwrap()
        );
    }

    #[test]
    fn test_from_options_validates() {
        let options = ProtectionOptions::default().with_key_separator('=');
        let key = SecretKey::generate(Algorithm::XChaCha20Poly1305).unwrap();
        let err = PrivacyDataProtector::from_options(&options, SealingKey::Key(key)).err().unwrap();
        assert_eq!(err.code(), ErrorCode::ConfigurationError);
    }

    #[test]
    fn test_audit_trail() {
        let logger = Arc::new(Mutex::new(MemoryAuditLogger::new()));
        let ring = KeyRing::new(Arc::new(MemoryRecordStore::new()))
            .with_key_count(2)
            .with_audit_logger(logger.clone());
        let protector = PrivacyDataProtector::new(Arc::new(ring));

        let protected = protector.protect("hello").unwrap();
        protector.unprotect(&protected).unwrap();
        let _ = protector.unprotect("garbage");

        let logger = logger.lock().unwrap();
        let protected_events = logger
            .count_event_type(|e| matches!(e, AuditEvent::DataProtected { data_size: 5, .. }));
        assert_eq!(protected_events, 1);
        let unprotected = logger
            .count_event_type(|e| matches!(e, AuditEvent::DataUnprotected { success: true, .. }));
        assert_eq!(unprotected, 1);
        let rejected = logger.count_event_type(|e| {
            matches!(e, AuditEvent::DataUnprotected { index: None, success: false })
        });
        assert_eq!(rejected, 1);
        // no secrets in the trail
        let json = serde_json::to_string(logger.entries()).unwrap();
        assert!(!json.contains("hello"));
    }
}
