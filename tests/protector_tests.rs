//! End-to-end behavior of the privacy data protector over a file-backed key ring

use rust_keyring::config::{CipherScheme, ProtectionOptions};
use rust_keyring::key::SecretKey;
use rust_keyring::keyring::KeyRing;
use rust_keyring::privacy::{DataProtector, PrivacyDataProtector};
use rust_keyring::protector::{SecurityTokenProtector, TokenProtector};
use rust_keyring::storage::{FileRecordStore, PassphraseParams, SealingKey};
use rust_keyring::{Algorithm, ErrorCode};
use std::collections::HashSet;
use std::sync::Arc;
use tempfile::tempdir;
use zeroize::Zeroizing;

fn options(dir: &std::path::Path) -> ProtectionOptions {
    ProtectionOptions::default()
        .with_tokens_directory(dir)
        .with_key_count(6)
}

#[test]
fn test_round_trip_many_inputs() {
    let temp_dir = tempdir().unwrap();
    let key = SecretKey::generate(Algorithm::XChaCha20Poly1305).unwrap();
    let options = options(temp_dir.path());
    let protector = PrivacyDataProtector::from_options(&options, SealingKey::Key(key)).unwrap();

    let inputs = [
        "hello",
        "alice@example.com",
        "+1 (555) 010-0199",
        "contains:the:separator",
        "línea con acentos",
        "\u{1F512} locked",
        " ",
    ];
    for input in inputs {
        let protected = protector.protect(input).unwrap();
        assert_eq!(protector.unprotect(&protected).unwrap(), input);
    }
}

#[test]
fn test_old_payloads_survive_restart() {
    let temp_dir = tempdir().unwrap();
    let options = options(temp_dir.path());
    let key = SecretKey::generate(Algorithm::Aes256Gcm).unwrap();

    let payloads: Vec<String> = {
        let protector =
            PrivacyDataProtector::from_options(&options, SealingKey::Key(key.clone())).unwrap();
        (0..50).map(|i| protector.protect(&format!("record {}", i)).unwrap()).collect()
    };

    let restarted = PrivacyDataProtector::from_options(&options, SealingKey::Key(key)).unwrap();
    for (i, payload) in payloads.iter().enumerate() {
        assert_eq!(restarted.unprotect(payload).unwrap(), format!("record {}", i));
    }

    let used: HashSet<&str> = payloads.iter().map(|p| p.split_once(':').unwrap().0).collect();
    assert!(used.len() >= 2);
}

#[test]
fn test_legacy_ciphertext_is_stable_per_index() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("ring.keyring");
    let key = SecretKey::generate(Algorithm::XChaCha20Poly1305).unwrap();
    let ring = Arc::new(
        KeyRing::new(Arc::new(FileRecordStore::new(&path, SealingKey::Key(key)))).with_key_count(3),
    );
    let protector = SecurityTokenProtector::new(Arc::clone(&ring));

    for index in ring.all_indexes().unwrap() {
        let a = protector.protect(&index, "same input").unwrap();
        let b = protector.protect(&index, "same input").unwrap();
        assert_eq!(a, b);
    }
}

#[test]
fn test_scheme_upgrade_keeps_old_data_readable() {
    let temp_dir = tempdir().unwrap();
    let legacy_options = options(temp_dir.path());
    let upgraded_options = legacy_options.clone().with_cipher_scheme(CipherScheme::Hkdf);
    let key = SecretKey::generate(Algorithm::XChaCha20Poly1305).unwrap();

    let legacy =
        PrivacyDataProtector::from_options(&legacy_options, SealingKey::Key(key.clone())).unwrap();
    let old = legacy.protect("before").unwrap();

    let upgraded =
        PrivacyDataProtector::from_options(&upgraded_options, SealingKey::Key(key)).unwrap();
    let new = upgraded.protect("after").unwrap();

    assert_eq!(upgraded.unprotect(&old).unwrap(), "before");
    assert_eq!(upgraded.unprotect(&new).unwrap(), "after");
}

#[test]
fn test_wrong_sealing_key_cannot_open_ring() {
    let temp_dir = tempdir().unwrap();
    let options = options(temp_dir.path());

    let owner = PrivacyDataProtector::from_options(
        &options,
        SealingKey::Key(SecretKey::generate(Algorithm::XChaCha20Poly1305).unwrap()),
    )
    .unwrap();
    let protected = owner.protect("hello").unwrap();

    let intruder = PrivacyDataProtector::from_options(
        &options,
        SealingKey::Key(SecretKey::generate(Algorithm::XChaCha20Poly1305).unwrap()),
    )
    .unwrap();
    let err = intruder.unprotect(&protected).unwrap_err();
    assert_eq!(err.code(), ErrorCode::AuthenticationFailure);
}

#[test]
fn test_passphrase_sealed_ring() {
    let temp_dir = tempdir().unwrap();
    let path = temp_dir.path().join("ring.keyring");
    let sealing = || SealingKey::Passphrase {
        passphrase: Zeroizing::new(b"tokens passphrase".to_vec()),
        params: PassphraseParams {
            memory_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        },
    };

    let first = PrivacyDataProtector::new(Arc::new(
        KeyRing::new(Arc::new(FileRecordStore::new(&path, sealing()))).with_key_count(2),
    ));
    let protected = first.protect("sealed with a passphrase").unwrap();

    let second = PrivacyDataProtector::new(Arc::new(
        KeyRing::new(Arc::new(FileRecordStore::new(&path, sealing()))).with_key_count(2),
    ));
    assert_eq!(second.unprotect(&protected).unwrap(), "sealed with a passphrase");
}

#[test]
fn test_error_kinds_at_the_boundary() {
    let temp_dir = tempdir().unwrap();
    let key = SecretKey::generate(Algorithm::XChaCha20Poly1305).unwrap();
    let options = options(temp_dir.path());
    let protector = PrivacyDataProtector::from_options(&options, SealingKey::Key(key)).unwrap();

    assert_eq!(
        protector.unprotect("no-separator-here").unwrap_err().code(),
        ErrorCode::MalformedPayload
    );

    let protected = protector.protect("hello").unwrap();
    let (index, ciphertext) = protected.split_once(':').unwrap();

    let foreign = format!("{}:{}", "1".repeat(32), ciphertext);
    assert_eq!(
        protector.unprotect(&foreign).unwrap_err().code(),
        ErrorCode::KeyNotFound
    );

    let not_base64 = format!("{}:{}", index, "%%%");
    assert_eq!(
        protector.unprotect(&not_base64).unwrap_err().code(),
        ErrorCode::MalformedPayload
    );
}
