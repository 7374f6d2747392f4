//! Storage backend traits and implementations
//!
//! A key ring is persisted as one sealed file: a JSON envelope whose
//! `ciphertext` is the AEAD-encrypted JSON list of [`KeyRecord`]s.

use crate::crypto::{generate_nonce, OsRandom, RandomSource, RuntimeAead, AEAD};
use crate::key::{KeyRecord, SecretKey};
use crate::{Algorithm, Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use zeroize::Zeroizing;

/// Current version of the sealed key ring format
pub const KEY_RING_FORMAT_VERSION: u32 = 1;

/// Associated data bound into every sealed key ring
const KEY_RING_AAD: &[u8] = b"rust-keyring/key-ring/v1";

/// Result of persisting a freshly generated record set
#[derive(Debug)]
pub enum PersistOutcome {
    /// Our records are now the persisted set
    Written,
    /// Somebody else created the store first; these are their records
    AlreadyPresent(Vec<KeyRecord>),
}

/// Trait for key ring storage backends
pub trait RecordStore: Send + Sync {
    /// Load the persisted record set, `None` if nothing was persisted yet
    fn load(&self) -> Result<Option<Vec<KeyRecord>>>;

    /// Persist a new record set unless one already exists.
    ///
    /// Never overwrites: if the store was populated concurrently the
    /// existing records are returned instead.
    fn persist_new(&self, records: &[KeyRecord]) -> Result<PersistOutcome>;

    /// Get the storage location/path
    fn location(&self) -> &str;
}

/// Argon2id parameters for passphrase sealing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassphraseParams {
    /// Memory size in KiB (default: 64 MiB = 65536 KiB)
    pub memory_kib: u32,
    /// Number of iterations (default: 4)
    pub time_cost: u32,
    /// Degree of parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for PassphraseParams {
    fn default() -> Self {
        Self {
            memory_kib: 65536,
            time_cost: 4,
            parallelism: 4,
        }
    }
}

/// What the key ring file is sealed with
pub enum SealingKey {
    /// A raw 32-byte key
    Key(SecretKey),
    /// A passphrase stretched with Argon2id; salt and parameters live in the file
    Passphrase {
        /// The passphrase bytes
        passphrase: Zeroizing<Vec<u8>>,
        /// Cost parameters used when sealing a new file
        params: PassphraseParams,
    },
}

impl SealingKey {
    /// Passphrase sealing with default Argon2id costs
    pub fn passphrase(passphrase: impl Into<Vec<u8>>) -> Self {
        Self::Passphrase {
            passphrase: Zeroizing::new(passphrase.into()),
            params: PassphraseParams::default(),
        }
    }
}

/// Salt and cost recorded for passphrase-sealed files
#[derive(Debug, Clone, Serialize, Deserialize)]
struct KdfRecord {
    salt: Vec<u8>,
    params: PassphraseParams,
}

/// On-disk envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SealedKeyRing {
    format_version: u32,
    algorithm: Algorithm,
    kdf: Option<KdfRecord>,
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
}

fn derive_passphrase_key(
    passphrase: &[u8],
    salt: &[u8],
    params: &PassphraseParams,
    algorithm: Algorithm,
) -> Result<SecretKey> {
    use argon2::{Algorithm as Argon2Algorithm, Argon2, Params, Version};

    let argon2_params = Params::new(
        params.memory_kib,
        params.time_cost,
        params.parallelism,
        Some(algorithm.key_size()),
    )
    .map_err(|e| Error::crypto("derive_sealing_key", format!("Argon2 error: {}", e)))?;

    let argon2 = Argon2::new(Argon2Algorithm::Argon2id, Version::V0x13, argon2_params);
    let mut derived = Zeroizing::new(vec![0u8; algorithm.key_size()]);
    argon2
        .hash_password_into(passphrase, salt, &mut derived)
        .map_err(|e| Error::crypto("derive_sealing_key", format!("Argon2 error: {}", e)))?;

    SecretKey::from_bytes(derived.to_vec(), algorithm)
}

/// File-backed record store, sealed with an AEAD at rest
pub struct FileRecordStore {
    path: PathBuf,
    location: String,
    sealing: SealingKey,
    algorithm: Algorithm,
    random: Arc<dyn RandomSource>,
}

impl FileRecordStore {
    /// Create a store for the file at `path`. Nothing is read or written yet.
    pub fn new<P: AsRef<Path>>(path: P, sealing: SealingKey) -> Self {
        let path = path.as_ref().to_path_buf();
        Self {
            location: path.display().to_string(),
            path,
            sealing,
            algorithm: Algorithm::XChaCha20Poly1305,
            random: Arc::new(OsRandom),
        }
    }

    /// Choose the AEAD used when sealing a new file
    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Use a specific random source for salts and nonces
    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    /// Path of the key ring file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sealing_key_for(&self, algorithm: Algorithm, kdf: Option<&KdfRecord>) -> Result<SecretKey> {
        match (&self.sealing, kdf) {
            (SealingKey::Key(key), None) => {
                if key.algorithm() == algorithm {
                    Ok(key.clone())
                } else {
                    SecretKey::from_bytes(key.expose_secret().to_vec(), algorithm)
                }
            }
            (SealingKey::Passphrase { passphrase, .. }, Some(kdf)) => {
                derive_passphrase_key(passphrase, &kdf.salt, &kdf.params, algorithm)
            }
            (SealingKey::Key(_), Some(_)) => Err(Error::AuthenticationFailed {
                reason: format!("{} is sealed with a passphrase", self.location),
            }),
            (SealingKey::Passphrase { .. }, None) => Err(Error::AuthenticationFailed {
                reason: format!("{} is sealed with a raw key", self.location),
            }),
        }
    }

    fn seal(&self, records: &[KeyRecord]) -> Result<Vec<u8>> {
        let plaintext = Zeroizing::new(
            serde_json::to_vec(records)
                .map_err(|e| Error::serialization("serialize_key_ring", e.to_string()))?,
        );

        let kdf = match &self.sealing {
            SealingKey::Key(_) => None,
            SealingKey::Passphrase { params, .. } => {
                let mut salt = vec![0u8; 32];
                self.random.fill_bytes(&mut salt)?;
                Some(KdfRecord {
                    salt,
                    params: params.clone(),
                })
            }
        };

        let key = self.sealing_key_for(self.algorithm, kdf.as_ref())?;
        let nonce = generate_nonce(self.random.as_ref(), self.algorithm)?;
        let ciphertext = RuntimeAead.encrypt(&key, &nonce, &plaintext, KEY_RING_AAD)?;

        let sealed = SealedKeyRing {
            format_version: KEY_RING_FORMAT_VERSION,
            algorithm: self.algorithm,
            kdf,
            nonce,
            ciphertext,
        };
        serde_json::to_vec_pretty(&sealed)
            .map_err(|e| Error::serialization("serialize_key_ring", e.to_string()))
    }

    fn open(&self, data: &[u8]) -> Result<Vec<KeyRecord>> {
        let sealed: SealedKeyRing = serde_json::from_slice(data)
            .map_err(|e| Error::serialization("deserialize_key_ring", e.to_string()))?;

        if sealed.format_version != KEY_RING_FORMAT_VERSION {
            return Err(Error::storage_with_path(
                "open_key_ring",
                format!("unsupported format version {}", sealed.format_version),
                self.location.clone(),
            ));
        }

        let key = self.sealing_key_for(sealed.algorithm, sealed.kdf.as_ref())?;
        let plaintext = RuntimeAead
            .decrypt(&key, &sealed.nonce, &sealed.ciphertext, KEY_RING_AAD)
            .map(Zeroizing::new)
            .map_err(|_| Error::AuthenticationFailed {
                reason: format!("{} does not open with the configured sealing key", self.location),
            })?;

        serde_json::from_slice(&plaintext)
            .map_err(|e| Error::serialization("deserialize_key_ring", e.to_string()))
    }

    fn temp_path(&self) -> Result<PathBuf> {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let mut tag = [0u8; 8];
        self.random.fill_bytes(&mut tag)?;
        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "keyring".to_string());
        Ok(self.path.with_file_name(format!(
            ".{}.{}.{}.{}.tmp",
            file_name,
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed),
            hex::encode(tag)
        )))
    }

    fn write_temp(&self, temp: &Path, data: &[u8]) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(temp)
            .map_err(|e| Error::io("create_key_ring_temp", e))?;
        file.write_all(data)
            .map_err(|e| Error::io("write_key_ring", e))?;
        file.sync_all().map_err(|e| Error::io("sync_key_ring", e))
    }
}

impl RecordStore for FileRecordStore {
    fn load(&self) -> Result<Option<Vec<KeyRecord>>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io("read_key_ring", e)),
        };
        self.open(&data).map(Some)
    }

    fn persist_new(&self, records: &[KeyRecord]) -> Result<PersistOutcome> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| Error::io("create_tokens_directory", e))?;
            }
        }

        let sealed = self.seal(records)?;
        let temp = self.temp_path()?;
        if let Err(e) = self.write_temp(&temp, &sealed) {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }

        // A hard link cannot replace an existing file, so of several
        // processes racing to create the ring exactly one wins.
        let linked = fs::hard_link(&temp, &self.path);
        let outcome = match linked {
            Ok(()) => Ok(PersistOutcome::Written),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(location = %self.location, "key ring created concurrently, adopting it");
                match self.load() {
                    Ok(Some(existing)) => Ok(PersistOutcome::AlreadyPresent(existing)),
                    Ok(None) => Err(Error::storage_with_path(
                        "persist_key_ring",
                        "key ring vanished after a creation race",
                        self.location.as_str(),
                    )),
                    Err(e) => Err(e),
                }
            }
            Err(e) => {
                warn!(
                    location = %self.location,
                    error = %e,
                    "hard link unavailable, falling back to rename"
                );
                return fs::rename(&temp, &self.path)
                    .map(|_| PersistOutcome::Written)
                    .map_err(|e| {
                        let _ = fs::remove_file(&temp);
                        Error::io("persist_key_ring", e)
                    });
            }
        };

        let _ = fs::remove_file(&temp);
        outcome
    }

    fn location(&self) -> &str {
        &self.location
    }
}

/// In-memory record store (for testing/ephemeral rings)
pub struct MemoryRecordStore {
    location: String,
    records: Mutex<Option<Vec<KeyRecord>>>,
    writes: AtomicUsize,
}

impl MemoryRecordStore {
    /// Create an empty store with a unique location
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self {
            location: format!("memory://{}", NEXT.fetch_add(1, Ordering::Relaxed)),
            records: Mutex::new(None),
            writes: AtomicUsize::new(0),
        }
    }

    /// Create a store that already holds `records`
    pub fn with_records(records: Vec<KeyRecord>) -> Self {
        let store = Self::new();
        *store.records.lock().unwrap_or_else(|p| p.into_inner()) = Some(records);
        store
    }

    /// Number of successful `persist_new` calls
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Drop everything, as if the backing file had been deleted
    pub fn clear(&self) {
        *self.records.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for MemoryRecordStore {
    fn load(&self) -> Result<Option<Vec<KeyRecord>>> {
        let records = self
            .records
            .lock()
            .map_err(|_| Error::storage("load", "lock poisoned"))?;
        Ok(records.clone())
    }

    fn persist_new(&self, records: &[KeyRecord]) -> Result<PersistOutcome> {
        let mut stored = self
            .records
            .lock()
            .map_err(|_| Error::storage("persist_new", "lock poisoned"))?;
        if let Some(existing) = stored.as_ref() {
            return Ok(PersistOutcome::AlreadyPresent(existing.clone()));
        }
        *stored = Some(records.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(PersistOutcome::Written)
    }

    fn location(&self) -> &str {
        &self.location
    }
}
