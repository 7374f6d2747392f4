//! The rotating key ring
//!
//! A [`KeyRing`] is populated lazily: the first caller takes the population
//! lock, loads the record set from its [`RecordStore`] or generates and
//! persists a new one, and publishes it to the cache. Every other caller
//! either waits on the same lock or reads the cached set.

use crate::audit::{self, AuditEvent, SharedAuditLogger};
use crate::config::{ProtectionOptions, DEFAULT_KEY_COUNT};
use crate::crypto::{OsRandom, RandomSource};
use crate::key::KeyRecord;
use crate::storage::{PersistOutcome, RecordStore};
use crate::{AlgorithmIdentifier, Error, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Generation attempts allowed per requested record before giving up
const MAX_ATTEMPTS_PER_RECORD: usize = 16;

/// An immutable, loaded set of key records
#[derive(Debug)]
pub struct RecordSet {
    records: Vec<KeyRecord>,
    positions: HashMap<String, usize>,
    usable: Vec<usize>,
}

impl RecordSet {
    fn new(loaded: Vec<KeyRecord>) -> Self {
        let mut records = Vec::with_capacity(loaded.len());
        let mut positions = HashMap::with_capacity(loaded.len());
        let mut usable = Vec::with_capacity(loaded.len());

        for record in loaded {
            if positions.contains_key(record.index()) {
                warn!(index = record.index(), "duplicate key ring index, keeping the first");
                continue;
            }
            let position = records.len();
            positions.insert(record.index().to_string(), position);
            if record.verify() {
                usable.push(position);
            } else {
                warn!(index = record.index(), "corrupt key ring record");
            }
            records.push(record);
        }

        Self {
            records,
            positions,
            usable,
        }
    }

    /// All records, in creation order
    pub fn records(&self) -> &[KeyRecord] {
        &self.records
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when the set holds no records
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records that can be used for protection
    pub fn usable_len(&self) -> usize {
        self.usable.len()
    }

    /// Record with the given index, usable or not
    pub fn get(&self, index: &str) -> Option<&KeyRecord> {
        self.positions.get(index).map(|&p| &self.records[p])
    }

    /// Indexes of all records
    pub fn indexes(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.index())
    }
}

struct CachedRecords {
    records: Arc<RecordSet>,
    loaded_at: Instant,
}

/// Population lock shared by every key ring with the same cache key
fn population_lock(cache_key: &str) -> Arc<Mutex<()>> {
    static LOCKS: OnceLock<Mutex<HashMap<String, Arc<Mutex<()>>>>> = OnceLock::new();
    let mut locks = LOCKS
        .get_or_init(Default::default)
        .lock()
        .unwrap_or_else(|p| p.into_inner());
    locks.entry(cache_key.to_string()).or_default().clone()
}

/// A durable set of rotation keys with lazy, serialized population
pub struct KeyRing {
    store: Arc<dyn RecordStore>,
    random: Arc<dyn RandomSource>,
    key_count: usize,
    cache_ttl: Option<Duration>,
    cache_key: String,
    cache: RwLock<Option<CachedRecords>>,
    population_lock: Arc<Mutex<()>>,
    audit: Option<SharedAuditLogger>,
}

impl KeyRing {
    /// Create a key ring over `store`. Nothing is loaded until first use.
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        let cache_key = format!("KeyRing|{}", store.location());
        Self {
            population_lock: population_lock(&cache_key),
            cache_key,
            store,
            random: Arc::new(OsRandom),
            key_count: DEFAULT_KEY_COUNT,
            cache_ttl: None,
            cache: RwLock::new(None),
            audit: None,
        }
    }

    /// Create a key ring configured from `options`
    pub fn from_options(options: &ProtectionOptions, store: Arc<dyn RecordStore>) -> Result<Self> {
        options.validate()?;
        let ring = Self::new(store).with_key_count(options.key_count);
        Ok(match options.cache_ttl() {
            Some(ttl) => ring.with_cache_ttl(ttl),
            None => ring,
        })
    }

    /// Number of records generated for a new ring
    pub fn with_key_count(mut self, key_count: usize) -> Self {
        self.key_count = key_count;
        self
    }

    /// Source of randomness for token generation and index selection
    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    /// Reload from the store once a cached set is older than `ttl`
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Attach an audit logger
    pub fn with_audit_logger(mut self, logger: SharedAuditLogger) -> Self {
        self.audit = Some(logger);
        self
    }

    /// Where the records are persisted
    pub fn location(&self) -> &str {
        self.store.location()
    }

    /// Records generated for a new ring
    pub fn key_count(&self) -> usize {
        self.key_count
    }

    pub(crate) fn audit_logger(&self) -> Option<&SharedAuditLogger> {
        self.audit.as_ref()
    }

    /// The loaded record set, populating the ring on first use
    pub fn key_infos(&self) -> Result<Arc<RecordSet>> {
        if let Some(records) = self.cached() {
            return Ok(records);
        }

        // The lock guards no data, so a poisoned lock is still usable.
        let _guard = self
            .population_lock
            .lock()
            .unwrap_or_else(|p| p.into_inner());

        if let Some(records) = self.cached() {
            return Ok(records);
        }

        debug!(cache_key = %self.cache_key, "populating key ring");
        let records = match self.populate() {
            Ok(records) => Arc::new(records),
            Err(e) => {
                warn!(location = self.location(), error = %e, "key ring population failed");
                audit::record(
                    self.audit.as_ref(),
                    AuditEvent::ErrorOccurred {
                        operation: "populate_key_ring".to_string(),
                        error_type: e.code().to_string(),
                        message: e.to_string(),
                    },
                );
                return Err(e);
            }
        };

        let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
        *cache = Some(CachedRecords {
            records: Arc::clone(&records),
            loaded_at: Instant::now(),
        });
        Ok(records)
    }

    /// Token material for `index`
    ///
    /// # Errors
    /// [`Error::KeyNotFound`] if no record has that index or its token is
    /// empty or corrupt.
    pub fn get(&self, index: &str) -> Result<String> {
        self.lookup(index, "get", |record| Ok(record.token().to_string()))
    }

    /// The identifier carried by the token of `index`
    pub fn identifier(&self, index: &str) -> Result<AlgorithmIdentifier> {
        self.lookup(index, "identifier", KeyRecord::identifier)
    }

    /// A uniformly random index among the usable records.
    ///
    /// Every call draws again, so successive protections spread across the
    /// whole ring.
    pub fn current_index(&self) -> Result<String> {
        let records = self.key_infos()?;
        if records.usable.is_empty() {
            return Err(Error::storage_with_path(
                "current_index",
                "key ring has no usable records",
                self.location(),
            ));
        }
        let pick = self.random.pick(records.usable.len())?;
        Ok(records.records[records.usable[pick]].index().to_string())
    }

    /// Every known index, in creation order
    pub fn all_indexes(&self) -> Result<Vec<String>> {
        Ok(self.key_infos()?.indexes().map(str::to_string).collect())
    }

    /// Drop the cached set; the next access reloads from the store
    pub fn invalidate(&self) {
        let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
        *cache = None;
    }

    fn cached(&self) -> Option<Arc<RecordSet>> {
        let cache = self.cache.read().unwrap_or_else(|p| p.into_inner());
        let entry = cache.as_ref()?;
        if let Some(ttl) = self.cache_ttl {
            if entry.loaded_at.elapsed() >= ttl {
                debug!(cache_key = %self.cache_key, "key ring cache entry expired");
                return None;
            }
        }
        Some(Arc::clone(&entry.records))
    }

    fn lookup<T>(
        &self,
        index: &str,
        operation: &str,
        f: impl FnOnce(&KeyRecord) -> Result<T>,
    ) -> Result<T> {
        let records = self.key_infos()?;
        let resolved = records
            .get(index)
            .filter(|record| record.verify())
            .ok_or(())
            .and_then(|record| f(record).map_err(|_| ()));

        resolved.map_err(|_| {
            debug!(index, operation, "key ring lookup failed");
            audit::record(
                self.audit.as_ref(),
                AuditEvent::KeyLookupFailed {
                    index: index.to_string(),
                    operation: operation.to_string(),
                },
            );
            Error::key_not_found(index, operation)
        })
    }

    fn populate(&self) -> Result<RecordSet> {
        if let Some(records) = self.store.load()? {
            info!(location = self.location(), count = records.len(), "loaded key ring");
            self.audit_loaded(records.len());
            return Ok(RecordSet::new(records));
        }

        let generated = self.generate_records()?;
        match self.store.persist_new(&generated)? {
            PersistOutcome::Written => {
                info!(location = self.location(), count = generated.len(), "generated key ring");
                audit::record(
                    self.audit.as_ref(),
                    AuditEvent::KeyRingGenerated {
                        location: self.location().to_string(),
                        record_count: generated.len(),
                    },
                );
                Ok(RecordSet::new(generated))
            }
            PersistOutcome::AlreadyPresent(existing) => {
                info!(
                    location = self.location(),
                    count = existing.len(),
                    "adopted concurrently created key ring"
                );
                self.audit_loaded(existing.len());
                Ok(RecordSet::new(existing))
            }
        }
    }

    fn audit_loaded(&self, record_count: usize) {
        audit::record(
            self.audit.as_ref(),
            AuditEvent::KeyRingLoaded {
                location: self.location().to_string(),
                record_count,
            },
        );
    }

    fn generate_records(&self) -> Result<Vec<KeyRecord>> {
        if self.key_count == 0 {
            return Err(Error::config("key_count must be at least 1"));
        }

        let max_attempts = self.key_count.saturating_mul(MAX_ATTEMPTS_PER_RECORD);
        let mut seen = HashSet::with_capacity(self.key_count);
        let mut records = Vec::with_capacity(self.key_count);
        let mut attempts = 0;

        while records.len() < self.key_count {
            if attempts == max_attempts {
                return Err(Error::InsufficientEntropy {
                    operation: format!(
                        "generate_key_ring ({} unique of {} after {} attempts)",
                        records.len(),
                        self.key_count,
                        attempts
                    ),
                });
            }
            attempts += 1;

            let record = KeyRecord::generate(self.random.as_ref())?;
            if seen.insert(record.index().to_string()) {
                records.push(record);
            } else {
                debug!(index = record.index(), "index collision, regenerating");
            }
        }

        Ok(records)
    }
}
