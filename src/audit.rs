//! Audit logging for key ring and protection events
//!
//! Provides structured records of security-relevant events for compliance
//! and security monitoring. Entries never carry tokens, keys, or plaintext.

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

/// Types of auditable events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum AuditEvent {
    /// A new key ring was generated and persisted
    KeyRingGenerated {
        /// Where the key ring lives
        location: String,
        /// Number of records generated
        record_count: usize,
    },

    /// An existing key ring was loaded from its store
    KeyRingLoaded {
        /// Where the key ring lives
        location: String,
        /// Number of records loaded
        record_count: usize,
    },

    /// An index did not resolve to a usable record
    KeyLookupFailed {
        /// The index that was requested
        index: String,
        /// The operation that needed it
        operation: String,
    },

    /// Data was protected
    DataProtected {
        /// Index of the record used
        index: String,
        /// Size of the plaintext in bytes
        data_size: usize,
    },

    /// An unprotect was attempted
    DataUnprotected {
        /// Index named by the payload, if it could be parsed
        index: Option<String>,
        /// Whether the unprotect succeeded
        success: bool,
    },

    /// Error occurred
    ErrorOccurred {
        /// The operation that was being performed
        operation: String,
        /// The error code
        error_type: String,
        /// Error message
        message: String,
    },
}

/// Audit log entry with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    /// When the event occurred
    pub timestamp: SystemTime,

    /// The event details
    #[serde(flatten)]
    pub event: AuditEvent,

    /// Optional context/metadata
    pub context: Option<String>,
}

impl AuditLogEntry {
    /// Create a new audit log entry
    pub fn new(event: AuditEvent) -> Self {
        Self {
            timestamp: SystemTime::now(),
            event,
            context: None,
        }
    }

    /// Add context to the log entry
    pub fn with_context<S: Into<String>>(mut self, context: S) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Trait for audit logging backends
pub trait AuditLogger: Send + Sync {
    /// Log an audit event
    fn log(&mut self, entry: AuditLogEntry) -> crate::Result<()>;

    /// Flush any buffered logs
    fn flush(&mut self) -> crate::Result<()>;
}

/// Audit logger shared between a key ring and its protectors
pub type SharedAuditLogger = Arc<Mutex<dyn AuditLogger>>;

/// Record `event` on an optional shared logger.
///
/// Audit failures are reported through `tracing` and never fail the
/// operation being audited.
pub(crate) fn record(logger: Option<&SharedAuditLogger>, event: AuditEvent) {
    let Some(logger) = logger else { return };
    let mut guard = match logger.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Err(e) = guard.log(AuditLogEntry::new(event)) {
        tracing::warn!(error = %e, "failed to write audit entry");
    }
}

/// No-op logger for when auditing is disabled
pub struct NoOpLogger;

impl AuditLogger for NoOpLogger {
    fn log(&mut self, _entry: AuditLogEntry) -> crate::Result<()> {
        Ok(())
    }

    fn flush(&mut self) -> crate::Result<()> {
        Ok(())
    }
}

/// File-based JSON-lines audit logger
pub struct FileAuditLogger {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl FileAuditLogger {
    /// Create a new file-based audit logger
    pub fn new<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| crate::Error::io("create_audit_directory", e))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| crate::Error::io("open_audit_log", e))?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Get the path to the audit log file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditLogger for FileAuditLogger {
    fn log(&mut self, entry: AuditLogEntry) -> crate::Result<()> {
        let json = serde_json::to_string(&entry)
            .map_err(|e| crate::Error::serialization("audit_logging", e.to_string()))?;

        writeln!(self.writer, "{}", json).map_err(|e| crate::Error::io("write_audit_log", e))
    }

    fn flush(&mut self) -> crate::Result<()> {
        self.writer
            .flush()
            .map_err(|e| crate::Error::io("flush_audit_log", e))
    }
}

impl Drop for FileAuditLogger {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

/// In-memory audit logger for testing
#[derive(Default)]
pub struct MemoryAuditLogger {
    entries: Vec<AuditLogEntry>,
}

impl MemoryAuditLogger {
    /// Create a new in-memory audit logger
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Get all logged entries
    pub fn entries(&self) -> &[AuditLogEntry] {
        &self.entries
    }

    /// Clear all logged entries
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Count entries of a specific type
    pub fn count_event_type(&self, predicate: impl Fn(&AuditEvent) -> bool) -> usize {
        self.entries.iter().filter(|e| predicate(&e.event)).count()
    }
}

impl AuditLogger for MemoryAuditLogger {
    fn log(&mut self, entry: AuditLogEntry) -> crate::Result<()> {
        self.entries.push(entry);
        Ok(())
    }

    fn flush(&mut self) -> crate::Result<()> {
        Ok(())
    }
}
