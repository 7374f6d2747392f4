//! Protection options

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default name of the key ring file inside the tokens directory
pub const DEFAULT_KEY_RING_FILE_NAME: &str = "security_identifier.keyring";

/// Default number of records generated for a new key ring
pub const DEFAULT_KEY_COUNT: usize = 20;

/// Default character between the index and the ciphertext
pub const DEFAULT_KEY_SEPARATOR: char = ':';

/// How payload key material is derived from a record
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CipherScheme {
    /// `key = id ++ reverse(id)`, `iv = reverse(id)`, AES-256-CBC.
    /// Byte-compatible with previously protected data.
    #[default]
    Legacy,
    /// HKDF-SHA256 key, AES-256-GCM with a random nonce. Still reads
    /// `Legacy` payloads.
    Hkdf,
}

/// Configuration for the key ring and the privacy data protector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtectionOptions {
    /// Directory holding the key ring file
    pub tokens_directory: PathBuf,
    /// File name of the key ring inside `tokens_directory`
    pub key_ring_file_name: String,
    /// Records generated when the key ring is first created
    pub key_count: usize,
    /// Separator between index and ciphertext in protected payloads
    pub key_separator: char,
    /// Seconds a loaded key ring stays cached; `None` caches for the process lifetime
    pub cache_ttl_secs: Option<u64>,
    /// Payload cipher scheme
    pub cipher_scheme: CipherScheme,
}

impl Default for ProtectionOptions {
    fn default() -> Self {
        Self {
            tokens_directory: PathBuf::from("tokens"),
            key_ring_file_name: DEFAULT_KEY_RING_FILE_NAME.to_string(),
            key_count: DEFAULT_KEY_COUNT,
            key_separator: DEFAULT_KEY_SEPARATOR,
            cache_ttl_secs: None,
            cipher_scheme: CipherScheme::default(),
        }
    }
}

impl ProtectionOptions {
    /// Parse options from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("invalid options JSON: {}", e)))?;
        options.validate()?;
        Ok(options)
    }

    /// Read options from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::io("read_options", e))?;
        Self::from_json(&json)
    }

    /// Set the tokens directory
    pub fn with_tokens_directory<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.tokens_directory = dir.into();
        self
    }

    /// Set the number of records in a new key ring
    pub fn with_key_count(mut self, key_count: usize) -> Self {
        self.key_count = key_count;
        self
    }

    /// Set the payload separator
    pub fn with_key_separator(mut self, separator: char) -> Self {
        self.key_separator = separator;
        self
    }

    /// Set the cache lifetime
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl_secs = Some(ttl.as_secs());
        self
    }

    /// Set the payload cipher scheme
    pub fn with_cipher_scheme(mut self, scheme: CipherScheme) -> Self {
        self.cipher_scheme = scheme;
        self
    }

    /// Full path of the key ring file
    pub fn key_ring_path(&self) -> PathBuf {
        self.tokens_directory.join(&self.key_ring_file_name)
    }

    /// Cache lifetime as a duration
    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl_secs.map(Duration::from_secs)
    }

    /// Check the options for values the key ring cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.key_count == 0 {
            return Err(Error::config("key_count must be at least 1"));
        }
        if self.key_ring_file_name.trim().is_empty() {
            return Err(Error::config("key_ring_file_name must not be empty"));
        }
        if !is_valid_separator(self.key_separator) {
            return Err(Error::config(format!(
                "key_separator {:?} can occur inside an index or base64 ciphertext",
                self.key_separator
            )));
        }
        Ok(())
    }
}

/// A separator must never appear in a hex index or standard base64.
pub fn is_valid_separator(c: char) -> bool {
    !(c.is_ascii_alphanumeric() || c == '+' || c == '/' || c == '=' || c.is_whitespace())
}
