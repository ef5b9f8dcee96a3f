//! Durable key-value locations that hold encoded snapshots.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use ulid::Ulid;

const SLOT_FILE_EXTENSION: &str = "snapshot";
const MAX_KEY_LEN: usize = 128;

#[derive(Debug, thiserror::Error)]
pub enum SlotError {
    #[error("invalid slot key `{0}`")]
    InvalidKey(String),
    #[error("value of {needed} bytes exceeds the slot quota of {quota} bytes")]
    QuotaExceeded { needed: u64, quota: u64 },
    #[error("slot I/O failed for `{key}`: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("slot is unavailable: {0}")]
    Unavailable(String),
}

/// Key-value storage for snapshot envelopes.
pub trait SnapshotSlot: Send + Sync {
    /// # Errors
    /// Returns `SlotError` when the slot cannot be read. An absent key is `Ok(None)`.
    fn get(&self, key: &str) -> Result<Option<String>, SlotError>;

    /// Store `value` under `key`, replacing any previous value. On error the previous
    /// value is left in place.
    ///
    /// # Errors
    /// Returns `SlotError::QuotaExceeded` when the slot would grow past its quota, or
    /// another `SlotError` when the write fails.
    fn set(&self, key: &str, value: &str) -> Result<(), SlotError>;

    /// Remove `key`. Removing an absent key succeeds.
    ///
    /// # Errors
    /// Returns `SlotError` when the removal fails.
    fn remove(&self, key: &str) -> Result<(), SlotError>;

    /// Whether values outlive the process.
    fn is_durable(&self) -> bool {
        true
    }
}

/// One file per key inside a directory.
#[derive(Debug, Clone)]
pub struct FileSlot {
    dir: PathBuf,
    quota_bytes: Option<u64>,
}

impl FileSlot {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into(), quota_bytes: None }
    }

    /// Cap the total bytes stored across every key of this slot.
    #[must_use]
    pub fn with_quota(mut self, quota_bytes: u64) -> Self {
        self.quota_bytes = Some(quota_bytes);
        self
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, SlotError> {
        validate_key(key)?;
        Ok(self.dir.join(format!("{key}.{SLOT_FILE_EXTENSION}")))
    }

    fn bytes_used_by_others(&self, target: &Path) -> Result<u64, SlotError> {
        let io_error = |source| SlotError::Io { key: self.dir.display().to_string(), source };
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(io_error(err)),
        };

        let mut total = 0_u64;
        for entry in entries {
            let path = entry.map_err(io_error)?.path();
            let is_slot_file =
                path.extension().is_some_and(|extension| extension == SLOT_FILE_EXTENSION);
            if is_slot_file && path != target {
                total += fs::metadata(&path).map_err(io_error)?.len();
            }
        }
        Ok(total)
    }
}

impl SnapshotSlot for FileSlot {
    fn get(&self, key: &str) -> Result<Option<String>, SlotError> {
        let path = self.path_for(key)?;
        match fs::read_to_string(&path) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(SlotError::Io { key: key.to_string(), source }),
        }
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SlotError> {
        let path = self.path_for(key)?;
        if let Some(quota) = self.quota_bytes {
            check_quota(self.bytes_used_by_others(&path)?, value.len(), quota)?;
        }

        let io_error = |source| SlotError::Io { key: key.to_string(), source };
        fs::create_dir_all(&self.dir).map_err(io_error)?;
        let partial = self.dir.join(format!(".{key}.{}.partial", Ulid::new()));
        if let Err(err) = fs::write(&partial, value).and_then(|()| fs::rename(&partial, &path)) {
            let _ = fs::remove_file(&partial);
            return Err(io_error(err));
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SlotError> {
        let path = self.path_for(key)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(SlotError::Io { key: key.to_string(), source }),
        }
    }
}

/// Process-local slot, for embedding without a snapshot directory and for tests.
///
/// Values are lost when the process exits, so writes never count as persisted.
#[derive(Debug, Default)]
pub struct MemorySlot {
    values: Mutex<BTreeMap<String, String>>,
    quota_bytes: Option<u64>,
}

impl MemorySlot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_quota(quota_bytes: u64) -> Self {
        Self { values: Mutex::default(), quota_bytes: Some(quota_bytes) }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>, SlotError> {
        self.values
            .lock()
            .map_err(|_| SlotError::Unavailable("memory slot lock poisoned".to_string()))
    }
}

impl SnapshotSlot for MemorySlot {
    fn get(&self, key: &str) -> Result<Option<String>, SlotError> {
        validate_key(key)?;
        Ok(self.lock()?.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), SlotError> {
        validate_key(key)?;
        let mut values = self.lock()?;
        if let Some(quota) = self.quota_bytes {
            let others: usize = values
                .iter()
                .filter(|(existing, _)| existing.as_str() != key)
                .map(|(_, stored)| stored.len())
                .sum();
            check_quota(others as u64, value.len(), quota)?;
        }
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), SlotError> {
        validate_key(key)?;
        self.lock()?.remove(key);
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}

fn check_quota(used_by_others: u64, value_len: usize, quota: u64) -> Result<(), SlotError> {
    let needed = used_by_others.saturating_add(value_len as u64);
    if needed > quota {
        return Err(SlotError::QuotaExceeded { needed, quota });
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<(), SlotError> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && !key.starts_with('.')
        && key.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(SlotError::InvalidKey(key.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{Context, Result};

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("firewatch-slot-{}", Ulid::new()))
    }

    #[test]
    fn file_slot_round_trip_and_remove() -> Result<()> {
        let dir = scratch_dir();
        let slot = FileSlot::new(&dir);

        assert_eq!(slot.get("wildfire_sqlite_db_v2")?, None);
        slot.set("wildfire_sqlite_db_v2", "first")?;
        slot.set("wildfire_sqlite_db_v2", "second")?;
        assert_eq!(slot.get("wildfire_sqlite_db_v2")?.as_deref(), Some("second"));

        slot.remove("wildfire_sqlite_db_v2")?;
        slot.remove("wildfire_sqlite_db_v2")?;
        assert_eq!(slot.get("wildfire_sqlite_db_v2")?, None);

        fs::remove_dir_all(&dir)
            .with_context(|| format!("failed to cleanup slot dir {}", dir.display()))?;
        Ok(())
    }

    #[test]
    fn file_slot_quota_keeps_previous_value() -> Result<()> {
        let dir = scratch_dir();
        let slot = FileSlot::new(&dir).with_quota(8);

        slot.set("snapshot", "12345678")?;
        let result = slot.set("snapshot", "123456789");
        assert!(matches!(result, Err(SlotError::QuotaExceeded { needed: 9, quota: 8 })));
        assert_eq!(slot.get("snapshot")?.as_deref(), Some("12345678"));

        // Other keys count against the same quota.
        assert!(matches!(slot.set("other", "x"), Err(SlotError::QuotaExceeded { .. })));

        fs::remove_dir_all(&dir)
            .with_context(|| format!("failed to cleanup slot dir {}", dir.display()))?;
        Ok(())
    }

    #[test]
    fn keys_are_restricted_to_plain_file_names() {
        let slot = FileSlot::new(scratch_dir());
        for key in ["", "../escape", ".hidden", "a/b", "semi;colon"] {
            assert!(matches!(slot.get(key), Err(SlotError::InvalidKey(_))), "key {key:?}");
        }
        assert!(matches!(MemorySlot::new().set("a b", "x"), Err(SlotError::InvalidKey(_))));
    }

    #[test]
    fn only_file_slots_are_durable() {
        assert!(FileSlot::new(scratch_dir()).is_durable());
        assert!(!MemorySlot::new().is_durable());
        assert!(!MemorySlot::with_quota(4).is_durable());
    }

    #[test]
    fn memory_slot_honours_quota() -> Result<()> {
        let slot = MemorySlot::with_quota(4);
        slot.set("key", "abcd")?;
        assert!(matches!(slot.set("key", "abcde"), Err(SlotError::QuotaExceeded { .. })));
        assert_eq!(slot.get("key")?.as_deref(), Some("abcd"));
        slot.remove("key")?;
        assert_eq!(slot.get("key")?, None);
        Ok(())
    }
}
