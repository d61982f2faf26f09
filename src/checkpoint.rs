//! Durable checkpointing of bulk-scan state (§4.6).
//!
//! Atomic overwrite (write-to-temp-and-rename), the same discipline the
//! teacher's index cache uses in `index/persistence.rs`, but the format
//! here is plain UTF-8 JSON as §6 requires rather than postcard+zstd —
//! this store persists a small Checkpoint record, not a multi-megabyte
//! index snapshot, so the compression tradeoff the teacher made doesn't
//! apply.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::types::Checkpoint;

pub const DEFAULT_MAX_CHECKPOINT_AGE_SECS: u64 = 24 * 60 * 60;

const CHECKPOINT_FILENAME: &str = "scan_checkpoint.json";
const CONFIG_HASH_FILENAME: &str = "scan_config_hash.json";

/// File-based store for `Checkpoint` values under `{config_dir}/{env}/filesystem/`.
pub struct ScanProgressStore {
    dir: PathBuf,
    max_checkpoint_age: std::time::Duration,
}

impl ScanProgressStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            max_checkpoint_age: std::time::Duration::from_secs(DEFAULT_MAX_CHECKPOINT_AGE_SECS),
        }
    }

    pub fn with_max_age(mut self, max_age: std::time::Duration) -> Self {
        self.max_checkpoint_age = max_age;
        self
    }

    fn checkpoint_path(&self) -> PathBuf {
        self.dir.join(CHECKPOINT_FILENAME)
    }

    fn config_hash_path(&self) -> PathBuf {
        self.dir.join(CONFIG_HASH_FILENAME)
    }

    /// Writes the checkpoint and the live `config_fingerprint` atomically.
    ///
    /// Write failures are logged and swallowed (§4.6 failure model): a
    /// checkpoint write never aborts the scan that requested it.
    pub fn save(&self, checkpoint: &Checkpoint) {
        if let Err(error) = self.try_save(checkpoint) {
            log::warn!(
                "failed to persist scan checkpoint under {}: {}",
                self.dir.display(),
                error
            );
        }
    }

    fn try_save(&self, checkpoint: &Checkpoint) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        atomic_write_json(&self.checkpoint_path(), checkpoint)?;
        atomic_write_json(&self.config_hash_path(), &checkpoint.config_fingerprint)?;
        Ok(())
    }

    /// Loads the durable checkpoint, or `None` if it is absent, malformed,
    /// stale, fingerprint-mismatched, or fails Invariant S1.
    ///
    /// `total_batches` is supplied by the caller (IndexQueryProvider knows
    /// its own batch plan); a checkpoint whose `current_batch_index`
    /// exceeds it is discarded rather than trusted.
    pub fn load(&self, current_config_fingerprint: &[u8], total_batches: u32) -> Option<Checkpoint> {
        let path = self.checkpoint_path();
        let data = match std::fs::read_to_string(&path) {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return None,
            Err(error) => {
                log::warn!("failed to read scan checkpoint {}: {}", path.display(), error);
                return None;
            }
        };

        let checkpoint: Checkpoint = match serde_json::from_str(&data) {
            Ok(checkpoint) => checkpoint,
            Err(error) => {
                log::warn!("scan checkpoint {} is corrupt: {}", path.display(), error);
                return None;
            }
        };

        if checkpoint.config_fingerprint != current_config_fingerprint {
            log::debug!("scan checkpoint fingerprint mismatch, discarding");
            return None;
        }

        if checkpoint.current_batch_index > total_batches {
            log::warn!(
                "scan checkpoint batch index {} exceeds total batches {}, discarding",
                checkpoint.current_batch_index,
                total_batches
            );
            return None;
        }

        if self.is_stale(checkpoint.recorded_at) {
            log::debug!("scan checkpoint is older than max_checkpoint_age, discarding");
            return None;
        }

        Some(checkpoint)
    }

    fn is_stale(&self, recorded_at: u64) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        now.saturating_sub(recorded_at) > self.max_checkpoint_age.as_secs()
    }

    /// Removes the checkpoint on scan completion (§4.5 step 5).
    pub fn clear(&self) {
        let _ = std::fs::remove_file(self.checkpoint_path());
        let _ = std::fs::remove_file(self.config_hash_path());
    }
}

fn atomic_write_json<T: serde::Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let data = serde_json::to_vec_pretty(value)
        .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidData, error))?;
    let tmp_path = path.with_extension("tmp");
    std::fs::write(&tmp_path, data)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use uuid::Uuid;

    fn sample_checkpoint(fingerprint: Vec<u8>) -> Checkpoint {
        Checkpoint {
            session_id: Uuid::new_v4(),
            current_batch_index: 1,
            current_query_label: "documents".to_string(),
            total_files_processed: 42,
            recorded_at: crate::types::unix_now_secs(),
            completed_query_labels: BTreeSet::from(["folders".to_string()]),
            config_fingerprint: fingerprint,
        }
    }

    #[test]
    fn round_trips_except_timestamp_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScanProgressStore::new(dir.path());
        let checkpoint = sample_checkpoint(vec![1, 2, 3]);

        store.save(&checkpoint);
        let loaded = store.load(&[1, 2, 3], 10).unwrap();

        assert_eq!(loaded.session_id, checkpoint.session_id);
        assert_eq!(loaded.current_batch_index, checkpoint.current_batch_index);
        assert_eq!(loaded.completed_query_labels, checkpoint.completed_query_labels);
    }

    #[test]
    fn fingerprint_mismatch_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScanProgressStore::new(dir.path());
        store.save(&sample_checkpoint(vec![1, 2, 3]));

        assert!(store.load(&[9, 9, 9], 10).is_none());
    }

    #[test]
    fn batch_index_beyond_total_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScanProgressStore::new(dir.path());
        let mut checkpoint = sample_checkpoint(vec![1]);
        checkpoint.current_batch_index = 5;
        store.save(&checkpoint);

        assert!(store.load(&[1], 2).is_none());
    }

    #[test]
    fn missing_checkpoint_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScanProgressStore::new(dir.path());
        assert!(store.load(&[1], 10).is_none());
    }

    #[test]
    fn corrupt_checkpoint_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(dir.path().join(CHECKPOINT_FILENAME), b"not json").unwrap();
        let store = ScanProgressStore::new(dir.path());
        assert!(store.load(&[1], 10).is_none());
    }

    #[test]
    fn clear_removes_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = ScanProgressStore::new(dir.path());
        store.save(&sample_checkpoint(vec![1]));
        store.clear();
        assert!(!dir.path().join(CHECKPOINT_FILENAME).exists());
    }
}
