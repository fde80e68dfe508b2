// src/store/shadow.rs

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
};

use crate::store::{ShadowCache, ShadowEntry, ShadowRecord, StoreError};

/// Shadow cache backed by one JSON file per attempt.
#[derive(Debug, Clone)]
pub struct FileShadowCache {
    dir: PathBuf,
}

impl FileShadowCache {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            StoreError::Unavailable(format!("cannot create {}: {}", dir.display(), e))
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, attempt_id: i64) -> PathBuf {
        self.dir.join(format!("attempt-{}.json", attempt_id))
    }
}

impl ShadowCache for FileShadowCache {
    fn read_shadow(&self, attempt_id: i64) -> Result<ShadowRecord, StoreError> {
        let path = self.path_for(attempt_id);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(ShadowRecord::new()),
            Err(e) => return Err(StoreError::Unavailable(e.to_string())),
        };

        match serde_json::from_slice(&raw) {
            Ok(record) => Ok(record),
            Err(e) => {
                tracing::warn!(
                    "Discarding unreadable shadow file {}: {}",
                    path.display(),
                    e
                );
                Ok(ShadowRecord::new())
            }
        }
    }

    fn write_shadow(
        &self,
        attempt_id: i64,
        question_id: i64,
        entry: &ShadowEntry,
    ) -> Result<(), StoreError> {
        let mut record = self.read_shadow(attempt_id)?;
        record.insert(question_id, entry.clone());

        let body = serde_json::to_vec(&record).map_err(|e| StoreError::Unavailable(e.to_string()))?;

        // Atomic replace; readers see the old or the new record, never half of one.
        let path = self.path_for(attempt_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        fs::rename(&tmp, &path).map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn clear_shadow(&self, attempt_id: i64) -> Result<(), StoreError> {
        match fs::remove_file(self.path_for(attempt_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Unavailable(e.to_string())),
        }
    }
}
