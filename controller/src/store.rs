use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
};

use offset_thermostat_common::OFFSET_LIMIT;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("offset store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("offset store encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct OffsetRecord {
    #[serde(default)]
    offset: f64,
}

/// Learned offsets for every controller instance, keyed by instance id.
///
/// `get`/`set` only touch memory; `save` writes the whole map to disk.
#[derive(Debug)]
pub struct OffsetStore {
    path: PathBuf,
    offsets: RwLock<HashMap<String, OffsetRecord>>,
    write_lock: Mutex<()>,
}

impl OffsetStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offsets: RwLock::new(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the in-memory map with the persisted one. A missing file is
    /// an empty store.
    pub async fn load(&self) -> Result<usize, StoreError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };

        let mut loaded: HashMap<String, OffsetRecord> = serde_json::from_slice(&raw)?;
        loaded.retain(|_, record| record.offset.is_finite());
        for record in loaded.values_mut() {
            record.offset = record.offset.clamp(-OFFSET_LIMIT, OFFSET_LIMIT);
        }

        let count = loaded.len();
        *self.offsets.write().unwrap_or_else(PoisonError::into_inner) = loaded;
        Ok(count)
    }

    pub fn get(&self, id: &str) -> f64 {
        self.offsets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .map(|record| record.offset)
            .unwrap_or(0.0)
    }

    pub fn set(&self, id: &str, offset: f64) {
        if !offset.is_finite() {
            return;
        }
        self.offsets
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id.to_string(),
                OffsetRecord {
                    offset: offset.clamp(-OFFSET_LIMIT, OFFSET_LIMIT),
                },
            );
    }

    pub async fn save(&self) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let payload = {
            let offsets = self.offsets.read().unwrap_or_else(PoisonError::into_inner);
            serde_json::to_vec_pretty(&*offsets)?
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, payload).await?;
        tokio::fs::rename(&staging, &self.path).await?;
        Ok(())
    }
}
