//! JSON file store for lifecycle records.
//!
//! All records live in one document (`lifecycle.json` by default). Updates are
//! serialized through a mutex and written by replacing the file: the new document is
//! written to a temporary file in the same directory, synced, then renamed over the old
//! one, so readers and crashes only ever see a complete document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::LifecycleStore;
use crate::batch::{BatchId, LifecycleRecord};
use crate::error::{BarrageError, Result};

const FORMAT_VERSION: u32 = 1;

/// On-disk document.
#[derive(Debug, Default, Serialize, Deserialize)]
struct LifecycleDocument {
    version: u32,
    batches: BTreeMap<BatchId, LifecycleRecord>,
}

/// Lifecycle store backed by a single JSON file.
pub struct FileStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub const FILE_NAME: &'static str = "lifecycle.json";

    /// Store at `path`. The file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Store at `{state_dir}/lifecycle.json`, creating the directory.
    pub async fn in_dir(state_dir: &Path) -> Result<Self> {
        tokio::fs::create_dir_all(state_dir).await?;
        Ok(Self::new(state_dir.join(Self::FILE_NAME)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn load(&self) -> Result<LifecycleDocument> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(LifecycleDocument {
                    version: FORMAT_VERSION,
                    batches: BTreeMap::new(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let document: LifecycleDocument = serde_json::from_str(&content).map_err(|e| {
            tracing::error!(path = %self.path.display(), error = %e, "Lifecycle file is unreadable");
            BarrageError::Serialization(e)
        })?;
        if document.version != FORMAT_VERSION {
            return Err(BarrageError::Validation(format!(
                "{}: unsupported lifecycle format version {}",
                self.path.display(),
                document.version
            )));
        }
        Ok(document)
    }

    async fn write(&self, document: &LifecycleDocument) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(document)?;
        write_atomic(&self.path, &bytes).await
    }
}

/// Replace `path` with `bytes`.
///
/// The bytes go to a temporary file in the same directory, which is synced and then
/// renamed over `path`. The temporary file is removed if any step fails.
pub(crate) async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| FileStore::FILE_NAME.to_string());
    let tmp_path = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let result = async {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp_path, path).await
    }
    .await;

    if let Err(e) = result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e.into());
    }
    Ok(())
}

#[async_trait]
impl LifecycleStore for FileStore {
    #[tracing::instrument(skip(self, record), fields(batch_id = %record.batch.batch_id, state = %record.batch.state))]
    async fn persist(&self, record: &LifecycleRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.load().await?;
        document
            .batches
            .insert(record.batch.batch_id.clone(), record.clone());
        self.write(&document).await?;
        tracing::trace!("Lifecycle record persisted");
        Ok(())
    }

    async fn get(&self, batch_id: &BatchId) -> Result<LifecycleRecord> {
        self.load()
            .await?
            .batches
            .remove(batch_id)
            .ok_or_else(|| BarrageError::BatchNotFound(batch_id.clone()))
    }

    async fn list(&self) -> Result<Vec<LifecycleRecord>> {
        Ok(self.load().await?.batches.into_values().collect())
    }
}
