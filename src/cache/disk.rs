//! Filesystem partition backend.
//!
//! Layout under the root directory:
//!
//! ```text
//! manifest.json              partition names in creation order
//! <partition>/<digest>.json  one entry per request key
//! ```
//!
//! Entries are written to a temporary file and renamed into place, so a
//! reader sees either the previous entry or the new one, never a torn write.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::fs;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::keys::RequestKey;
use super::store::{StoreBackend, StoreError, StoredResponse};

const MANIFEST_FILE: &str = "manifest.json";
const ENTRY_EXTENSION: &str = "json";

#[derive(Debug, Serialize, Deserialize)]
struct EntryFile {
    key: RequestKey,
    status: u16,
    headers: Vec<(String, String)>,
    body: String,
    cached_at_secs: i64,
    cached_at_nanos: u32,
}

impl EntryFile {
    fn new(key: &RequestKey, response: StoredResponse) -> Self {
        Self {
            key: key.clone(),
            status: response.status,
            headers: response.headers,
            body: BASE64.encode(&response.body),
            cached_at_secs: response.cached_at.unix_timestamp(),
            cached_at_nanos: response.cached_at.nanosecond(),
        }
    }

    fn into_stored(self, partition: &str) -> Result<StoredResponse, StoreError> {
        let corrupt = |message: String| StoreError::Corrupt {
            partition: partition.to_string(),
            message,
        };
        let body = BASE64
            .decode(self.body.as_bytes())
            .map_err(|err| corrupt(format!("body is not base64: {err}")))?;
        let cached_at = OffsetDateTime::from_unix_timestamp(self.cached_at_secs)
            .and_then(|ts| ts.replace_nanosecond(self.cached_at_nanos))
            .map_err(|err| corrupt(format!("invalid timestamp: {err}")))?;
        Ok(StoredResponse {
            status: self.status,
            headers: self.headers,
            body: Bytes::from(body),
            cached_at,
        })
    }
}

/// Backend that persists partitions under a directory.
pub struct DiskBackend {
    root: PathBuf,
    manifest: Mutex<()>,
}

impl DiskBackend {
    /// Use `root` as the store directory, creating it if needed.
    pub async fn open_at(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            manifest: Mutex::new(()),
        })
    }

    fn partition_dir(&self, partition: &str) -> Result<PathBuf, StoreError> {
        let valid = !partition.is_empty()
            && partition != "."
            && partition != ".."
            && partition
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(StoreError::Backend(format!(
                "invalid partition name `{partition}`"
            )));
        }
        Ok(self.root.join(partition))
    }

    fn entry_path(&self, partition: &str, key: &RequestKey) -> Result<PathBuf, StoreError> {
        Ok(self
            .partition_dir(partition)?
            .join(format!("{}.{ENTRY_EXTENSION}", key.digest())))
    }

    async fn read_manifest(&self) -> Result<Vec<String>, StoreError> {
        match fs::read(self.root.join(MANIFEST_FILE)).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| StoreError::Corrupt {
                partition: MANIFEST_FILE.to_string(),
                message: err.to_string(),
            }),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_manifest(&self, names: &[String]) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(names)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        write_replace(&self.root.join(MANIFEST_FILE), &bytes).await
    }

    async fn ensure_partition(&self, partition: &str) -> Result<PathBuf, StoreError> {
        let dir = self.partition_dir(partition)?;
        let _guard = self.manifest.lock().await;
        fs::create_dir_all(&dir).await?;
        let mut names = self.read_manifest().await?;
        if !names.iter().any(|name| name == partition) {
            names.push(partition.to_string());
            self.write_manifest(&names).await?;
        }
        Ok(dir)
    }
}

async fn write_replace(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("entry");
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", Uuid::new_v4()));
    fs::write(&tmp, bytes).await?;
    if let Err(err) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(err.into());
    }
    Ok(())
}

#[async_trait]
impl StoreBackend for DiskBackend {
    async fn open(&self, partition: &str) -> Result<(), StoreError> {
        self.ensure_partition(partition).await.map(|_| ())
    }

    async fn partitions(&self) -> Result<Vec<String>, StoreError> {
        let _guard = self.manifest.lock().await;
        self.read_manifest().await
    }

    async fn get(
        &self,
        partition: &str,
        key: &RequestKey,
    ) -> Result<Option<StoredResponse>, StoreError> {
        let path = self.entry_path(partition, key)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let entry: EntryFile =
            serde_json::from_slice(&bytes).map_err(|err| StoreError::Corrupt {
                partition: partition.to_string(),
                message: err.to_string(),
            })?;
        // Digest collisions are not expected, but never serve a foreign key.
        if &entry.key != key {
            return Ok(None);
        }
        entry.into_stored(partition).map(Some)
    }

    async fn put(
        &self,
        partition: &str,
        key: &RequestKey,
        response: StoredResponse,
    ) -> Result<(), StoreError> {
        self.ensure_partition(partition).await?;
        let path = self.entry_path(partition, key)?;
        let bytes = serde_json::to_vec(&EntryFile::new(key, response))
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        write_replace(&path, &bytes).await
    }

    async fn delete(&self, partition: &str) -> Result<bool, StoreError> {
        let dir = self.partition_dir(partition)?;
        let _guard = self.manifest.lock().await;
        let mut names = self.read_manifest().await?;
        let listed = names.iter().any(|name| name == partition);
        names.retain(|name| name != partition);
        if listed {
            self.write_manifest(&names).await?;
        }
        match fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(listed),
            Err(err) => Err(err.into()),
        }
    }

    async fn len(&self, partition: &str) -> Result<usize, StoreError> {
        let dir = self.partition_dir(partition)?;
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_entry = path.extension().is_some_and(|ext| ext == ENTRY_EXTENSION)
                && !path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with('.'));
            if is_entry {
                count += 1;
            }
        }
        Ok(count)
    }
}
