//! Local file system blob store with conditional-write semantics.
//!
//! This is the oracle backend for the harness tests: it evaluates tag
//! conditions the way a correct store must. An absent object passes any
//! condition; an existing object is checked against its recorded tags, and
//! the check plus the write happen under one lock, so no rejected write can
//! leave partial state behind.

use std::collections::HashMap;
use std::io::Cursor;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use tokio::fs;
use tokio::io::AsyncRead;
use tracing::debug;

use crate::{
    BlobStore, ConditionalWriteOutcome, Download, DownloadError, RemotePath, StorageTags,
    UploadOptions,
};

pub struct LocalFs {
    storage_root: Utf8PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl LocalFs {
    /// Attaches to `storage_root` as the working container. The directory is
    /// only created by [`BlobStore::create_container_if_not_exists`].
    pub fn new(storage_root: Utf8PathBuf) -> Self {
        Self {
            storage_root,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn target_file(&self, path: &RemotePath) -> Utf8PathBuf {
        self.storage_root.join(path.get_path())
    }

    async fn read_tags(&self, target_file: &Utf8Path) -> anyhow::Result<StorageTags> {
        let tags_file = path_with_suffix_extension(target_file, "tags");
        let bytes = match fs::read(&tags_file).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(StorageTags::default())
            }
            Err(e) => {
                return Err(anyhow::Error::new(e))
                    .with_context(|| format!("Failed to read tags file {tags_file}"))
            }
        };
        let tags: HashMap<String, String> = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse tags file {tags_file}"))?;
        Ok(StorageTags(tags))
    }
}

fn path_with_suffix_extension(original_path: &Utf8Path, suffix: &str) -> Utf8PathBuf {
    let new_extension = match original_path.extension() {
        Some(extension) => format!("{extension}.{suffix}"),
        None => suffix.to_string(),
    };
    original_path.with_extension(new_extension)
}

fn file_error_to_download_error(e: std::io::Error) -> DownloadError {
    if e.kind() == std::io::ErrorKind::NotFound {
        DownloadError::NotFound
    } else {
        DownloadError::Other(anyhow::Error::new(e))
    }
}

#[async_trait::async_trait]
impl BlobStore for LocalFs {
    async fn create_container_if_not_exists(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.storage_root)
            .await
            .with_context(|| format!("Failed to create storage root {}", self.storage_root))
    }

    async fn delete_container_if_exists(&self) -> anyhow::Result<()> {
        match fs::remove_dir_all(&self.storage_root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow::Error::new(e))
                .with_context(|| format!("Failed to remove storage root {}", self.storage_root)),
        }
    }

    async fn upload(
        &self,
        mut from: impl AsyncRead + Unpin + Send + Sync + 'static,
        data_size_bytes: usize,
        to: &RemotePath,
        opts: &UploadOptions,
    ) -> anyhow::Result<ConditionalWriteOutcome> {
        let mut buf = Vec::with_capacity(data_size_bytes);
        tokio::io::copy(&mut from, &mut buf).await?;

        // Condition evaluation and the write must be one atomic step.
        let _guard = self.write_lock.lock().await;

        let target_file = self.target_file(to);

        if let Some(condition) = &opts.condition {
            if fs::try_exists(&target_file).await? {
                let existing = self.read_tags(&target_file).await?;
                if !condition.holds_for(&existing) {
                    let detail = format!(
                        "condition {condition} does not hold for {to} with tags {:?}",
                        existing.0
                    );
                    debug!("Rejecting conditioned write: {detail}");
                    return Ok(ConditionalWriteOutcome::ConditionNotMet(detail));
                }
            }
        }

        if let Some(parent) = target_file.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create parent directories of {target_file}"))?;
        }

        // Tags land before the content rename, so an applied write is never
        // visible with the previous object's tags.
        let tags_file = path_with_suffix_extension(&target_file, "tags");
        match &opts.tags {
            Some(tags) if !tags.is_empty() => {
                let serialized = serde_json::to_vec(&tags.0).context("Failed to encode tags")?;
                fs::write(&tags_file, serialized)
                    .await
                    .with_context(|| format!("Failed to write tags file {tags_file}"))?;
            }
            _ => match fs::remove_file(&tags_file).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(anyhow::Error::new(e))
                        .with_context(|| format!("Failed to remove tags file {tags_file}"))
                }
            },
        }

        let temp_file = path_with_suffix_extension(&target_file, "temp");
        fs::write(&temp_file, &buf)
            .await
            .with_context(|| format!("Failed to write temp file {temp_file}"))?;
        fs::rename(&temp_file, &target_file)
            .await
            .with_context(|| format!("Failed to move temp file into place at {target_file}"))?;

        Ok(ConditionalWriteOutcome::Applied)
    }

    async fn download(&self, from: &RemotePath) -> Result<Download, DownloadError> {
        let buf = fs::read(self.target_file(from))
            .await
            .map_err(file_error_to_download_error)?;
        Ok(Download {
            download_stream: Box::pin(Cursor::new(buf)),
        })
    }

    async fn get_tags(&self, from: &RemotePath) -> Result<StorageTags, DownloadError> {
        let target_file = self.target_file(from);
        match fs::try_exists(&target_file).await {
            Ok(true) => {}
            Ok(false) => return Err(DownloadError::NotFound),
            Err(e) => return Err(DownloadError::Other(anyhow::Error::new(e))),
        }
        self.read_tags(&target_file)
            .await
            .map_err(DownloadError::Other)
    }
}
