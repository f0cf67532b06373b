//! A reproduction harness for a conditional-upload race against blob storage.
//!
//! A tag-conditioned upload is supposed to be atomic: either the new content
//! and tags both become visible, or the write is rejected and nothing
//! changes. [`ConditionalCopyHarness`] drives a blob store through a fixed
//! sequence of conditioned copies that demonstrates how a rejected upload can
//! instead leave the destination in a "limbo" state, where every later
//! conditioned write keeps failing with `ConditionNotMet` (HTTP 412).
//!
//! [`BlobStore`] is the narrow storage surface the harness needs, with two
//! implementations:
//!   * [`AzureBlobStorage`] talks to a real Azure container, where the race
//!     was originally observed
//!   * [`LocalFs`] keeps objects on the local file system and evaluates tag
//!     conditions the way a correct store would, so the harness can be tested
//!     without cloud credentials

mod azure_blob;
mod config;
mod error;
mod harness;
mod local_fs;
mod support;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io;
use tokio::sync::{AcquireError, Semaphore, SemaphorePermit};
use tracing::info;

pub use self::azure_blob::AzureBlobStorage;
pub use self::config::{
    AzureConfig, EnvSecrets, ReproConfig, SecretSource, StorageKind, AZURE_STORAGE_ACCESS_KEY_VAR,
    AZURE_STORAGE_ACCOUNT_VAR,
};
pub use self::error::DownloadError;
pub use self::harness::{
    ConditionalCopyHarness, DestinationState, SequenceReport, OVERWRITE_LOCAL_ID, RACING_LOCAL_ID,
    SOURCE_CONTENT,
};
pub use self::local_fs::LocalFs;
pub use self::support::drain_to_vec;

/// Azure rate-limits reads and writes separately, so the limiter does too.
pub const DEFAULT_AZURE_CONCURRENCY_LIMIT: usize = 100;

pub(crate) const REMOTE_PATH_SEPARATOR: char = '/';

/// A way to uniquely reference an object inside the working container.
///
/// The path is always relative; backends map it onto their own namespace
/// (a blob name, a file under the storage root).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RemotePath(Utf8PathBuf);

impl RemotePath {
    pub fn new(relative_path: &Utf8Path) -> anyhow::Result<Self> {
        anyhow::ensure!(
            relative_path.is_relative(),
            "Path {relative_path:?} is not relative"
        );
        Ok(Self(relative_path.to_path_buf()))
    }

    pub fn from_string(relative_path: &str) -> anyhow::Result<Self> {
        Self::new(Utf8Path::new(relative_path))
    }

    pub fn get_path(&self) -> &Utf8PathBuf {
        &self.0
    }

    /// Last path segment, i.e. the object's own name without any prefix.
    pub fn object_name(&self) -> Option<&str> {
        self.0.file_name()
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key-value tags attached to an object at write time, queryable
/// independently of its content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageTags(pub HashMap<String, String>);

impl StorageTags {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, tag: &str) -> Option<&str> {
        self.0.get(tag).map(String::as_str)
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for StorageTags {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// A predicate over an object's tags, evaluated by the store atomically with
/// the write it accompanies.
///
/// Tag values compare as strings, lexicographically; callers that encode
/// numbers into tags must keep them at a fixed width for the ordering to
/// match the numeric one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagCondition {
    /// Holds when the existing object carries `tag` with a value sorting
    /// strictly below `literal`. An absent object passes any condition; an
    /// existing object without the tag passes none.
    LessThan { tag: String, literal: String },
}

impl TagCondition {
    pub fn less_than(tag: impl Into<String>, literal: impl Into<String>) -> Self {
        TagCondition::LessThan {
            tag: tag.into(),
            literal: literal.into(),
        }
    }

    /// Renders the provider's condition expression, e.g. `"LocalId" < '123'`.
    pub fn to_expression(&self) -> String {
        match self {
            TagCondition::LessThan { tag, literal } => format!(r#""{tag}" < '{literal}'"#),
        }
    }

    /// Evaluates the predicate against the tags of an existing object.
    pub(crate) fn holds_for(&self, tags: &StorageTags) -> bool {
        match self {
            TagCondition::LessThan { tag, literal } => match tags.get(tag) {
                Some(value) => value < literal.as_str(),
                None => false,
            },
        }
    }
}

impl fmt::Display for TagCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_expression())
    }
}

/// What the store did with a conditioned write.
///
/// A rejected condition is an expected observation, not an error: the harness
/// exists to record these rejections. Transport and store failures stay in
/// the `Err` channel of the calling operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConditionalWriteOutcome {
    /// The write went through; content and tags are both visible.
    Applied,
    /// The store rejected the write with `ConditionNotMet` (412); the detail
    /// string is the store's own description of the rejection.
    ConditionNotMet(String),
}

impl ConditionalWriteOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ConditionalWriteOutcome::Applied)
    }

    /// Errors out on a rejection, for call sites that passed no condition and
    /// therefore must never see one.
    pub fn ensure_applied(self) -> anyhow::Result<()> {
        match self {
            ConditionalWriteOutcome::Applied => Ok(()),
            ConditionalWriteOutcome::ConditionNotMet(detail) => anyhow::bail!(
                "store reported a conditional rejection for an unconditioned write: {detail}"
            ),
        }
    }
}

/// Tags and condition accompanying an upload.
#[derive(Debug, Clone, Default)]
pub struct UploadOptions {
    pub tags: Option<StorageTags>,
    pub condition: Option<TagCondition>,
}

/// A downloaded object's content.
///
/// The stream is already fully owned by the client by the time this struct
/// exists; see [`drain_to_vec`] for turning it into a buffer.
pub struct Download {
    pub download_stream: std::pin::Pin<Box<dyn io::AsyncRead + Send + Sync + Unpin>>,
}

/// Storage API the reproduction needs: container lifecycle, conditioned
/// uploads, downloads and tag reads, nothing else.
#[async_trait::async_trait]
pub trait BlobStore: Send + Sync {
    /// Idempotent; succeeds when the container is already there.
    async fn create_container_if_not_exists(&self) -> anyhow::Result<()>;

    /// Idempotent; succeeds when the container is already gone.
    async fn delete_container_if_exists(&self) -> anyhow::Result<()>;

    /// Writes an object, optionally tagged and conditioned.
    ///
    /// The source is drained into an owned buffer before any request goes
    /// out: an upload must never re-stream a half-consumed network read,
    /// because a rejected conditioned write can then leave the destination
    /// with partial state.
    async fn upload(
        &self,
        from: impl io::AsyncRead + Unpin + Send + Sync + 'static,
        data_size_bytes: usize,
        to: &RemotePath,
        opts: &UploadOptions,
    ) -> anyhow::Result<ConditionalWriteOutcome>;

    async fn download(&self, from: &RemotePath) -> Result<Download, DownloadError>;

    /// Tags recorded when the object was last written; empty for untagged
    /// objects, `NotFound` for absent ones.
    async fn get_tags(&self, from: &RemotePath) -> Result<StorageTags, DownloadError>;
}

/// Dispatch over the configured backend.
pub enum GenericBlobStorage {
    AzureBlob(AzureBlobStorage),
    LocalFs(LocalFs),
}

impl GenericBlobStorage {
    pub fn from_config(
        config: &ReproConfig,
        secrets: &dyn SecretSource,
    ) -> anyhow::Result<Self> {
        match &config.storage {
            StorageKind::LocalFs { local_path } => {
                info!("Using fs root '{local_path}' as the blob store");
                Ok(GenericBlobStorage::LocalFs(LocalFs::new(local_path.clone())))
            }
            StorageKind::AzureContainer(azure_config) => {
                info!(
                    "Using azure container '{}' as the blob store, prefix in container: '{:?}'",
                    azure_config.container_name, azure_config.prefix_in_container
                );
                AzureBlobStorage::new(azure_config, secrets).map(GenericBlobStorage::AzureBlob)
            }
        }
    }

    pub async fn create_container_if_not_exists(&self) -> anyhow::Result<()> {
        match self {
            Self::AzureBlob(s) => s.create_container_if_not_exists().await,
            Self::LocalFs(s) => s.create_container_if_not_exists().await,
        }
    }

    pub async fn delete_container_if_exists(&self) -> anyhow::Result<()> {
        match self {
            Self::AzureBlob(s) => s.delete_container_if_exists().await,
            Self::LocalFs(s) => s.delete_container_if_exists().await,
        }
    }

    pub async fn upload(
        &self,
        from: impl io::AsyncRead + Unpin + Send + Sync + 'static,
        data_size_bytes: usize,
        to: &RemotePath,
        opts: &UploadOptions,
    ) -> anyhow::Result<ConditionalWriteOutcome> {
        match self {
            Self::AzureBlob(s) => s.upload(from, data_size_bytes, to, opts).await,
            Self::LocalFs(s) => s.upload(from, data_size_bytes, to, opts).await,
        }
    }

    pub async fn download(&self, from: &RemotePath) -> Result<Download, DownloadError> {
        match self {
            Self::AzureBlob(s) => s.download(from).await,
            Self::LocalFs(s) => s.download(from).await,
        }
    }

    pub async fn get_tags(&self, from: &RemotePath) -> Result<StorageTags, DownloadError> {
        match self {
            Self::AzureBlob(s) => s.get_tags(from).await,
            Self::LocalFs(s) => s.get_tags(from).await,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub(crate) enum RequestKind {
    Get,
    Put,
    Delete,
    Head,
}

/// Bounds in-flight requests against the remote store, reads and writes
/// separately.
pub(crate) struct ConcurrencyLimiter {
    read: Arc<Semaphore>,
    write: Arc<Semaphore>,
}

impl ConcurrencyLimiter {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            read: Arc::new(Semaphore::new(limit)),
            write: Arc::new(Semaphore::new(limit)),
        }
    }

    fn for_kind(&self, kind: RequestKind) -> &Semaphore {
        match kind {
            RequestKind::Get | RequestKind::Head => &self.read,
            RequestKind::Put | RequestKind::Delete => &self.write,
        }
    }

    pub(crate) async fn acquire(
        &self,
        kind: RequestKind,
    ) -> Result<SemaphorePermit<'_>, AcquireError> {
        self.for_kind(kind).acquire().await
    }
}
