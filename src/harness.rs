//! The conditioned-copy sequence that demonstrates the limbo state.
//!
//! The steps are meant to run in the order they are declared in; each one is
//! an independent operation sharing only the store handle, so a single step
//! can also be re-run on its own against a store that is already in the
//! matching state.

use std::io::Cursor;

use anyhow::Context;
use tracing::{info, warn};

use crate::support::drain_to_vec;
use crate::{
    ConditionalWriteOutcome, DownloadError, GenericBlobStorage, RemotePath, TagCondition,
    UploadOptions,
};

/// Content the source object is seeded with.
pub const SOURCE_CONTENT: &[u8] = b"Original content";

/// Id attached by the first, racing conditioned copy.
pub const RACING_LOCAL_ID: u64 = 123;
/// Larger id used by the follow-up conditioned overwrite.
pub const OVERWRITE_LOCAL_ID: u64 = 456;

const SOURCE_KEY: &str = "aabbccdd-1122-3344-5566-778899aabbcc.txt";
const LOCAL_ID_TAG: &str = "LocalId";

/// What a probe of the destination object observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestinationState {
    Absent,
    /// The destination exists and still carries a `LocalId` tag from a
    /// conditioned write. When the write that attached the tag was reported
    /// as rejected, this is the limbo state: every further conditioned write
    /// against the object keeps failing with `ConditionNotMet`.
    Tagged { local_id: String },
    /// The destination exists with no tags; an unconditioned overwrite has
    /// cleared whatever was there.
    Untagged,
}

/// Outcomes of one full run of the sequence.
#[derive(Debug)]
pub struct SequenceReport {
    pub racing_copy: ConditionalWriteOutcome,
    pub buffered_overwrite: ConditionalWriteOutcome,
    pub final_state: DestinationState,
}

/// Drives the store through the conditioned-copy race, step by step.
pub struct ConditionalCopyHarness {
    storage: GenericBlobStorage,
    source: RemotePath,
    destination: RemotePath,
}

impl ConditionalCopyHarness {
    pub fn new(storage: GenericBlobStorage) -> anyhow::Result<Self> {
        let source = RemotePath::from_string(SOURCE_KEY)?;
        let destination = destination_for(&source)?;
        Ok(Self {
            storage,
            source,
            destination,
        })
    }

    pub fn storage(&self) -> &GenericBlobStorage {
        &self.storage
    }

    pub fn source(&self) -> &RemotePath {
        &self.source
    }

    pub fn destination(&self) -> &RemotePath {
        &self.destination
    }

    /// Deletes the working container, absent or not.
    pub async fn reset(&self) -> anyhow::Result<()> {
        self.storage.delete_container_if_exists().await
    }

    /// Ensures the container exists and writes the source object, untagged
    /// and unconditioned.
    pub async fn seed_source(&self) -> anyhow::Result<()> {
        self.storage.create_container_if_not_exists().await?;

        self.storage
            .upload(
                Cursor::new(SOURCE_CONTENT),
                SOURCE_CONTENT.len(),
                &self.source,
                &UploadOptions::default(),
            )
            .await?
            .ensure_applied()?;

        info!("Blob {} has been created", self.source);
        Ok(())
    }

    /// Copies the source to the destination with tag `LocalId = local_id`,
    /// conditioned on `"LocalId" < 'local_id'`.
    ///
    /// Against a correct store and an absent destination this applies; the
    /// race under reproduction instead reports `ConditionNotMet` and leaves
    /// the destination in the limbo state. Both are returned as ordinary
    /// outcomes; only transport and store failures error out.
    pub async fn racing_conditioned_copy(
        &self,
        local_id: u64,
    ) -> anyhow::Result<ConditionalWriteOutcome> {
        let outcome = self.conditioned_copy_to_destination(local_id).await?;
        match &outcome {
            ConditionalWriteOutcome::Applied => {
                info!(
                    "Copied {} to {} under {}={}",
                    self.source, self.destination, LOCAL_ID_TAG, local_id
                );
            }
            ConditionalWriteOutcome::ConditionNotMet(_) => {
                info!("The blob {} is now in a limbo state", self.destination);
            }
        }
        Ok(outcome)
    }

    /// Retries the conditioned copy with a larger id and a fully buffered
    /// source. Both outcomes are valid completions: an applied write means
    /// the destination escaped the limbo state, a rejection means it is stuck
    /// there even though nothing holds a partially-read stream anymore.
    pub async fn conditioned_overwrite_with_buffering(
        &self,
        local_id: u64,
    ) -> anyhow::Result<ConditionalWriteOutcome> {
        let outcome = self.conditioned_copy_to_destination(local_id).await?;
        match &outcome {
            ConditionalWriteOutcome::Applied => {
                info!(
                    "Conditioned overwrite of {} applied under {}={}",
                    self.destination, LOCAL_ID_TAG, local_id
                );
            }
            ConditionalWriteOutcome::ConditionNotMet(detail) => {
                warn!(
                    "Failed to copy {} to {} despite the buffered source",
                    self.source, self.destination
                );
                info!(
                    "Reason: {} reported as existing with condition not met (412): {detail}",
                    self.destination
                );
            }
        }
        Ok(outcome)
    }

    /// Unconditioned overwrite of the destination with the source content,
    /// clearing tags and any limbo state. Terminal; after this, conditioned
    /// writes start from a clean slate.
    pub async fn force_overwrite(&self) -> anyhow::Result<()> {
        let source_bytes = self.download_source().await?;
        let len = source_bytes.len();

        self.storage
            .upload(
                Cursor::new(source_bytes),
                len,
                &self.destination,
                &UploadOptions::default(),
            )
            .await?
            .ensure_applied()?;

        info!(
            "Blob {} has been overwritten unconditionally",
            self.destination
        );
        Ok(())
    }

    /// Resolves what state the destination object is currently in.
    pub async fn destination_state(&self) -> anyhow::Result<DestinationState> {
        match self.storage.get_tags(&self.destination).await {
            Ok(tags) => Ok(match tags.get(LOCAL_ID_TAG) {
                Some(local_id) => DestinationState::Tagged {
                    local_id: local_id.to_string(),
                },
                None => DestinationState::Untagged,
            }),
            Err(DownloadError::NotFound) => Ok(DestinationState::Absent),
            Err(other) => Err(other.into()),
        }
    }

    /// Runs the whole sequence in order: reset, seed, racing copy, buffered
    /// overwrite, forced overwrite, and a final probe of the destination.
    pub async fn run_full_sequence(&self) -> anyhow::Result<SequenceReport> {
        self.reset().await.context("reset")?;
        self.seed_source().await.context("seed source")?;

        let racing_copy = self
            .racing_conditioned_copy(RACING_LOCAL_ID)
            .await
            .context("racing conditioned copy")?;

        let buffered_overwrite = self
            .conditioned_overwrite_with_buffering(OVERWRITE_LOCAL_ID)
            .await
            .context("conditioned overwrite with buffering")?;

        self.force_overwrite().await.context("force overwrite")?;

        let final_state = self
            .destination_state()
            .await
            .context("final destination probe")?;

        Ok(SequenceReport {
            racing_copy,
            buffered_overwrite,
            final_state,
        })
    }

    async fn conditioned_copy_to_destination(
        &self,
        local_id: u64,
    ) -> anyhow::Result<ConditionalWriteOutcome> {
        let source_bytes = self.download_source().await?;
        let len = source_bytes.len();
        let literal = local_id.to_string();

        let opts = UploadOptions {
            tags: Some(
                [(LOCAL_ID_TAG.to_string(), literal.clone())]
                    .into_iter()
                    .collect(),
            ),
            condition: Some(TagCondition::less_than(LOCAL_ID_TAG, literal)),
        };

        self.storage
            .upload(Cursor::new(source_bytes), len, &self.destination, &opts)
            .await
    }

    async fn download_source(&self) -> anyhow::Result<Vec<u8>> {
        let download = self
            .storage
            .download(&self.source)
            .await
            .with_context(|| {
                format!(
                    "source blob {} must be seeded before this step",
                    self.source
                )
            })?;
        Ok(drain_to_vec(download).await?)
    }
}

/// The destination sits under a directory named after the first two
/// characters of the source object's name.
fn destination_for(source: &RemotePath) -> anyhow::Result<RemotePath> {
    let name = source
        .object_name()
        .context("source path has no object name")?;
    let prefix: String = name.chars().take(2).collect();
    anyhow::ensure!(!prefix.is_empty(), "source object name is empty");
    RemotePath::from_string(&format!("{prefix}/{name}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_sits_under_two_character_prefix() {
        let source = RemotePath::from_string(SOURCE_KEY).unwrap();
        let destination = destination_for(&source).unwrap();
        assert_eq!(
            destination.get_path().as_str(),
            "aa/aabbccdd-1122-3344-5566-778899aabbcc.txt"
        );
    }

    #[test]
    fn overwrite_id_sorts_above_racing_id_as_strings() {
        // Tag values compare lexicographically; the fixed ids are chosen so
        // the string order matches the numeric one.
        assert!(RACING_LOCAL_ID.to_string() < OVERWRITE_LOCAL_ID.to_string());
    }
}
