//! Azure Blob Storage wrapper

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use anyhow::{Context, Result};
use azure_core::request_options::IfTags;
use azure_core::StatusCode;
use azure_identity::DefaultAzureCredential;
use azure_storage::StorageCredentials;
use azure_storage_blobs::blob::operations::GetBlobBuilder;
use azure_storage_blobs::prelude::{ClientBuilder, ContainerClient, Tags};
use futures_util::StreamExt;
use tokio::io::AsyncRead;
use tracing::debug;

use crate::config::{SecretSource, AZURE_STORAGE_ACCESS_KEY_VAR, AZURE_STORAGE_ACCOUNT_VAR};
use crate::{
    AzureConfig, BlobStore, ConcurrencyLimiter, ConditionalWriteOutcome, Download, DownloadError,
    RemotePath, RequestKind, StorageTags, UploadOptions, REMOTE_PATH_SEPARATOR,
};

pub struct AzureBlobStorage {
    client: ContainerClient,
    prefix_in_container: Option<String>,
    concurrency_limiter: ConcurrencyLimiter,
}

impl AzureBlobStorage {
    pub fn new(azure_config: &AzureConfig, secrets: &dyn SecretSource) -> Result<Self> {
        debug!(
            "Creating azure blob storage client for container {}",
            azure_config.container_name
        );

        let account = azure_config
            .storage_account
            .clone()
            .or_else(|| secrets.get(AZURE_STORAGE_ACCOUNT_VAR))
            .with_context(|| {
                format!("no storage account configured and no `{AZURE_STORAGE_ACCOUNT_VAR}` secret")
            })?;

        // If the secret source has an access key, use that, otherwise try the
        // token based credentials.
        let credentials = if let Some(access_key) = secrets.get(AZURE_STORAGE_ACCESS_KEY_VAR) {
            StorageCredentials::access_key(account.clone(), access_key)
        } else {
            let token_credential = DefaultAzureCredential::default();
            StorageCredentials::token_credential(Arc::new(token_credential))
        };

        let builder = ClientBuilder::new(account, credentials);

        let client = builder.container_client(azure_config.container_name.to_owned());

        Ok(AzureBlobStorage {
            client,
            prefix_in_container: azure_config.prefix_in_container.to_owned(),
            concurrency_limiter: ConcurrencyLimiter::new(azure_config.concurrency_limit.get()),
        })
    }

    pub fn relative_path_to_name(&self, path: &RemotePath) -> String {
        let path_string = path
            .get_path()
            .as_str()
            .trim_end_matches(REMOTE_PATH_SEPARATOR);
        match &self.prefix_in_container {
            Some(prefix) => {
                if prefix.ends_with(REMOTE_PATH_SEPARATOR) {
                    prefix.clone() + path_string
                } else {
                    format!("{prefix}{REMOTE_PATH_SEPARATOR}{path_string}")
                }
            }
            None => path_string.to_string(),
        }
    }

    async fn download_for_builder(
        &self,
        builder: GetBlobBuilder,
    ) -> Result<Download, DownloadError> {
        let mut response = builder.into_stream();

        // The response chunks are collected into one owned buffer, so callers
        // never hold a half-read network stream.
        let mut buf = Vec::new();
        while let Some(part) = response.next().await {
            let part = part.map_err(to_download_error)?;
            let data = part
                .data
                .collect()
                .await
                .map_err(|e| DownloadError::Other(e.into()))?;
            buf.extend_from_slice(&data.slice(..));
        }
        Ok(Download {
            download_stream: Box::pin(Cursor::new(buf)),
        })
    }

    async fn permit(&self, kind: RequestKind) -> tokio::sync::SemaphorePermit<'_> {
        self.concurrency_limiter
            .acquire(kind)
            .await
            .expect("semaphore is never closed")
    }
}

fn to_azure_tags(tags: &StorageTags) -> Tags {
    let mut res = Tags::new();
    for (k, v) in tags.0.iter() {
        res.insert(k.clone(), v.clone());
    }
    res
}

fn from_azure_tags(tags: Tags) -> StorageTags {
    let mut res = HashMap::new();
    for (k, v) in tags.into_iter() {
        res.insert(k, v);
    }
    StorageTags(res)
}

fn to_download_error(error: azure_core::Error) -> DownloadError {
    if let Some(http_err) = error.as_http_error() {
        match http_err.status() {
            StatusCode::NotFound => DownloadError::NotFound,
            StatusCode::BadRequest => DownloadError::BadInput(anyhow::Error::new(error)),
            _ => DownloadError::Other(anyhow::Error::new(error)),
        }
    } else {
        DownloadError::Other(error.into())
    }
}

/// The store rejects a conditioned write with 412 and the `ConditionNotMet`
/// error code; both are checked because the code is absent from some error
/// payloads.
fn as_condition_rejection(error: &azure_core::Error) -> Option<String> {
    let http_err = error.as_http_error()?;
    let rejected = http_err.status() == StatusCode::PreconditionFailed
        || http_err.error_code() == Some("ConditionNotMet");
    rejected.then(|| error.to_string())
}

#[async_trait::async_trait]
impl BlobStore for AzureBlobStorage {
    async fn create_container_if_not_exists(&self) -> anyhow::Result<()> {
        let _permit = self.permit(RequestKind::Put).await;

        match self.client.create().into_future().await {
            Ok(_response) => Ok(()),
            Err(e) => {
                if let Some(http_err) = e.as_http_error() {
                    if http_err.status() == StatusCode::Conflict {
                        return Ok(());
                    }
                }
                Err(anyhow::Error::new(e))
            }
        }
    }

    async fn delete_container_if_exists(&self) -> anyhow::Result<()> {
        let _permit = self.permit(RequestKind::Delete).await;

        match self.client.delete().into_future().await {
            Ok(_response) => Ok(()),
            Err(e) => {
                if let Some(http_err) = e.as_http_error() {
                    if http_err.status() == StatusCode::NotFound {
                        return Ok(());
                    }
                }
                Err(anyhow::Error::new(e))
            }
        }
    }

    async fn upload(
        &self,
        mut from: impl AsyncRead + Unpin + Send + Sync + 'static,
        data_size_bytes: usize,
        to: &RemotePath,
        opts: &UploadOptions,
    ) -> anyhow::Result<ConditionalWriteOutcome> {
        let _permit = self.permit(RequestKind::Put).await;
        let blob_client = self.client.blob_client(self.relative_path_to_name(to));

        // The whole source is materialized before the request goes out; a
        // rejected conditioned write must never observe a half-consumed
        // source stream.
        let mut buf = Vec::with_capacity(data_size_bytes);
        tokio::io::copy(&mut from, &mut buf).await?;
        let body = azure_core::Body::Bytes(buf.into());

        let mut builder = blob_client.put_block_blob(body);

        if let Some(tags) = &opts.tags {
            builder = builder.tags(to_azure_tags(tags));
        }

        if let Some(condition) = &opts.condition {
            builder = builder.if_tags(IfTags::from(condition.to_expression()));
        }

        match builder.into_future().await {
            Ok(_response) => Ok(ConditionalWriteOutcome::Applied),
            Err(e) => match as_condition_rejection(&e) {
                Some(detail) => Ok(ConditionalWriteOutcome::ConditionNotMet(detail)),
                None => Err(anyhow::Error::new(e)),
            },
        }
    }

    async fn download(&self, from: &RemotePath) -> Result<Download, DownloadError> {
        let _permit = self.permit(RequestKind::Get).await;
        let blob_client = self.client.blob_client(self.relative_path_to_name(from));

        let builder = blob_client.get();

        self.download_for_builder(builder).await
    }

    async fn get_tags(&self, from: &RemotePath) -> Result<StorageTags, DownloadError> {
        let _permit = self.permit(RequestKind::Head).await;
        let blob_client = self.client.blob_client(self.relative_path_to_name(from));

        let response = blob_client
            .get_tags()
            .into_future()
            .await
            .map_err(to_download_error)?;

        Ok(from_azure_tags(response.tags))
    }
}
