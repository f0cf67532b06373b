use std::env;
use std::num::NonZeroUsize;
use std::str::FromStr;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::DEFAULT_AZURE_CONCURRENCY_LIMIT;

/// Environment variable holding the Azure storage account name.
pub const AZURE_STORAGE_ACCOUNT_VAR: &str = "AZURE_STORAGE_ACCOUNT";
/// Environment variable holding the shared access key for the account.
pub const AZURE_STORAGE_ACCESS_KEY_VAR: &str = "AZURE_STORAGE_ACCESS_KEY";

/// Blob store configuration, enough for creating a client for that store.
///
/// Everything the harness needs is in here or reachable through the
/// [`SecretSource`] handed to the client constructor; nothing reads ambient
/// process state directly.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ReproConfig {
    /// The storage connection configuration.
    #[serde(flatten)]
    pub storage: StorageKind,
}

/// A kind of blob store to connect to, with its connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum StorageKind {
    /// Storage based on local file system.
    /// Specify a root folder to place all stored objects into.
    LocalFs { local_path: Utf8PathBuf },
    /// Azure Blob based storage, storing all objects in the container
    /// specified by the config
    AzureContainer(AzureConfig),
}

/// Azure container coordinates; credentials come from the [`SecretSource`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AzureConfig {
    /// Name of the container to connect to.
    pub container_name: String,
    /// Name of the storage account the container is inside of.
    /// Falls back to [`AZURE_STORAGE_ACCOUNT_VAR`] from the secret source.
    pub storage_account: Option<String>,
    /// A "subfolder" in the container, to use the same container separately
    /// by multiple harness runs at once.
    pub prefix_in_container: Option<String>,
    /// Azure has various limits on its API calls, we need not to exceed those.
    #[serde(default = "default_azure_concurrency_limit")]
    pub concurrency_limit: NonZeroUsize,
}

fn default_azure_concurrency_limit() -> NonZeroUsize {
    NonZeroUsize::new(DEFAULT_AZURE_CONCURRENCY_LIMIT).unwrap()
}

impl ReproConfig {
    pub fn from_toml_str(input: &str) -> anyhow::Result<ReproConfig> {
        let toml_document = toml_edit::DocumentMut::from_str(input)?;
        Ok(toml_edit::de::from_document(toml_document)?)
    }
}

/// Where credential material comes from.
///
/// The harness never reads the environment or a secret store on its own; the
/// caller decides the source once and passes it in. [`EnvSecrets`] is the
/// default for developer machines and CI.
pub trait SecretSource: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
}

/// Process-environment backed [`SecretSource`].
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvSecrets;

impl SecretSource for EnvSecrets {
    fn get(&self, name: &str) -> Option<String> {
        env::var(name).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(input: &str) -> anyhow::Result<ReproConfig> {
        ReproConfig::from_toml_str(input)
    }

    #[test]
    fn parse_localfs_config() {
        let input = "local_path = '.'";

        let config = parse(input).unwrap();

        assert_eq!(
            config,
            ReproConfig {
                storage: StorageKind::LocalFs {
                    local_path: Utf8PathBuf::from(".")
                },
            }
        );
    }

    #[test]
    fn parse_azure_config() {
        let toml = "\
    container_name = 'repro'
    storage_account = 'devstoreaccount1'
    prefix_in_container = 'run-1/'
    ";

        let config = parse(toml).unwrap();

        assert_eq!(
            config,
            ReproConfig {
                storage: StorageKind::AzureContainer(AzureConfig {
                    container_name: "repro".into(),
                    storage_account: Some("devstoreaccount1".into()),
                    prefix_in_container: Some("run-1/".into()),
                    concurrency_limit: default_azure_concurrency_limit(),
                }),
            }
        );
    }

    #[test]
    fn azure_config_requires_container_name() {
        assert!(parse("storage_account = 'devstoreaccount1'").is_err());
    }

    #[test]
    fn env_secrets_reads_process_environment() {
        let name = "CONDITIONAL_COPY_REPRO_TEST_SECRET";
        env::set_var(name, "shhh");
        assert_eq!(EnvSecrets.get(name).as_deref(), Some("shhh"));
        env::remove_var(name);
        assert_eq!(EnvSecrets.get(name), None);
    }
}
