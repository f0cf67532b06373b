use camino_tempfile::Utf8TempDir;
use conditional_copy_repro::{
    ConditionalCopyHarness, EnvSecrets, GenericBlobStorage, ReproConfig, StorageKind,
};
use once_cell::sync::OnceCell;

pub(crate) fn ensure_logging_ready() {
    static LOGGING_DONE: OnceCell<()> = OnceCell::new();
    LOGGING_DONE.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
            )
            .with_test_writer()
            .init();
    });
}

/// A harness over a scratch file system store; the tempdir guard must be kept
/// alive for the duration of the test.
pub(crate) fn local_fs_harness() -> anyhow::Result<(Utf8TempDir, ConditionalCopyHarness)> {
    let tempdir = camino_tempfile::tempdir()?;
    let config = ReproConfig {
        storage: StorageKind::LocalFs {
            local_path: tempdir.path().join("repro"),
        },
    };
    let storage = GenericBlobStorage::from_config(&config, &EnvSecrets)?;
    Ok((tempdir, ConditionalCopyHarness::new(storage)?))
}
