#[derive(Debug)]
pub enum DownloadError {
    /// Validation or other error happened due to user input.
    BadInput(anyhow::Error),
    /// The object was not found in the store.
    NotFound,
    /// The object was found in the store, but the download failed.
    Other(anyhow::Error),
}

impl std::fmt::Display for DownloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DownloadError::BadInput(e) => {
                write!(f, "Failed to download an object due to user input: {e}")
            }
            DownloadError::NotFound => write!(f, "No object found for the remote path given"),
            DownloadError::Other(e) => write!(f, "Failed to download an object: {e:?}"),
        }
    }
}

impl std::error::Error for DownloadError {}

impl DownloadError {
    /// Returns true if retrying the download cannot change the outcome.
    pub fn is_permanent(&self) -> bool {
        use DownloadError::*;
        match self {
            BadInput(_) => true,
            NotFound => true,
            Other(_) => false,
        }
    }
}
