use std::{
    error::Error,
    fmt, io,
    path::{Path, PathBuf},
};

use serde::{Serialize, de::DeserializeOwned};
use tracing::{debug, info};

#[derive(Debug)]
pub(crate) enum StoreError {
    Io { path: PathBuf, source: io::Error },
    Corrupt { path: PathBuf, reason: String },
}

impl StoreError {
    pub(crate) fn corrupt(path: &Path, reason: impl Into<String>) -> Self {
        StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StoreError::Io { path, source } => {
                write!(f, "I/O error on store file {}: {source}", path.display())
            }
            StoreError::Corrupt { path, reason } => {
                write!(f, "Store file {} is corrupt: {reason}", path.display())
            }
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StoreError::Io { source, .. } => Some(source),
            StoreError::Corrupt { .. } => None,
        }
    }
}

/// Load a JSON document, creating the file with the default value when it
/// does not exist yet.
pub(crate) async fn load_or_create<T>(path: &Path) -> Result<T, StoreError>
where
    T: DeserializeOwned + Serialize + Default,
{
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            info!(path = %path.display(), "Store file not found, creating an empty one");
            let value = T::default();
            persist(path, &value).await?;
            return Ok(value);
        }
        Err(err) => return Err(StoreError::io(path, err)),
    };

    serde_json::from_str(&contents).map_err(|err| StoreError::corrupt(path, err.to_string()))
}

/// Atomically replace the file contents: the document is written to a
/// sibling temporary file which is then renamed over the original.
pub(crate) async fn persist<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let contents = serde_json::to_vec_pretty(value)
        .map_err(|err| StoreError::corrupt(path, format!("failed to serialize: {err}")))?;

    let mut tmp_path = path.as_os_str().to_owned();
    tmp_path.push(".tmp");
    let tmp_path = PathBuf::from(tmp_path);

    tokio::fs::write(&tmp_path, contents)
        .await
        .map_err(|err| StoreError::io(&tmp_path, err))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|err| StoreError::io(path, err))?;

    debug!(path = %path.display(), "Persisted store file");
    Ok(())
}
