//! Idempotent creation of destination directories.

use std::path::Path;

use datamover_transfer::{Location, RemoteEndpoint, RemoteError, TransferError};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Makes sure the directory at `location` exists.
///
/// Returns how many directories were created. A directory that already
/// exists, or that a concurrent walker created first, counts as zero.
pub async fn ensure_directory(
    location: &Location,
    cancel: &CancellationToken,
) -> Result<u64, TransferError> {
    if cancel.is_cancelled() {
        return Err(TransferError::Cancelled);
    }
    match location {
        Location::Local(path) => ensure_local(path).await,
        Location::RemoteDirectory { endpoint, path } => {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(TransferError::Cancelled),
                created = ensure_remote(endpoint, path) => created,
            }
        }
        Location::RemoteObject { .. } => Err(TransferError::UnsupportedLocation(format!(
            "{} is not a directory",
            location.display()
        ))),
    }
}

async fn ensure_local(path: &Path) -> Result<u64, TransferError> {
    let mut missing = 0u64;
    let mut probe = Some(path);
    while let Some(dir) = probe {
        if dir.as_os_str().is_empty() || tokio::fs::try_exists(dir).await? {
            break;
        }
        missing += 1;
        probe = dir.parent();
    }
    if missing == 0 {
        if !tokio::fs::metadata(path).await?.is_dir() {
            return Err(TransferError::Io(std::io::Error::other(format!(
                "{} exists and is not a directory",
                path.display()
            ))));
        }
        return Ok(0);
    }
    tokio::fs::create_dir_all(path).await?;
    debug!(path = %path.display(), created = missing, "created local directory");
    Ok(missing)
}

async fn ensure_remote(endpoint: &RemoteEndpoint, path: &str) -> Result<u64, TransferError> {
    let path = path.trim_matches('/');
    if path.is_empty() {
        return Ok(0);
    }
    match endpoint.directories.create_directory(path).await {
        Ok(()) => {
            debug!(endpoint = %endpoint.name, path, "created remote directory");
            Ok(1)
        }
        Err(RemoteError::AlreadyExists(_)) => Ok(0),
        Err(RemoteError::ParentMissing(_)) => create_ancestors(endpoint, path).await,
        Err(e) => Err(e.into()),
    }
}

/// Creates every prefix of `path` top-down, tolerating ones that exist.
async fn create_ancestors(endpoint: &RemoteEndpoint, path: &str) -> Result<u64, TransferError> {
    let mut created = 0;
    let mut prefix = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if !prefix.is_empty() {
            prefix.push('/');
        }
        prefix.push_str(segment);
        match endpoint.directories.create_directory(&prefix).await {
            Ok(()) => created += 1,
            Err(RemoteError::AlreadyExists(_)) => {}
            Err(RemoteError::ParentMissing(p)) => {
                return Err(TransferError::Remote(format!(
                    "parent missing and could not be created: {p}"
                )));
            }
            Err(e) => return Err(e.into()),
        }
    }
    debug!(endpoint = %endpoint.name, path, created, "created remote directory chain");
    Ok(created)
}
