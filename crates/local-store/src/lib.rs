//! A directory tree served through the remote endpoint contracts.
//!
//! Object paths are `/`-separated and relative to the store root.
//! Listings are sorted by name and paged; the continuation token is the
//! last name returned, so a resumed listing starts strictly after it.

use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use datamover_transfer::{
    AccessConditions, BoxFuture, ListPage, ListToken, ListedEntry, ObjectMetadata, RangeRead,
    RemoteDirectoryClient, RemoteError, RemoteObjectClient, validate_relative_path,
};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

/// Default number of entries per listing page.
pub const DEFAULT_PAGE_SIZE: usize = 1000;

/// Type tag reported for regular files.
pub const FILE_TYPE_TAG: &str = "file";

/// Filesystem-backed endpoint rooted at a directory.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    page_size: usize,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    /// Sets the listing page size (minimum 1).
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps an object path to a filesystem path below the root.
    fn resolve(&self, object: &str) -> Result<PathBuf, RemoteError> {
        if object.is_empty() {
            return Ok(self.root.clone());
        }
        validate_relative_path(object).map_err(|e| RemoteError::Generic(e.to_string()))?;
        Ok(object
            .split('/')
            .filter(|s| !s.is_empty() && *s != ".")
            .fold(self.root.clone(), |acc, segment| acc.join(segment)))
    }

    async fn metadata(
        &self,
        object: &str,
        conditions: &AccessConditions,
    ) -> Result<(PathBuf, ObjectMetadata), RemoteError> {
        let path = self.resolve(object)?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| io_to_remote(e, object))?;
        if !meta.is_file() {
            return Err(RemoteError::NotFound(object.to_string()));
        }

        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let identity_tag = format!("{:x}-{mtime:x}", meta.len());

        if let Some(expected) = &conditions.if_match
            && *expected != identity_tag
        {
            return Err(RemoteError::PreconditionFailed(format!(
                "{object}: expected {expected}, found {identity_tag}"
            )));
        }

        Ok((
            path,
            ObjectMetadata {
                length: meta.len(),
                identity_tag,
                type_tag: FILE_TYPE_TAG.to_string(),
            },
        ))
    }
}

fn io_to_remote(e: std::io::Error, object: &str) -> RemoteError {
    match e.kind() {
        ErrorKind::NotFound => RemoteError::NotFound(object.to_string()),
        _ => RemoteError::Generic(format!("{object}: {e}")),
    }
}

impl RemoteObjectClient for LocalStore {
    fn fetch_metadata<'a>(
        &'a self,
        object: &'a str,
        conditions: &'a AccessConditions,
    ) -> BoxFuture<'a, Result<ObjectMetadata, RemoteError>> {
        Box::pin(async move { Ok(self.metadata(object, conditions).await?.1) })
    }

    fn read_range<'a>(
        &'a self,
        object: &'a str,
        offset: u64,
        buf: &'a mut [u8],
        conditions: &'a AccessConditions,
    ) -> BoxFuture<'a, Result<RangeRead, RemoteError>> {
        Box::pin(async move {
            let (path, metadata) = self.metadata(object, conditions).await?;
            if offset >= metadata.length {
                return Err(RemoteError::RangeNotSatisfiable);
            }

            let mut file = fs::File::open(&path)
                .await
                .map_err(|e| io_to_remote(e, object))?;
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| io_to_remote(e, object))?;

            let mut filled = 0;
            while filled < buf.len() {
                let n = file
                    .read(&mut buf[filled..])
                    .await
                    .map_err(|e| io_to_remote(e, object))?;
                if n == 0 {
                    break;
                }
                filled += n;
            }

            Ok(RangeRead {
                bytes_read: filled,
                metadata,
            })
        })
    }

    fn prepare<'a>(&'a self, object: &'a str, length: u64) -> BoxFuture<'a, Result<(), RemoteError>> {
        Box::pin(async move {
            let path = self.resolve(object)?;
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .await
                    .map_err(|e| io_to_remote(e, object))?;
            }
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .await
                .map_err(|e| io_to_remote(e, object))?;
            file.set_len(length)
                .await
                .map_err(|e| io_to_remote(e, object))?;
            debug!(object, length, "prepared object");
            Ok(())
        })
    }

    fn write_range<'a>(
        &'a self,
        object: &'a str,
        offset: u64,
        data: &'a [u8],
    ) -> BoxFuture<'a, Result<(), RemoteError>> {
        Box::pin(async move {
            let path = self.resolve(object)?;
            let mut file = OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .map_err(|e| io_to_remote(e, object))?;
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| io_to_remote(e, object))?;
            file.write_all(data)
                .await
                .map_err(|e| io_to_remote(e, object))?;
            file.flush().await.map_err(|e| io_to_remote(e, object))?;
            Ok(())
        })
    }

    fn commit<'a>(&'a self, object: &'a str) -> BoxFuture<'a, Result<(), RemoteError>> {
        Box::pin(async move {
            let path = self.resolve(object)?;
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .await
                .map_err(|e| io_to_remote(e, object))?;
            file.sync_all().await.map_err(|e| io_to_remote(e, object))?;
            Ok(())
        })
    }
}

impl RemoteDirectoryClient for LocalStore {
    fn list<'a>(
        &'a self,
        directory: &'a str,
        token: Option<&'a ListToken>,
    ) -> BoxFuture<'a, Result<ListPage, RemoteError>> {
        Box::pin(async move {
            let path = self.resolve(directory)?;
            let mut reader = fs::read_dir(&path)
                .await
                .map_err(|e| io_to_remote(e, directory))?;

            // The token is a name, so every page rescans the directory.
            // Only entries that make the page have their type looked up.
            let mut candidates = Vec::new();
            while let Some(entry) = reader
                .next_entry()
                .await
                .map_err(|e| io_to_remote(e, directory))?
            {
                let name = match entry.file_name().into_string() {
                    Ok(name) => name,
                    Err(raw) => {
                        warn!(directory, name = ?raw, "skipping entry with non-UTF-8 name");
                        continue;
                    }
                };
                if let Some(ListToken(after)) = token
                    && name.as_str() <= after.as_str()
                {
                    continue;
                }
                candidates.push((name, entry));
            }

            candidates.sort_unstable_by(|a, b| a.0.cmp(&b.0));
            let more = candidates.len() > self.page_size;
            candidates.truncate(self.page_size);

            let mut entries = Vec::with_capacity(candidates.len());
            for (name, entry) in candidates {
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| io_to_remote(e, directory))?;
                entries.push(ListedEntry {
                    name,
                    is_directory: file_type.is_dir(),
                });
            }
            let next = if more {
                entries.last().map(|e| ListToken(e.name.clone()))
            } else {
                None
            };

            Ok(ListPage { entries, next })
        })
    }

    fn create_directory<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(), RemoteError>> {
        Box::pin(async move {
            let full = self.resolve(path)?;
            match fs::create_dir(&full).await {
                Ok(()) => {
                    debug!(path, "created directory");
                    Ok(())
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    Err(RemoteError::AlreadyExists(path.to_string()))
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    Err(RemoteError::ParentMissing(path.to_string()))
                }
                Err(e) => Err(RemoteError::Generic(format!("{path}: {e}"))),
            }
        })
    }
}
