//! Source and destination addressing.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::client::{AccessConditions, RemoteDirectoryClient, RemoteError, RemoteObjectClient};
use crate::validation::{join_relative, validate_relative_path};
use crate::TransferError;

/// A named remote endpoint with its object and directory clients.
#[derive(Clone)]
pub struct RemoteEndpoint {
    pub name: String,
    pub objects: Arc<dyn RemoteObjectClient>,
    pub directories: Arc<dyn RemoteDirectoryClient>,
}

impl RemoteEndpoint {
    pub fn new(
        name: impl Into<String>,
        objects: Arc<dyn RemoteObjectClient>,
        directories: Arc<dyn RemoteDirectoryClient>,
    ) -> Self {
        Self {
            name: name.into(),
            objects,
            directories,
        }
    }

    /// Builds an endpoint from one store serving both contracts.
    pub fn from_store<S>(name: impl Into<String>, store: Arc<S>) -> Self
    where
        S: RemoteObjectClient + RemoteDirectoryClient + 'static,
    {
        Self::new(name, store.clone(), store)
    }
}

impl fmt::Debug for RemoteEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteEndpoint")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Where bytes come from or go to.
#[derive(Debug, Clone)]
pub enum Location {
    /// A path on the local filesystem (file or directory).
    Local(PathBuf),
    /// A single object on a remote endpoint.
    RemoteObject { endpoint: RemoteEndpoint, path: String },
    /// A directory on a remote endpoint. `""` is the endpoint root.
    RemoteDirectory { endpoint: RemoteEndpoint, path: String },
}

impl Location {
    /// Location of the object `relative` below this directory.
    pub fn child_object(&self, relative: &str) -> Result<Location, TransferError> {
        validate_relative_path(relative)?;
        match self {
            Location::Local(base) => Ok(Location::Local(local_join(base, relative))),
            Location::RemoteDirectory { endpoint, path } => Ok(Location::RemoteObject {
                endpoint: endpoint.clone(),
                path: join_relative(path, relative),
            }),
            Location::RemoteObject { .. } => Err(TransferError::UnsupportedLocation(format!(
                "{} is not a directory",
                self.display()
            ))),
        }
    }

    /// Location of the directory `relative` below this directory.
    pub fn child_directory(&self, relative: &str) -> Result<Location, TransferError> {
        if relative.is_empty() {
            return Ok(self.clone());
        }
        validate_relative_path(relative)?;
        match self {
            Location::Local(base) => Ok(Location::Local(local_join(base, relative))),
            Location::RemoteDirectory { endpoint, path } => Ok(Location::RemoteDirectory {
                endpoint: endpoint.clone(),
                path: join_relative(path, relative),
            }),
            Location::RemoteObject { .. } => Err(TransferError::UnsupportedLocation(format!(
                "{} is not a directory",
                self.display()
            ))),
        }
    }

    /// Human-readable form for logs and error messages.
    pub fn display(&self) -> String {
        match self {
            Location::Local(path) => path.display().to_string(),
            Location::RemoteObject { endpoint, path }
            | Location::RemoteDirectory { endpoint, path } => {
                format!("{}:/{}", endpoint.name, path)
            }
        }
    }

    /// Whether an object already exists at this location.
    ///
    /// Remote directories have no cheap existence probe and report `false`.
    pub async fn exists(&self) -> Result<bool, TransferError> {
        match self {
            Location::Local(path) => Ok(tokio::fs::try_exists(path).await?),
            Location::RemoteObject { endpoint, path } => {
                match endpoint
                    .objects
                    .fetch_metadata(path, &AccessConditions::default())
                    .await
                {
                    Ok(_) => Ok(true),
                    Err(RemoteError::NotFound(_)) => Ok(false),
                    Err(e) => Err(e.into()),
                }
            }
            Location::RemoteDirectory { .. } => Ok(false),
        }
    }
}

fn local_join(base: &std::path::Path, relative: &str) -> PathBuf {
    relative
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .fold(base.to_path_buf(), |acc, segment| acc.join(segment))
}
