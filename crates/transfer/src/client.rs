//! Contracts for the remote endpoint the engine reads from and writes to.
//!
//! The engine never talks to a wire client directly. Implementations
//! bridge these traits to an actual service (or, for tests and local
//! copies, to the filesystem or memory). Using object-safe traits keeps
//! the transfer logic decoupled from transport and testable with mocks.

use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

/// Boxed future returned by client trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Failure kinds a remote client must distinguish.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("range not satisfiable")]
    RangeNotSatisfiable,

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("parent missing: {0}")]
    ParentMissing(String),

    #[error("{0}")]
    Generic(String),
}

/// Conditions attached to a read so a changed object is detected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessConditions {
    /// Identity tag the object must still carry.
    pub if_match: Option<String>,
}

impl AccessConditions {
    pub fn if_match(tag: impl Into<String>) -> Self {
        let tag = tag.into();
        Self {
            if_match: (!tag.is_empty()).then_some(tag),
        }
    }
}

/// Object properties returned by a metadata fetch or a ranged read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub length: u64,
    /// Opaque content fingerprint (e.g. an entity tag).
    pub identity_tag: String,
    /// Kind of object as reported by the endpoint; empty means unknown.
    pub type_tag: String,
}

/// Outcome of a ranged read: bytes copied plus the object's metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeRead {
    pub bytes_read: usize,
    pub metadata: ObjectMetadata,
}

/// Opaque page marker returned by a paged listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListToken(pub String);

/// One entry of a listing page. `name` is a single path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    pub name: String,
    pub is_directory: bool,
}

/// A page of a directory listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub entries: Vec<ListedEntry>,
    /// Marker for the next page; `None` on the last page.
    pub next: Option<ListToken>,
}

/// Read (and optionally write) access to objects on a remote endpoint.
pub trait RemoteObjectClient: Send + Sync {
    /// Fetches the object's length, identity tag and type tag.
    fn fetch_metadata<'a>(
        &'a self,
        object: &'a str,
        conditions: &'a AccessConditions,
    ) -> BoxFuture<'a, Result<ObjectMetadata, RemoteError>>;

    /// Reads up to `buf.len()` bytes starting at `offset`.
    ///
    /// Returns `RangeNotSatisfiable` when `offset` is at or beyond the end
    /// of the object (including offset 0 of an empty object).
    fn read_range<'a>(
        &'a self,
        object: &'a str,
        offset: u64,
        buf: &'a mut [u8],
        conditions: &'a AccessConditions,
    ) -> BoxFuture<'a, Result<RangeRead, RemoteError>>;

    /// Creates or resizes the destination object before blocks arrive.
    ///
    /// Existing content below `length` must survive (resume).
    fn prepare<'a>(&'a self, object: &'a str, length: u64) -> BoxFuture<'a, Result<(), RemoteError>> {
        let _ = length;
        Box::pin(async move { Err(read_only(object)) })
    }

    /// Writes `data` at `offset` of a prepared object.
    fn write_range<'a>(
        &'a self,
        object: &'a str,
        offset: u64,
        data: &'a [u8],
    ) -> BoxFuture<'a, Result<(), RemoteError>> {
        let _ = (offset, data);
        Box::pin(async move { Err(read_only(object)) })
    }

    /// Makes a fully written object durable/visible.
    fn commit<'a>(&'a self, object: &'a str) -> BoxFuture<'a, Result<(), RemoteError>> {
        Box::pin(async move { Err(read_only(object)) })
    }
}

/// Directory listing and creation on a remote endpoint.
pub trait RemoteDirectoryClient: Send + Sync {
    /// Lists one level of `directory`, starting at `token`.
    fn list<'a>(
        &'a self,
        directory: &'a str,
        token: Option<&'a ListToken>,
    ) -> BoxFuture<'a, Result<ListPage, RemoteError>>;

    /// Creates a single directory level.
    ///
    /// Fails with `AlreadyExists` or `ParentMissing` as appropriate.
    fn create_directory<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<(), RemoteError>>;
}

fn read_only(object: &str) -> RemoteError {
    RemoteError::Generic(format!("endpoint does not accept writes: {object}"))
}
