//! Destination writers for one object.

use std::io::SeekFrom;
use std::path::PathBuf;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::client::RemoteError;
use crate::location::{Location, RemoteEndpoint};
use crate::TransferError;

/// Where a unit's writer puts durable blocks.
pub(crate) enum DestinationSink {
    Local(LocalFileSink),
    Remote { endpoint: RemoteEndpoint, path: String },
}

impl DestinationSink {
    pub(crate) fn for_location(location: &Location) -> Result<Self, TransferError> {
        match location {
            Location::Local(path) => Ok(DestinationSink::Local(LocalFileSink::new(path.clone()))),
            Location::RemoteObject { endpoint, path } => Ok(DestinationSink::Remote {
                endpoint: endpoint.clone(),
                path: path.clone(),
            }),
            Location::RemoteDirectory { .. } => Err(TransferError::UnsupportedLocation(format!(
                "cannot write an object to directory {}",
                location.display()
            ))),
        }
    }

    /// Creates or resizes the destination to `length` bytes.
    pub(crate) async fn prepare(&self, length: u64) -> Result<(), TransferError> {
        match self {
            DestinationSink::Local(sink) => sink.prepare(length).await,
            DestinationSink::Remote { endpoint, path } => endpoint
                .objects
                .prepare(path, length)
                .await
                .map_err(|e| destination_error(path, e)),
        }
    }

    pub(crate) async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        match self {
            DestinationSink::Local(sink) => sink.write_at(offset, data).await,
            DestinationSink::Remote { endpoint, path } => endpoint
                .objects
                .write_range(path, offset, data)
                .await
                .map_err(|e| destination_error(path, e)),
        }
    }

    pub(crate) async fn commit(&self) -> Result<(), TransferError> {
        match self {
            DestinationSink::Local(sink) => sink.commit().await,
            DestinationSink::Remote { endpoint, path } => endpoint
                .objects
                .commit(path)
                .await
                .map_err(|e| destination_error(path, e)),
        }
    }
}

fn destination_error(path: &str, e: RemoteError) -> TransferError {
    TransferError::Destination {
        path: path.to_string(),
        message: e.to_string(),
    }
}

/// Positional writer over a pre-sized local file.
///
/// The file is opened without truncation so blocks retired by an earlier
/// run survive a resume.
pub(crate) struct LocalFileSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl LocalFileSink {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            file: Mutex::new(None),
        }
    }

    async fn prepare(&self, length: u64) -> Result<(), TransferError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .await?;
        file.set_len(length).await?;
        debug!(path = %self.path.display(), length, "prepared destination file");
        *self.file.lock().await = Some(file);
        Ok(())
    }

    async fn write_at(&self, offset: u64, data: &[u8]) -> Result<(), TransferError> {
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or_else(|| {
            TransferError::Io(std::io::Error::other(format!(
                "destination {} written before prepare",
                self.path.display()
            )))
        })?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn commit(&self) -> Result<(), TransferError> {
        let mut guard = self.file.lock().await;
        if let Some(file) = guard.take() {
            file.sync_all().await?;
        }
        Ok(())
    }
}
