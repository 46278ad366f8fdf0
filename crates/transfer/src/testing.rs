//! In-memory endpoint used by the unit tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::client::{
    AccessConditions, BoxFuture, ListPage, ListToken, ObjectMetadata, RangeRead,
    RemoteDirectoryClient, RemoteError, RemoteObjectClient,
};
use crate::location::{Location, RemoteEndpoint};

#[derive(Default)]
pub(crate) struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    type_tags: Mutex<BTreeMap<String, String>>,
    committed: Mutex<BTreeSet<String>>,
    /// Every `read_range` attempt as `(object, offset, len)`.
    reads: Mutex<Vec<(String, u64, usize)>>,
    metadata_fetches: AtomicUsize,
    /// Reads of `(object, offset)` that fail with a generic error.
    failing_reads: Mutex<BTreeSet<(String, u64)>>,
    /// Reads of `(object, offset)` that panic.
    panicking_reads: Mutex<BTreeSet<(String, u64)>>,
    read_delay: Mutex<Option<Duration>>,
    reads_running: AtomicUsize,
    reads_peak: AtomicUsize,
}

impl MemoryStore {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn put(&self, object: &str, data: Vec<u8>) {
        self.objects.lock().unwrap().insert(object.to_string(), data);
    }

    pub(crate) fn set_type_tag(&self, object: &str, tag: &str) {
        self.type_tags
            .lock()
            .unwrap()
            .insert(object.to_string(), tag.to_string());
    }

    pub(crate) fn get(&self, object: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(object).cloned()
    }

    pub(crate) fn is_committed(&self, object: &str) -> bool {
        self.committed.lock().unwrap().contains(object)
    }

    pub(crate) fn fail_read_at(&self, object: &str, offset: u64) {
        self.failing_reads
            .lock()
            .unwrap()
            .insert((object.to_string(), offset));
    }

    pub(crate) fn panic_read_at(&self, object: &str, offset: u64) {
        self.panicking_reads
            .lock()
            .unwrap()
            .insert((object.to_string(), offset));
    }

    pub(crate) fn heal(&self) {
        self.failing_reads.lock().unwrap().clear();
        self.panicking_reads.lock().unwrap().clear();
    }

    /// Makes every read sleep for `delay` before returning data.
    pub(crate) fn set_read_delay(&self, delay: Duration) {
        *self.read_delay.lock().unwrap() = Some(delay);
    }

    /// Most reads ever running at the same time.
    pub(crate) fn peak_concurrent_reads(&self) -> usize {
        self.reads_peak.load(Ordering::SeqCst)
    }

    /// `(offset, len)` of every read attempted against `object`.
    pub(crate) fn reads_of(&self, object: &str) -> Vec<(u64, usize)> {
        self.reads
            .lock()
            .unwrap()
            .iter()
            .filter(|(o, _, _)| o == object)
            .map(|(_, off, len)| (*off, *len))
            .collect()
    }

    pub(crate) fn clear_reads(&self) {
        self.reads.lock().unwrap().clear();
    }

    pub(crate) fn metadata_fetches(&self) -> usize {
        self.metadata_fetches.load(Ordering::SeqCst)
    }

    /// Content fingerprint derived from length and a cheap checksum.
    pub(crate) fn tag_of(data: &[u8]) -> String {
        let sum = data
            .iter()
            .fold(0u64, |acc, b| acc.wrapping_mul(31).wrapping_add(u64::from(*b)));
        format!("{:x}-{sum:x}", data.len())
    }

    fn metadata(&self, object: &str, conditions: &AccessConditions) -> Result<ObjectMetadata, RemoteError> {
        let objects = self.objects.lock().unwrap();
        let data = objects
            .get(object)
            .ok_or_else(|| RemoteError::NotFound(object.to_string()))?;
        let tag = Self::tag_of(data);
        if let Some(expected) = &conditions.if_match
            && *expected != tag
        {
            return Err(RemoteError::PreconditionFailed(object.to_string()));
        }
        let type_tag = self
            .type_tags
            .lock()
            .unwrap()
            .get(object)
            .cloned()
            .unwrap_or_else(|| "blob".to_string());
        Ok(ObjectMetadata {
            length: data.len() as u64,
            identity_tag: tag,
            type_tag,
        })
    }
}

pub(crate) fn endpoint(store: &Arc<MemoryStore>) -> RemoteEndpoint {
    RemoteEndpoint::from_store("memory", Arc::clone(store))
}

pub(crate) fn object(store: &Arc<MemoryStore>, path: &str) -> Location {
    Location::RemoteObject {
        endpoint: endpoint(store),
        path: path.to_string(),
    }
}

/// Deterministic, non-repeating test payload.
pub(crate) fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

impl RemoteObjectClient for MemoryStore {
    fn fetch_metadata<'a>(
        &'a self,
        object: &'a str,
        conditions: &'a AccessConditions,
    ) -> BoxFuture<'a, Result<ObjectMetadata, RemoteError>> {
        Box::pin(async move {
            self.metadata_fetches.fetch_add(1, Ordering::SeqCst);
            self.metadata(object, conditions)
        })
    }

    fn read_range<'a>(
        &'a self,
        object: &'a str,
        offset: u64,
        buf: &'a mut [u8],
        conditions: &'a AccessConditions,
    ) -> BoxFuture<'a, Result<RangeRead, RemoteError>> {
        Box::pin(async move {
            self.reads
                .lock()
                .unwrap()
                .push((object.to_string(), offset, buf.len()));
            let key = (object.to_string(), offset);
            if self.panicking_reads.lock().unwrap().contains(&key) {
                panic!("injected read panic at {object}@{offset}");
            }

            let running = self.reads_running.fetch_add(1, Ordering::SeqCst) + 1;
            self.reads_peak.fetch_max(running, Ordering::SeqCst);
            let delay = *self.read_delay.lock().unwrap();
            match delay {
                Some(delay) => tokio::time::sleep(delay).await,
                None => tokio::task::yield_now().await,
            }
            self.reads_running.fetch_sub(1, Ordering::SeqCst);

            if self
                .failing_reads
                .lock()
                .unwrap()
                .contains(&(object.to_string(), offset))
            {
                return Err(RemoteError::Generic("injected read failure".into()));
            }
            let metadata = self.metadata(object, conditions)?;
            if offset >= metadata.length {
                return Err(RemoteError::RangeNotSatisfiable);
            }
            let objects = self.objects.lock().unwrap();
            let data = &objects[object];
            let start = offset as usize;
            let n = buf.len().min(data.len() - start);
            buf[..n].copy_from_slice(&data[start..start + n]);
            Ok(RangeRead {
                bytes_read: n,
                metadata,
            })
        })
    }

    fn prepare<'a>(&'a self, object: &'a str, length: u64) -> BoxFuture<'a, Result<(), RemoteError>> {
        Box::pin(async move {
            let mut objects = self.objects.lock().unwrap();
            objects
                .entry(object.to_string())
                .or_default()
                .resize(length as usize, 0);
            self.committed.lock().unwrap().remove(object);
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
            let mut objects = self.objects.lock().unwrap();
            let target = objects
                .get_mut(object)
                .ok_or_else(|| RemoteError::NotFound(object.to_string()))?;
            let start = offset as usize;
            target[start..start + data.len()].copy_from_slice(data);
            Ok(())
        })
    }

    fn commit<'a>(&'a self, object: &'a str) -> BoxFuture<'a, Result<(), RemoteError>> {
        Box::pin(async move {
            self.committed.lock().unwrap().insert(object.to_string());
            Ok(())
        })
    }
}

impl RemoteDirectoryClient for MemoryStore {
    fn list<'a>(
        &'a self,
        _directory: &'a str,
        _token: Option<&'a ListToken>,
    ) -> BoxFuture<'a, Result<ListPage, RemoteError>> {
        Box::pin(async { Ok(ListPage::default()) })
    }

    fn create_directory<'a>(&'a self, _path: &'a str) -> BoxFuture<'a, Result<(), RemoteError>> {
        Box::pin(async { Ok(()) })
    }
}
