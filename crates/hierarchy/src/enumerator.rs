//! Lazy, restartable listing of one directory level.
//!
//! Every emitted entry carries the cursor that resumes the listing right
//! after it. The owner persists that cursor once it has registered the
//! entry; a crash in between re-emits at most that one entry.

use std::collections::VecDeque;
use std::sync::Arc;

use datamover_transfer::{
    ListToken, ListedEntry, RemoteDirectoryClient, TransferError, join_relative,
    validate_entry_name,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Resume point within a paged listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContinuationToken {
    /// Marker the current page was requested with; `None` is the first page.
    #[serde(default)]
    pub page: Option<ListToken>,
    /// Entries of that page already emitted.
    #[serde(default)]
    pub consumed: usize,
}

/// A file or subdirectory discovered by the listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferEntry {
    pub is_directory: bool,
    /// Path relative to the hierarchy root.
    pub relative_path: String,
    /// Cursor positioned just after this entry.
    pub token: ContinuationToken,
}

#[derive(Debug)]
pub enum EnumerationEntry {
    Item(TransferEntry),
    /// The listing failed; the sequence ends after this.
    Error(TransferError),
}

/// Walks one directory level page by page.
pub struct HierarchyEnumerator {
    client: Arc<dyn RemoteDirectoryClient>,
    /// Path of the listed directory on the endpoint.
    directory: String,
    /// Same directory, relative to the hierarchy root.
    relative_path: String,
    page_token: Option<ListToken>,
    next_token: Option<ListToken>,
    pending: VecDeque<ListedEntry>,
    consumed: usize,
    skip: usize,
    started: bool,
    done: bool,
}

impl HierarchyEnumerator {
    pub fn new(
        client: Arc<dyn RemoteDirectoryClient>,
        directory: impl Into<String>,
        relative_path: impl Into<String>,
        resume: Option<ContinuationToken>,
    ) -> Self {
        let resume = resume.unwrap_or_default();
        Self {
            client,
            directory: directory.into(),
            relative_path: relative_path.into(),
            page_token: resume.page,
            next_token: None,
            pending: VecDeque::new(),
            consumed: 0,
            skip: resume.consumed,
            started: false,
            done: false,
        }
    }

    /// Cursor just after the last emitted entry.
    pub fn cursor(&self) -> ContinuationToken {
        ContinuationToken {
            page: self.page_token.clone(),
            consumed: if self.started { self.consumed } else { self.skip },
        }
    }

    /// Produces the next entry, fetching another page when needed.
    ///
    /// Returns `None` once the listing is exhausted or has failed.
    pub async fn next(&mut self, cancel: &CancellationToken) -> Option<EnumerationEntry> {
        loop {
            if self.done {
                return None;
            }

            if let Some(listed) = self.pending.pop_front() {
                self.consumed += 1;
                if let Err(e) = validate_entry_name(&listed.name) {
                    self.done = true;
                    return Some(EnumerationEntry::Error(TransferError::Enumeration {
                        path: self.relative_path.clone(),
                        message: e.to_string(),
                    }));
                }
                return Some(EnumerationEntry::Item(TransferEntry {
                    is_directory: listed.is_directory,
                    relative_path: join_relative(&self.relative_path, &listed.name),
                    token: self.cursor(),
                }));
            }

            let request = if self.started {
                match self.next_token.take() {
                    Some(token) => Some(token),
                    None => {
                        self.done = true;
                        return None;
                    }
                }
            } else {
                self.page_token.clone()
            };

            let page = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Some(EnumerationEntry::Error(TransferError::Cancelled));
                }
                page = self.client.list(&self.directory, request.as_ref()) => page,
            };

            let page = match page {
                Ok(page) => page,
                Err(e) => {
                    self.done = true;
                    return Some(EnumerationEntry::Error(TransferError::Enumeration {
                        path: self.relative_path.clone(),
                        message: e.to_string(),
                    }));
                }
            };

            debug!(
                directory = %self.directory,
                entries = page.entries.len(),
                more = page.next.is_some(),
                "listed page"
            );

            self.started = true;
            self.page_token = request;
            self.next_token = page.next;
            self.pending = page.entries.into();
            self.consumed = 0;
            if self.skip > 0 {
                let n = self.skip.min(self.pending.len());
                self.pending.drain(..n);
                self.consumed = n;
                self.skip = 0;
            }
        }
    }
}
