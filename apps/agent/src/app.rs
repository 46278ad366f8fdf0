//! Wires the local endpoints, journal and hierarchy transfer together.

use std::sync::Arc;

use datamover_hierarchy::{FileJournal, HierarchyTransfer};
use datamover_local_store::LocalStore;
use datamover_transfer::{Location, RemoteEndpoint, TransferError};
use tokio_util::sync::CancellationToken;

use crate::config::Config;

/// Runs one hierarchy transfer until it finishes or Ctrl-C is pressed.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();

    let store = Arc::new(LocalStore::new(&config.source).with_page_size(config.hierarchy.page_size));
    let source = Location::RemoteDirectory {
        endpoint: RemoteEndpoint::from_store("source", store),
        path: String::new(),
    };
    let destination = Location::Local(config.destination.clone());
    let journal = Arc::new(FileJournal::new(&config.journal));

    let mut transfer = HierarchyTransfer::new(
        source,
        destination,
        config.hierarchy.clone(),
        config.transfer.clone(),
        journal,
    );
    transfer.on_progress(Box::new(|p| {
        tracing::info!(
            files = p.files_transferred,
            skipped = p.files_skipped,
            failed = p.files_failed,
            bytes = p.bytes_transferred,
            bytes_per_second = p.bytes_per_second as u64,
            "progress"
        );
    }));

    let run_cancel = cancel.clone();
    let mut task = tokio::spawn(async move { transfer.run(run_cancel).await });

    let joined = tokio::select! {
        joined = &mut task => joined,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, saving state and shutting down");
            cancel.cancel();
            task.await
        }
    };

    match joined? {
        Ok(report) => {
            for failure in &report.failures {
                tracing::warn!(path = %failure.relative_path, error = %failure.error, "not transferred");
            }
            if report.is_partial_failure() {
                anyhow::bail!(
                    "{} item(s) failed; rerun to resume them",
                    report.failures.len()
                );
            }
            Ok(())
        }
        Err(TransferError::Cancelled) => {
            tracing::info!(journal = %config.journal.display(), "transfer interrupted; rerun to resume");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
