//! Restart reconciliation: fresh start or continuation of a stored dataset.
//!
//! Runs inside [`TimeStepWriter::init`](crate::writer::TimeStepWriter::init)
//! after the layout is known and before the backend touches any file. Rank 0
//! inspects what is on disk; every verdict is agreed across the group, so a
//! rejected continuation leaves the dataset exactly as it was.

use crate::algs::agreement::{agree, broadcast_flag};
use crate::algs::communicator::Communicator;
use crate::config::WriterOptions;
use crate::io::xdmf::{DocumentHeader, MetadataDocument};
use crate::io::{DatasetPaths, OpenMode, StorageBackend, retire_file};
use crate::topology::partition::{GlobalLayout, PartitionDescriptor};
use crate::writer_error::{Result, WriterError};

/// What the reconciler decided.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RestartDecision {
    /// Start at step 0; `replaced` tells whether an earlier dataset was discarded.
    Fresh { replaced: bool },
    /// Keep steps below `from_step` and continue there.
    Append { from_step: u64 },
}

/// Outcome of [`reconcile`].
#[derive(Debug)]
pub struct RestartPlan {
    pub decision: RestartDecision,
    /// Mode to open the backend with.
    pub mode: OpenMode,
    /// The document to extend; `Some` on rank 0 only.
    pub document: Option<MetadataDocument>,
}

/// Decide how to treat existing storage. Collective.
pub fn reconcile(
    comm: &dyn Communicator,
    options: &WriterOptions,
    paths: &DatasetPaths,
    backend: &dyn StorageBackend,
    partition: &PartitionDescriptor,
    layout: &GlobalLayout,
    header: DocumentHeader,
) -> Result<RestartPlan> {
    if options.initial_step == 0 {
        fresh(comm, options, paths, backend, header)
    } else {
        append(comm, options, paths, backend, partition, layout, header)
    }
}

fn fresh(
    comm: &dyn Communicator,
    options: &WriterOptions,
    paths: &DatasetPaths,
    backend: &dyn StorageBackend,
    header: DocumentHeader,
) -> Result<RestartPlan> {
    let root = comm.rank() == 0;
    let found = root
        && (paths.xdmf().exists() || backend.artifacts().iter().any(|path| path.exists()));
    let replaced = broadcast_flag(comm, 0, found);

    let retired = if root {
        if replaced {
            log::info!(
                "replacing existing dataset at {} (backup: {})",
                paths.base().display(),
                options.backup_existing
            );
        } else {
            log::info!("starting new dataset at {}", paths.base().display());
        }
        retire_file(&paths.xdmf(), options.backup_existing)
    } else {
        Ok(())
    };
    agree(comm, retired)?;

    Ok(RestartPlan {
        decision: RestartDecision::Fresh { replaced },
        mode: OpenMode::Fresh {
            backup: options.backup_existing,
        },
        document: root.then(|| MetadataDocument::fresh(header)),
    })
}

fn append(
    comm: &dyn Communicator,
    options: &WriterOptions,
    paths: &DatasetPaths,
    backend: &dyn StorageBackend,
    partition: &PartitionDescriptor,
    layout: &GlobalLayout,
    header: DocumentHeader,
) -> Result<RestartPlan> {
    let cutoff = options.initial_step;
    let inspected = if comm.rank() == 0 {
        inspect(options, paths, backend, layout, header).map(Some)
    } else {
        Ok(None)
    };
    let document = agree(comm, inspected)?;

    let rank = comm.rank();
    let verified = backend
        .verify_geometry(partition, layout, rank)
        .and_then(|same| {
            if same {
                Ok(())
            } else {
                Err(WriterError::StorageConsistency(format!(
                    "stored geometry of rank {rank} differs from the mesh passed to init"
                )))
            }
        });
    agree(comm, verified)?;

    if rank == 0 {
        log::info!(
            "continuing dataset at {} from step {cutoff}",
            paths.base().display()
        );
    }
    Ok(RestartPlan {
        decision: RestartDecision::Append { from_step: cutoff },
        mode: OpenMode::Append { from_step: cutoff },
        document,
    })
}

/// Rank 0: check the stored dataset can be continued at `initial_step`, and
/// prepare the document.
fn inspect(
    options: &WriterOptions,
    paths: &DatasetPaths,
    backend: &dyn StorageBackend,
    layout: &GlobalLayout,
    header: DocumentHeader,
) -> Result<MetadataDocument> {
    let cutoff = options.initial_step;
    let stored = backend.probe()?.ok_or_else(|| {
        WriterError::StorageConsistency(format!(
            "cannot continue at step {cutoff}: no dataset at {}",
            paths.base().display()
        ))
    })?;
    if let Some(diff) = layout.mismatch(&stored.layout) {
        return Err(WriterError::StorageConsistency(format!(
            "cannot continue {}: {diff}",
            paths.base().display()
        )));
    }
    if stored.steps < cutoff {
        return Err(WriterError::StorageConsistency(format!(
            "cannot continue at step {cutoff}: only {} steps are stored",
            stored.steps
        )));
    }
    if !options.keep_history {
        return Ok(MetadataDocument::rewrite_from(header, cutoff));
    }
    let xdmf = paths.xdmf();
    if !xdmf.exists() {
        return Err(WriterError::StorageConsistency(format!(
            "cannot continue at step {cutoff}: {} is missing",
            xdmf.display()
        )));
    }
    let mut document = MetadataDocument::load(&xdmf, header)?;
    document.truncate_to(cutoff)?;
    Ok(document)
}
