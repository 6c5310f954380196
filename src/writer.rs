//! The time-step writer.
//!
//! Lifecycle: [`TimeStepWriter::new`] → [`init`](TimeStepWriter::init) once →
//! repeated [`add_time_step`](TimeStepWriter::add_time_step) followed by
//! [`write_data`](TimeStepWriter::write_data) per variable →
//! [`close`](TimeStepWriter::close). `init`, `add_time_step` and `close` are
//! collective; `write_data` is collective when the backend says so.
//!
//! ```no_run
//! use mesh_xdmf_writer::prelude::*;
//!
//! # fn main() -> Result<(), WriterError> {
//! let vars = VariableTable::from_names(["pressure"])?;
//! let mut w = TimeStepWriter::new(NoComm, CellTopology::Triangle, "out/run", vars)?;
//! w.init(1, &[0, 1, 2], 3, &[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0])?;
//! for step in 0..10 {
//!     w.add_time_step(step as f64 * 0.1)?;
//!     w.write_data(0, &[step as f64])?;
//! }
//! w.close()?;
//! # Ok(())
//! # }
//! ```

use crate::algs::agreement::agree;
use crate::algs::communicator::Communicator;
use crate::config::WriterOptions;
use crate::data::variables::VariableTable;
use crate::io::xdmf::{DocumentHeader, MetadataDocument};
use crate::io::{DatasetPaths, StepRegion, StorageBackend, open_backend};
use crate::restart::{self, RestartDecision};
use crate::topology::cell_type::CellTopology;
use crate::topology::partition::{GlobalLayout, PartitionDescriptor};
use crate::writer_error::{Result, WriterError};
use std::path::PathBuf;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Created,
    Open,
    Closed,
}

/// State that exists between `init` and `close`.
#[derive(Debug)]
struct Session {
    partition: PartitionDescriptor,
    layout: GlobalLayout,
    /// Rank 0 only.
    document: Option<MetadataDocument>,
    region: Option<StepRegion>,
    /// Variables written in the current step.
    written: Vec<bool>,
}

/// Parallel writer of a partitioned mesh and its time-dependent fields.
pub struct TimeStepWriter<C: Communicator> {
    comm: C,
    topology: CellTopology,
    paths: DatasetPaths,
    variables: VariableTable,
    options: WriterOptions,
    backend: Box<dyn StorageBackend>,
    session: Option<Session>,
    phase: Phase,
    next_step: u64,
    current_step: Option<u64>,
}

impl<C: Communicator> TimeStepWriter<C> {
    /// Writer with default options. No I/O.
    pub fn new(
        comm: C,
        topology: CellTopology,
        base_path: impl Into<PathBuf>,
        variables: VariableTable,
    ) -> Result<Self> {
        Self::with_options(comm, topology, base_path, variables, WriterOptions::default())
    }

    /// Writer with explicit options. No I/O.
    ///
    /// `base_path` has no extension; every artifact is named after it.
    pub fn with_options(
        comm: C,
        topology: CellTopology,
        base_path: impl Into<PathBuf>,
        variables: VariableTable,
        options: WriterOptions,
    ) -> Result<Self> {
        let base: PathBuf = base_path.into();
        if base.file_name().is_none() {
            return Err(WriterError::InvalidConfiguration(format!(
                "base path `{}` does not name a file",
                base.display()
            )));
        }
        let paths = DatasetPaths::new(base);
        let backend = open_backend(options.backend, &paths, &variables);
        Ok(Self {
            comm,
            topology,
            paths,
            variables,
            next_step: options.initial_step,
            options,
            backend,
            session: None,
            phase: Phase::Created,
            current_step: None,
        })
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    /// Step receiving `write_data`, once `add_time_step` has been called.
    pub fn current_step(&self) -> Option<u64> {
        self.current_step
    }

    /// Index the next `add_time_step` will allocate.
    pub fn next_step(&self) -> u64 {
        self.next_step
    }

    pub fn paths(&self) -> &DatasetPaths {
        &self.paths
    }

    pub fn options(&self) -> &WriterOptions {
        &self.options
    }

    pub fn variables(&self) -> &VariableTable {
        &self.variables
    }

    /// Group-wide layout, available after `init`.
    pub fn layout(&self) -> Option<&GlobalLayout> {
        self.session.as_ref().map(|s| &s.layout)
    }

    /// Validate the local partition, reconcile with existing storage, open
    /// the backend and persist the mesh. Collective.
    ///
    /// `connectivity` indexes the local vertex block; `vertices` holds three
    /// coordinates per vertex.
    pub fn init(
        &mut self,
        cell_count: usize,
        connectivity: &[u32],
        vertex_count: usize,
        vertices: &[f64],
    ) -> Result<()> {
        if self.phase != Phase::Created || self.session.is_some() {
            return Err(WriterError::InvalidSequence(
                "init may only be called once, before any other operation".into(),
            ));
        }
        let comm: &dyn Communicator = &self.comm;
        let partition = agree(
            comm,
            PartitionDescriptor::new(self.topology, cell_count, connectivity, vertex_count, vertices),
        )?;
        let layout = GlobalLayout::gather(comm, &partition)?;
        let header = DocumentHeader::new(self.backend.kind(), &self.paths, &layout, &self.variables);

        let plan = restart::reconcile(
            comm,
            &self.options,
            &self.paths,
            &*self.backend,
            &partition,
            &layout,
            header,
        )?;
        self.backend.create_or_open(comm, plan.mode, &layout)?;
        self.backend.write_geometry(comm, &partition)?;

        if let RestartDecision::Append { from_step } = plan.decision {
            self.next_step = from_step;
        }
        let session = Session {
            partition,
            layout,
            document: plan.document,
            region: None,
            written: vec![false; self.variables.len()],
        };
        if self.options.flush_metadata_every_step {
            let flushed = Self::flush_document(&self.paths, &session);
            agree(comm, flushed)?;
        }
        log::debug!(
            "rank {} initialised {} ({} local cells, next step {})",
            self.comm.rank(),
            self.paths.base().display(),
            session.partition.cell_count(),
            self.next_step
        );
        self.session = Some(session);
        self.phase = Phase::Open;
        Ok(())
    }

    /// Start a new step at simulation time `time`. Collective.
    ///
    /// The cursor advances as soon as the step is allocated, so a failed
    /// metadata flush leaves the step open for writes and the next call
    /// allocates the following step.
    pub fn add_time_step(&mut self, time: f64) -> Result<()> {
        let comm: &dyn Communicator = &self.comm;
        let checked = self.ensure_open("add_time_step").and_then(|()| {
            if time.is_finite() {
                Ok(())
            } else {
                Err(WriterError::InvalidSequence(format!(
                    "time value {time} is not finite"
                )))
            }
        });
        agree(comm, checked)?;

        let step = self.next_step;
        let region = self.backend.allocate_step(comm, step)?;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| WriterError::InvalidSequence("writer is not initialised".into()))?;
        session.region = Some(region);
        session.written.iter_mut().for_each(|w| *w = false);
        self.current_step = Some(step);
        self.next_step = step + 1;

        let recorded = match session.document.as_mut() {
            Some(document) => document.push_step(step, time),
            None => Ok(()),
        };
        if self.options.flush_metadata_every_step {
            let flushed = recorded.and_then(|()| Self::flush_document(&self.paths, session));
            agree(comm, flushed)
        } else {
            recorded
        }
    }

    /// Write this rank's values of `variable` for the current step.
    ///
    /// `data` holds one value per local cell or vertex, following the
    /// variable's centering. Nothing is written when validation fails.
    pub fn write_data(&mut self, variable: usize, data: &[f64]) -> Result<()> {
        let checked = self.check_write(variable, data);
        let comm: &dyn Communicator = &self.comm;
        let region = if self.backend.collective_writes() {
            agree(comm, checked)?
        } else {
            checked?
        };
        self.backend.write_variable(comm, &region, variable, data)?;

        let session = self
            .session
            .as_mut()
            .ok_or_else(|| WriterError::InvalidSequence("writer is not initialised".into()))?;
        session.written[variable] = true;
        if let Some(document) = session.document.as_mut() {
            document.record_field(variable)?;
        }
        Ok(())
    }

    /// Validate a `write_data` call; returns the region to write into.
    fn check_write(&self, variable: usize, data: &[f64]) -> Result<StepRegion> {
        self.ensure_open("write_data")?;
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| WriterError::InvalidSequence("writer is not initialised".into()))?;
        let region = session.region.clone().ok_or_else(|| {
            WriterError::InvalidSequence("write_data called before add_time_step".into())
        })?;
        let var = self.variables.get(variable).ok_or_else(|| {
            WriterError::InvalidSequence(format!(
                "variable index {variable} out of range (table has {})",
                self.variables.len()
            ))
        })?;
        let expected = session.partition.count(var.center);
        if data.len() != expected {
            return Err(WriterError::InvalidSequence(format!(
                "`{}` expects {expected} local values, got {}",
                var.name,
                data.len()
            )));
        }
        if session.written[variable] {
            if self.options.reject_duplicate_writes {
                return Err(WriterError::InvalidSequence(format!(
                    "`{}` was already written in step {}",
                    var.name, region.step
                )));
            }
            log::debug!(
                "rank {} overwrites `{}` in step {}",
                self.comm.rank(),
                var.name,
                region.step
            );
        }
        Ok(region)
    }

    /// Flush the backend and write the final document. Collective; a second
    /// call is a no-op.
    pub fn close(&mut self) -> Result<()> {
        match self.phase {
            Phase::Closed => return Ok(()),
            Phase::Created => {
                self.phase = Phase::Closed;
                return Ok(());
            }
            Phase::Open => {}
        }
        let comm: &dyn Communicator = &self.comm;
        self.backend.flush_and_close(comm)?;
        let written = match self.session.as_ref() {
            Some(session) => Self::flush_document(&self.paths, session),
            None => Ok(()),
        };
        agree(comm, written)?;
        comm.barrier();
        if self.comm.rank() == 0 {
            log::info!(
                "closed {} after step {}",
                self.paths.base().display(),
                self.current_step
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "none".into())
            );
        }
        self.session = None;
        self.phase = Phase::Closed;
        Ok(())
    }

    fn ensure_open(&self, op: &str) -> Result<()> {
        match self.phase {
            Phase::Open => Ok(()),
            Phase::Created => Err(WriterError::InvalidSequence(format!(
                "{op} called before init"
            ))),
            Phase::Closed => Err(WriterError::InvalidSequence(format!(
                "{op} called after close"
            ))),
        }
    }

    /// Rank 0 writes the document; a no-op elsewhere.
    fn flush_document(paths: &DatasetPaths, session: &Session) -> Result<()> {
        match &session.document {
            Some(document) => document.write_to(&paths.xdmf()),
            None => Ok(()),
        }
    }
}

impl<C: Communicator> std::fmt::Debug for TimeStepWriter<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeStepWriter")
            .field("rank", &self.comm.rank())
            .field("base", &self.paths.base())
            .field("backend", &self.backend.kind())
            .field("phase", &self.phase)
            .field("next_step", &self.next_step)
            .finish()
    }
}

impl<C: Communicator> Drop for TimeStepWriter<C> {
    fn drop(&mut self) {
        if self.phase == Phase::Open {
            log::warn!(
                "rank {}: writer for {} dropped without close; the metadata document is not updated",
                self.comm.rank(),
                self.paths.base().display()
            );
            self.backend.release();
            self.phase = Phase::Closed;
        }
    }
}
