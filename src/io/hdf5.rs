//! HDF5 container backend (feature `hdf5-support`).
//!
//! One file `<base>.h5` holds `/geometry` (vertices × 3), `/connect`
//! (cells × vertices_per_cell, global ids), `/partition` (owner rank per cell),
//! `/layout` (`[topology code, ranks, cells…, vertices…]`) and one resizable
//! dataset per variable of shape (steps, cells or vertices).
//!
//! The container is opened by rank 0 only. Other ranks ship their slices to
//! rank 0, which writes each one at the rank's offset; every step still lands
//! in disjoint per-rank ranges.

use crate::algs::agreement::agree;
use crate::algs::communicator::Communicator;
use crate::config::BackendKind;
use crate::data::variables::VariableTable;
use crate::io::raw::{decode_f64, encode_f64};
use crate::io::{DatasetPaths, OpenMode, StepRegion, StorageBackend, StoredDataset, retire_file};
use crate::topology::cell_type::CellTopology;
use crate::topology::partition::{GlobalLayout, PartitionDescriptor};
use crate::writer_error::{Result, WriterError};
use hdf5::File;
use std::path::{Path, PathBuf};

pub const DATASET_GEOMETRY: &str = "geometry";
pub const DATASET_CONNECT: &str = "connect";
pub const DATASET_PARTITION: &str = "partition";
pub const DATASET_LAYOUT: &str = "layout";

fn h5_error(op: &'static str, path: &Path) -> impl FnOnce(hdf5::Error) -> WriterError + '_ {
    move |err| WriterError::io(op, path, std::io::Error::other(err.to_string()))
}

/// HDF5-backed storage; see the module docs for the layout.
#[derive(Debug)]
pub struct Hdf5Backend {
    paths: DatasetPaths,
    variables: VariableTable,
    layout: Option<GlobalLayout>,
    rank: usize,
    file: Option<File>,
    reopened: bool,
    closed: bool,
}

impl Hdf5Backend {
    pub fn new(paths: DatasetPaths, variables: VariableTable) -> Self {
        Self {
            paths,
            variables,
            layout: None,
            rank: 0,
            file: None,
            reopened: false,
            closed: false,
        }
    }

    fn layout(&self) -> Result<&GlobalLayout> {
        self.layout.as_ref().ok_or_else(|| {
            WriterError::InvalidSequence("HDF5 backend used before create_or_open".into())
        })
    }

    fn file(&self) -> Result<&File> {
        self.file
            .as_ref()
            .ok_or_else(|| WriterError::InvalidSequence("HDF5 container is not open".into()))
    }

    fn encode_layout(layout: &GlobalLayout) -> Vec<u64> {
        let mut raw = vec![layout.topology.code(), layout.size() as u64];
        raw.extend_from_slice(&layout.cells);
        raw.extend_from_slice(&layout.vertices);
        raw
    }

    fn decode_layout(raw: &[u64]) -> Option<GlobalLayout> {
        let topology = CellTopology::from_code(*raw.first()?)?;
        let size = *raw.get(1)? as usize;
        if raw.len() != 2 + 2 * size {
            return None;
        }
        Some(GlobalLayout {
            topology,
            cells: raw[2..2 + size].to_vec(),
            vertices: raw[2 + size..].to_vec(),
        })
    }

    /// Rank 0: new container with empty step datasets.
    fn create_container(&self, backup: bool, layout: &GlobalLayout) -> Result<File> {
        let path = self.paths.container();
        retire_file(&path, backup)?;
        let file = File::create(&path).map_err(h5_error("create", &path))?;
        let total_vertices = layout.total_vertices() as usize;
        let total_cells = layout.total_cells() as usize;
        let vpc = layout.topology.vertices_per_cell();

        file.new_dataset::<f64>()
            .shape((total_vertices, 3))
            .create(DATASET_GEOMETRY)
            .map_err(h5_error("create dataset", &path))?;
        file.new_dataset::<i64>()
            .shape((total_cells, vpc))
            .create(DATASET_CONNECT)
            .map_err(h5_error("create dataset", &path))?;
        file.new_dataset::<i32>()
            .shape(total_cells)
            .create(DATASET_PARTITION)
            .map_err(h5_error("create dataset", &path))?;
        let raw_layout = Self::encode_layout(layout);
        file.new_dataset_builder()
            .with_data(raw_layout.as_slice())
            .create(DATASET_LAYOUT)
            .map_err(h5_error("create dataset", &path))?;
        for var in &self.variables {
            let total = layout.total(var.center) as usize;
            file.new_dataset::<f64>()
                .chunk((1, total))
                .shape((0.., total))
                .create(var.name.as_str())
                .map_err(h5_error("create dataset", &path))?;
        }
        Ok(file)
    }

    /// Rank 0: reopen and shrink every variable dataset to `from_step` steps.
    fn reopen_container(&self, from_step: u64, layout: &GlobalLayout) -> Result<File> {
        let path = self.paths.container();
        let file = File::open_rw(&path).map_err(h5_error("open", &path))?;
        for var in &self.variables {
            let ds = file
                .dataset(&var.name)
                .map_err(h5_error("open dataset", &path))?;
            ds.resize((from_step as usize, layout.total(var.center) as usize))
                .map_err(h5_error("resize", &path))?;
        }
        Ok(file)
    }

    /// Gather `local` to rank 0 and return the rank-ordered concatenation there.
    fn gather_row(comm: &dyn Communicator, local: &[f64]) -> Option<Vec<f64>> {
        comm.gather(0, &encode_f64(local))
            .map(|parts| parts.iter().flat_map(|p| decode_f64(p)).collect())
    }

    fn gather_i64(comm: &dyn Communicator, local: &[i64]) -> Option<Vec<i64>> {
        let bytes: Vec<u8> = local.iter().flat_map(|v| v.to_le_bytes()).collect();
        comm.gather(0, &bytes).map(|parts| {
            parts
                .iter()
                .flat_map(|p| {
                    p.chunks_exact(8)
                        .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                        .collect::<Vec<_>>()
                })
                .collect()
        })
    }
}

/// Owner rank per cell from the gathered per-rank cell counts.
fn owner_ranks(counts: &[Vec<u8>]) -> Vec<i32> {
    counts
        .iter()
        .enumerate()
        .flat_map(|(rank, raw)| {
            let count = raw
                .as_slice()
                .try_into()
                .map(u64::from_le_bytes)
                .unwrap_or(0);
            std::iter::repeat_n(rank as i32, count as usize)
        })
        .collect()
}

fn write_mesh(file: &File, coords: &[f64], connect: &[i64], owners: &[i32]) -> hdf5::Result<()> {
    file.dataset(DATASET_GEOMETRY)?.write_raw(coords)?;
    file.dataset(DATASET_CONNECT)?.write_raw(connect)?;
    file.dataset(DATASET_PARTITION)?.write_raw(owners)?;
    Ok(())
}

impl StorageBackend for Hdf5Backend {
    fn kind(&self) -> BackendKind {
        BackendKind::Hdf5
    }

    fn artifacts(&self) -> Vec<PathBuf> {
        vec![self.paths.container()]
    }

    fn probe(&self) -> Result<Option<StoredDataset>> {
        let path = self.paths.container();
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(&path).map_err(h5_error("open", &path))?;
        let raw: Vec<u64> = file
            .dataset(DATASET_LAYOUT)
            .and_then(|ds| ds.read_raw::<u64>())
            .map_err(|e| {
                WriterError::StorageConsistency(format!("{} has no readable layout: {e}", path.display()))
            })?;
        let layout = Self::decode_layout(&raw).ok_or_else(|| {
            WriterError::StorageConsistency(format!("{} has a malformed layout", path.display()))
        })?;
        let mut steps = u64::MAX;
        for var in &self.variables {
            let ds = file.dataset(&var.name).map_err(|_| {
                WriterError::StorageConsistency(format!(
                    "{} has no dataset for variable `{}`",
                    path.display(),
                    var.name
                ))
            })?;
            steps = steps.min(ds.shape().first().copied().unwrap_or(0) as u64);
        }
        Ok(Some(StoredDataset { layout, steps }))
    }

    fn verify_geometry(
        &self,
        partition: &PartitionDescriptor,
        layout: &GlobalLayout,
        rank: usize,
    ) -> Result<bool> {
        let path = self.paths.container();
        let file = File::open(&path).map_err(h5_error("open", &path))?;
        let coords: Vec<f64> = file
            .dataset(DATASET_GEOMETRY)
            .and_then(|ds| ds.read_raw::<f64>())
            .map_err(h5_error("read", &path))?;
        let start = layout.vertex_offset(rank) as usize * 3;
        let local = partition.vertices();
        if coords.get(start..start + local.len()) != Some(local) {
            return Ok(false);
        }
        let connect: Vec<i64> = file
            .dataset(DATASET_CONNECT)
            .and_then(|ds| ds.read_raw::<i64>())
            .map_err(h5_error("read", &path))?;
        let vpc = partition.topology().vertices_per_cell();
        let start = layout.cell_offset(rank) as usize * vpc;
        let local = partition.global_connectivity(layout.vertex_offset(rank));
        Ok(connect.get(start..start + local.len()) == Some(local.as_slice()))
    }

    fn create_or_open(
        &mut self,
        comm: &dyn Communicator,
        mode: OpenMode,
        layout: &GlobalLayout,
    ) -> Result<()> {
        self.rank = comm.rank();
        let opened = if self.rank == 0 {
            match mode {
                OpenMode::Fresh { backup } => self.create_container(backup, layout).map(Some),
                OpenMode::Append { from_step } => self.reopen_container(from_step, layout).map(Some),
            }
        } else {
            Ok(None)
        };
        self.file = agree(comm, opened)?;
        self.layout = Some(layout.clone());
        self.reopened = matches!(mode, OpenMode::Append { .. });
        self.closed = false;
        Ok(())
    }

    fn write_geometry(
        &mut self,
        comm: &dyn Communicator,
        partition: &PartitionDescriptor,
    ) -> Result<()> {
        if self.reopened {
            return Ok(());
        }
        let vertex_offset = self.layout()?.vertex_offset(self.rank);
        let coords = Self::gather_row(comm, partition.vertices());
        let connect = Self::gather_i64(comm, &partition.global_connectivity(vertex_offset));
        let owners = comm.gather(0, &(partition.cell_count() as u64).to_le_bytes());
        let local = match (coords, connect, owners) {
            (Some(coords), Some(connect), Some(owners)) => {
                let path = self.paths.container();
                let owners = owner_ranks(&owners);
                self.file().and_then(|file| {
                    write_mesh(file, &coords, &connect, &owners)
                        .map_err(h5_error("write geometry", &path))
                })
            }
            _ => Ok(()),
        };
        agree(comm, local)
    }

    fn allocate_step(&mut self, comm: &dyn Communicator, step: u64) -> Result<StepRegion> {
        let layout = self.layout()?.clone();
        let extended = if self.rank == 0 {
            let path = self.paths.container();
            self.file().and_then(|file| {
                self.variables.iter().try_for_each(|var| {
                    file.dataset(&var.name)
                        .and_then(|ds| ds.resize((step as usize + 1, layout.total(var.center) as usize)))
                        .map_err(h5_error("resize", &path))
                })
            })
        } else {
            Ok(())
        };
        agree(comm, extended)?;
        log::debug!("allocated step {step} in {}", self.paths.container().display());
        let offsets = self
            .variables
            .iter()
            .map(|var| layout.offset(var.center, self.rank))
            .collect();
        Ok(StepRegion { step, offsets })
    }

    fn collective_writes(&self) -> bool {
        true
    }

    fn write_variable(
        &mut self,
        comm: &dyn Communicator,
        region: &StepRegion,
        variable: usize,
        data: &[f64],
    ) -> Result<()> {
        let var = self.variables.get(variable).cloned().ok_or_else(|| {
            WriterError::InvalidSequence(format!("variable index {variable} out of range"))
        })?;
        let total = self.layout()?.total(var.center) as usize;
        let row = Self::gather_row(comm, data);
        let local = match row {
            Some(row) => {
                let path = self.paths.container();
                if row.len() != total {
                    Err(WriterError::InvalidSequence(format!(
                        "gathered {} values for `{}`, expected {total}",
                        row.len(),
                        var.name
                    )))
                } else {
                    self.file().and_then(|file| {
                        file.dataset(&var.name)
                            .and_then(|ds| ds.write_slice(row.as_slice(), (region.step as usize, 0..total)))
                            .map_err(h5_error("write", &path))
                    })
                }
            }
            None => Ok(()),
        };
        agree(comm, local)
    }

    fn flush_and_close(&mut self, comm: &dyn Communicator) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let path = self.paths.container();
        let local = match self.file.take() {
            Some(file) => file.flush().map_err(h5_error("flush", &path)),
            None => Ok(()),
        };
        self.closed = true;
        agree(comm, local)
    }

    fn release(&mut self) {
        self.file = None;
        self.closed = true;
    }
}
