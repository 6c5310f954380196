//! Raw multi-file backend.
//!
//! Layout, all values little-endian:
//!
//! | file                   | content                                         |
//! |------------------------|-------------------------------------------------|
//! | `<base>_geometry.bin`  | `f64 × 3` per vertex, rank order                |
//! | `<base>_connect.bin`   | `i64 × vertices_per_cell` per cell, global ids  |
//! | `<base>_partition.bin` | `i32` owner rank per cell                       |
//! | `<base>_<var>.bin`     | `f64` per cell/vertex, step-major, rank order   |
//! | `<base>_layout.json`   | per-rank counts and topology                    |
//!
//! Every rank holds its own handles and writes only its own byte ranges.
//! Rank 0 creates, truncates and extends files between agreement points.

use crate::algs::agreement::agree;
use crate::algs::communicator::Communicator;
use crate::config::BackendKind;
use crate::data::variables::VariableTable;
use crate::io::{DatasetPaths, OpenMode, StepRegion, StorageBackend, StoredDataset, retire_file};
use crate::topology::partition::{GlobalLayout, PartitionDescriptor};
use crate::writer_error::{IoContext, Result, WriterError};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const LAYOUT_RECORD_VERSION: u32 = 1;

pub const GEOMETRY_STREAM: &str = "geometry";
pub const CONNECT_STREAM: &str = "connect";
pub const PARTITION_STREAM: &str = "partition";

const F64_BYTES: u64 = 8;
const I64_BYTES: u64 = 8;
const I32_BYTES: u64 = 4;

/// Layout record stored next to the raw streams.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct LayoutRecord {
    version: u32,
    layout: GlobalLayout,
    /// Variable names of the run that wrote the record.
    #[serde(default)]
    variables: Vec<String>,
}

#[derive(Debug)]
struct OpenStream {
    path: PathBuf,
    file: File,
}

impl OpenStream {
    fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .open(&path)
            .with_path("open", &path)?;
        Ok(Self { path, file })
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .with_path("seek", &self.path)?;
        self.file.write_all(bytes).with_path("write", &self.path)
    }

    fn sync(&mut self) -> Result<()> {
        self.file.flush().with_path("flush", &self.path)?;
        self.file.sync_all().with_path("sync", &self.path)
    }
}

#[derive(Debug)]
struct Handles {
    geometry: OpenStream,
    connect: OpenStream,
    partition: OpenStream,
    variables: Vec<OpenStream>,
}

/// Flat-file backend; see the module docs for the layout.
#[derive(Debug)]
pub struct RawBackend {
    paths: DatasetPaths,
    variables: VariableTable,
    layout: Option<GlobalLayout>,
    rank: usize,
    handles: Option<Handles>,
    reopened: bool,
    closed: bool,
}

impl RawBackend {
    pub fn new(paths: DatasetPaths, variables: VariableTable) -> Self {
        Self {
            paths,
            variables,
            layout: None,
            rank: 0,
            handles: None,
            reopened: false,
            closed: false,
        }
    }

    fn variable_paths(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.variables.iter().map(|v| self.paths.stream(&v.name))
    }

    fn mesh_paths(&self) -> [PathBuf; 3] {
        [
            self.paths.stream(GEOMETRY_STREAM),
            self.paths.stream(CONNECT_STREAM),
            self.paths.stream(PARTITION_STREAM),
        ]
    }

    /// Bytes one step occupies in the file of `variable`.
    fn step_stride(layout: &GlobalLayout, variables: &VariableTable, variable: usize) -> u64 {
        variables
            .get(variable)
            .map(|v| layout.total(v.center) * F64_BYTES)
            .unwrap_or(0)
    }

    fn layout(&self) -> Result<&GlobalLayout> {
        self.layout
            .as_ref()
            .ok_or_else(|| WriterError::InvalidSequence("raw backend used before create_or_open".into()))
    }

    fn handles(&mut self) -> Result<&mut Handles> {
        self.handles
            .as_mut()
            .ok_or_else(|| WriterError::InvalidSequence("raw backend is not open".into()))
    }

    /// Variable streams listed in an existing layout record. An unreadable
    /// record lists nothing.
    fn recorded_streams(&self) -> Vec<PathBuf> {
        let record_path = self.paths.layout_record();
        let record = fs::read(&record_path)
            .ok()
            .and_then(|bytes| serde_json::from_slice::<LayoutRecord>(&bytes).ok());
        match record {
            Some(record) => record
                .variables
                .iter()
                .map(|name| self.paths.stream(name))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Rank 0: start from empty files. Streams of variables the previous
    /// run had and this one lacks are retired along with the rest.
    fn create_files(&self, backup: bool, layout: &GlobalLayout) -> Result<()> {
        let mut retired = self.recorded_streams();
        retired.extend(self.artifacts());
        retired.sort();
        retired.dedup();
        for path in &retired {
            retire_file(path, backup)?;
        }
        for path in self.mesh_paths().into_iter().chain(self.variable_paths()) {
            File::create(&path).with_path("create", &path)?;
        }
        let record = LayoutRecord {
            version: LAYOUT_RECORD_VERSION,
            layout: layout.clone(),
            variables: self.variables.iter().map(|v| v.name.clone()).collect(),
        };
        let bytes = serde_json::to_vec_pretty(&record).map_err(|e| {
            WriterError::io("encode", self.paths.layout_record(), std::io::Error::other(e))
        })?;
        let record_path = self.paths.layout_record();
        fs::write(&record_path, bytes).with_path("write", &record_path)
    }

    /// Rank 0: drop every step at or after `from_step`.
    fn truncate_steps(&self, from_step: u64, layout: &GlobalLayout) -> Result<()> {
        for (idx, path) in self.variable_paths().enumerate() {
            let keep = from_step * Self::step_stride(layout, &self.variables, idx);
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .with_path("open", &path)?;
            let len = file.metadata().with_path("stat", &path)?.len();
            if len > keep {
                log::debug!("truncating {} from {len} to {keep} bytes", path.display());
                file.set_len(keep).with_path("truncate", &path)?;
            }
        }
        Ok(())
    }

    /// Rank 0: make every variable file cover `step`.
    fn extend_to(&mut self, step: u64) -> Result<()> {
        let layout = self.layout()?.clone();
        let variables = self.variables.clone();
        let handles = self.handles()?;
        for (idx, stream) in handles.variables.iter_mut().enumerate() {
            let needed = (step + 1) * Self::step_stride(&layout, &variables, idx);
            let len = stream.file.metadata().with_path("stat", &stream.path)?.len();
            if len < needed {
                stream.file.set_len(needed).with_path("extend", &stream.path)?;
            }
        }
        Ok(())
    }

    fn open_handles(&self) -> Result<Handles> {
        let [geometry, connect, partition] = self.mesh_paths();
        Ok(Handles {
            geometry: OpenStream::open(geometry)?,
            connect: OpenStream::open(connect)?,
            partition: OpenStream::open(partition)?,
            variables: self
                .variable_paths()
                .map(OpenStream::open)
                .collect::<Result<Vec<_>>>()?,
        })
    }

    fn write_local_geometry(&mut self, partition: &PartitionDescriptor) -> Result<()> {
        let rank = self.rank;
        let layout = self.layout()?.clone();
        let vpc = partition.topology().vertices_per_cell() as u64;
        let handles = self.handles()?;
        handles.geometry.write_at(
            layout.vertex_offset(rank) * 3 * F64_BYTES,
            &encode_f64(partition.vertices()),
        )?;
        handles.connect.write_at(
            layout.cell_offset(rank) * vpc * I64_BYTES,
            &encode_i64(&partition.global_connectivity(layout.vertex_offset(rank))),
        )?;
        handles.partition.write_at(
            layout.cell_offset(rank) * I32_BYTES,
            &encode_i32(&vec![rank as i32; partition.cell_count()]),
        )
    }

    fn read_exact_at(path: &Path, offset: u64, len: usize) -> Result<Option<Vec<u8>>> {
        let mut file = File::open(path).with_path("open", path)?;
        let size = file.metadata().with_path("stat", path)?.len();
        if offset + len as u64 > size {
            return Ok(None);
        }
        file.seek(SeekFrom::Start(offset)).with_path("seek", path)?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf).with_path("read", path)?;
        Ok(Some(buf))
    }
}

pub(crate) fn encode_f64(values: &[f64]) -> Vec<u8> {
    let mut bytes = vec![0u8; values.len() * F64_BYTES as usize];
    LittleEndian::write_f64_into(values, &mut bytes);
    bytes
}

pub(crate) fn encode_i64(values: &[i64]) -> Vec<u8> {
    let mut bytes = vec![0u8; values.len() * I64_BYTES as usize];
    LittleEndian::write_i64_into(values, &mut bytes);
    bytes
}

pub(crate) fn encode_i32(values: &[i32]) -> Vec<u8> {
    let mut bytes = vec![0u8; values.len() * I32_BYTES as usize];
    LittleEndian::write_i32_into(values, &mut bytes);
    bytes
}

/// Decode little-endian `f64`s; trailing partial values are ignored.
pub fn decode_f64(bytes: &[u8]) -> Vec<f64> {
    let mut values = vec![0f64; bytes.len() / F64_BYTES as usize];
    LittleEndian::read_f64_into(&bytes[..values.len() * F64_BYTES as usize], &mut values);
    values
}

impl StorageBackend for RawBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Raw
    }

    fn artifacts(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.mesh_paths().into_iter().collect();
        paths.extend(self.variable_paths());
        paths.push(self.paths.layout_record());
        paths
    }

    fn probe(&self) -> Result<Option<StoredDataset>> {
        let record_path = self.paths.layout_record();
        if !record_path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&record_path).with_path("read", &record_path)?;
        let record: LayoutRecord = serde_json::from_slice(&bytes).map_err(|e| {
            WriterError::StorageConsistency(format!(
                "unreadable layout record {}: {e}",
                record_path.display()
            ))
        })?;
        if record.version != LAYOUT_RECORD_VERSION {
            return Err(WriterError::StorageConsistency(format!(
                "layout record version {} is not supported",
                record.version
            )));
        }
        let mut steps = u64::MAX;
        for (idx, path) in self.variable_paths().enumerate() {
            let len = match fs::metadata(&path) {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(WriterError::StorageConsistency(format!(
                        "variable file {} is missing",
                        path.display()
                    )));
                }
                Err(e) => return Err(WriterError::io("stat", &path, e)),
            };
            let stride = Self::step_stride(&record.layout, &self.variables, idx);
            steps = steps.min(if stride == 0 { 0 } else { len / stride });
        }
        Ok(Some(StoredDataset {
            layout: record.layout,
            steps,
        }))
    }

    fn verify_geometry(
        &self,
        partition: &PartitionDescriptor,
        layout: &GlobalLayout,
        rank: usize,
    ) -> Result<bool> {
        let [geometry, connect, _] = self.mesh_paths();
        let coords = encode_f64(partition.vertices());
        let stored = Self::read_exact_at(
            &geometry,
            layout.vertex_offset(rank) * 3 * F64_BYTES,
            coords.len(),
        )?;
        if stored.as_deref() != Some(coords.as_slice()) {
            return Ok(false);
        }
        let vpc = partition.topology().vertices_per_cell() as u64;
        let cells = encode_i64(&partition.global_connectivity(layout.vertex_offset(rank)));
        let stored = Self::read_exact_at(
            &connect,
            layout.cell_offset(rank) * vpc * I64_BYTES,
            cells.len(),
        )?;
        Ok(stored.as_deref() == Some(cells.as_slice()))
    }

    fn create_or_open(
        &mut self,
        comm: &dyn Communicator,
        mode: OpenMode,
        layout: &GlobalLayout,
    ) -> Result<()> {
        self.rank = comm.rank();
        let structural = if self.rank == 0 {
            match mode {
                OpenMode::Fresh { backup } => self.create_files(backup, layout),
                OpenMode::Append { from_step } => self.truncate_steps(from_step, layout),
            }
        } else {
            Ok(())
        };
        agree(comm, structural)?;

        let handles = agree(comm, self.open_handles())?;
        self.handles = Some(handles);
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
        let local = self.write_local_geometry(partition);
        agree(comm, local)
    }

    fn allocate_step(&mut self, comm: &dyn Communicator, step: u64) -> Result<StepRegion> {
        let layout = self.layout()?.clone();
        let extended = if self.rank == 0 { self.extend_to(step) } else { Ok(()) };
        agree(comm, extended)?;
        log::debug!("allocated step {step} in {}", self.paths.base().display());
        let offsets = self
            .variables
            .iter()
            .enumerate()
            .map(|(idx, var)| {
                step * Self::step_stride(&layout, &self.variables, idx)
                    + layout.offset(var.center, self.rank) * F64_BYTES
            })
            .collect();
        Ok(StepRegion { step, offsets })
    }

    fn collective_writes(&self) -> bool {
        false
    }

    fn write_variable(
        &mut self,
        _comm: &dyn Communicator,
        region: &StepRegion,
        variable: usize,
        data: &[f64],
    ) -> Result<()> {
        let offset = *region.offsets.get(variable).ok_or_else(|| {
            WriterError::InvalidSequence(format!("variable index {variable} out of range"))
        })?;
        let stream = self.handles()?.variables.get_mut(variable).ok_or_else(|| {
            WriterError::InvalidSequence(format!("variable index {variable} out of range"))
        })?;
        stream.write_at(offset, &encode_f64(data))
    }

    fn flush_and_close(&mut self, comm: &dyn Communicator) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let local = match self.handles.take() {
            Some(mut handles) => [&mut handles.geometry, &mut handles.connect, &mut handles.partition]
                .into_iter()
                .chain(handles.variables.iter_mut())
                .try_for_each(OpenStream::sync),
            None => Ok(()),
        };
        self.closed = true;
        agree(comm, local)
    }

    fn release(&mut self) {
        self.handles = None;
        self.closed = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::topology::cell_type::CellTopology;

    fn partition() -> PartitionDescriptor {
        PartitionDescriptor::new(
            CellTopology::Triangle,
            2,
            &[0, 1, 2, 0, 2, 3],
            4,
            &[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 0.0],
        )
        .unwrap()
    }

    fn backend(dir: &Path) -> RawBackend {
        RawBackend::new(
            DatasetPaths::new(dir.join("out")),
            VariableTable::from_names(["a", "b"]).unwrap(),
        )
    }

    #[test]
    fn fresh_create_writes_mesh_streams() {
        let dir = tempfile::tempdir().unwrap();
        let comm = NoComm;
        let p = partition();
        let layout = GlobalLayout::gather(&comm, &p).unwrap();
        let mut b = backend(dir.path());
        b.create_or_open(&comm, OpenMode::Fresh { backup: false }, &layout).unwrap();
        b.write_geometry(&comm, &p).unwrap();
        b.flush_and_close(&comm).unwrap();

        let geometry = fs::read(dir.path().join("out_geometry.bin")).unwrap();
        assert_eq!(decode_f64(&geometry), p.vertices());
        let connect = fs::read(dir.path().join("out_connect.bin")).unwrap();
        assert_eq!(connect.len(), 6 * 8);
        assert_eq!(LittleEndian::read_i64(&connect[16..24]), 2);
        let partition = fs::read(dir.path().join("out_partition.bin")).unwrap();
        assert_eq!(partition, vec![0u8; 8]);
        assert!(b.verify_geometry(&p, &layout, 0).unwrap());
    }

    #[test]
    fn steps_are_strided_and_probed() {
        let dir = tempfile::tempdir().unwrap();
        let comm = NoComm;
        let p = partition();
        let layout = GlobalLayout::gather(&comm, &p).unwrap();
        let mut b = backend(dir.path());
        b.create_or_open(&comm, OpenMode::Fresh { backup: false }, &layout).unwrap();
        for step in 0..3u64 {
            let region = b.allocate_step(&comm, step).unwrap();
            assert_eq!(region.offsets, vec![step * 16, step * 16]);
            b.write_variable(&comm, &region, 0, &[step as f64, -(step as f64)]).unwrap();
        }
        b.flush_and_close(&comm).unwrap();
        b.flush_and_close(&comm).unwrap();

        let a = decode_f64(&fs::read(dir.path().join("out_a.bin")).unwrap());
        assert_eq!(a, vec![0.0, -0.0, 1.0, -1.0, 2.0, -2.0]);
        // b was never written but still covers every step
        assert_eq!(fs::read(dir.path().join("out_b.bin")).unwrap().len(), 48);

        let stored = b.probe().unwrap().unwrap();
        assert_eq!(stored.steps, 3);
        assert_eq!(stored.layout, layout);
    }

    #[test]
    fn append_truncates_tail_steps() {
        let dir = tempfile::tempdir().unwrap();
        let comm = NoComm;
        let p = partition();
        let layout = GlobalLayout::gather(&comm, &p).unwrap();
        let mut b = backend(dir.path());
        b.create_or_open(&comm, OpenMode::Fresh { backup: false }, &layout).unwrap();
        for step in 0..4 {
            b.allocate_step(&comm, step).unwrap();
        }
        b.flush_and_close(&comm).unwrap();

        let mut b = backend(dir.path());
        b.create_or_open(&comm, OpenMode::Append { from_step: 2 }, &layout).unwrap();
        assert_eq!(b.probe().unwrap().unwrap().steps, 2);
        b.write_geometry(&comm, &partition()).unwrap();
        b.flush_and_close(&comm).unwrap();
    }

    #[test]
    fn probe_without_dataset_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(backend(dir.path()).probe().unwrap().is_none());
    }

    #[test]
    fn verify_detects_moved_vertices() {
        let dir = tempfile::tempdir().unwrap();
        let comm = NoComm;
        let p = partition();
        let layout = GlobalLayout::gather(&comm, &p).unwrap();
        let mut b = backend(dir.path());
        b.create_or_open(&comm, OpenMode::Fresh { backup: false }, &layout).unwrap();
        b.write_geometry(&comm, &p).unwrap();
        b.flush_and_close(&comm).unwrap();

        let mut coords = p.vertices().to_vec();
        coords[0] = 0.5;
        let moved =
            PartitionDescriptor::new(CellTopology::Triangle, 2, p.connectivity(), 4, &coords).unwrap();
        assert!(!b.verify_geometry(&moved, &layout, 0).unwrap());
    }
}
