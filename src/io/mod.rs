//! Storage backends and the XDMF metadata document.
//!
//! A backend maps logical (variable, step, rank) triples onto physical
//! storage. Two families implement [`StorageBackend`]:
//!
//! - [`raw::RawBackend`]: flat little-endian files, one per variable.
//! - `hdf5::Hdf5Backend`: one HDF5 container (feature `hdf5-support`).
//!
//! The writer never mixes families; the metadata document in [`xdmf`]
//! renders locators for whichever family is active.

#[cfg(feature = "hdf5-support")]
pub mod hdf5;
pub mod raw;
pub mod xdmf;

use crate::algs::communicator::Communicator;
use crate::config::BackendKind;
use crate::data::variables::VariableTable;
use crate::topology::partition::{GlobalLayout, PartitionDescriptor};
use crate::writer_error::Result;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// How [`StorageBackend::create_or_open`] treats existing storage.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpenMode {
    /// Discard prior content; with `backup`, existing files are renamed to `<file>.bak` first.
    Fresh { backup: bool },
    /// Keep steps below `from_step`, drop anything after, allocate `from_step` next.
    Append { from_step: u64 },
}

/// Storage reserved for one time step.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StepRegion {
    /// Step index the region belongs to.
    pub step: u64,
    /// Per-variable position of this rank's contribution: a byte offset for
    /// raw files, an element offset within the step slice for HDF5.
    pub offsets: Vec<u64>,
}

/// What an existing dataset records about itself.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct StoredDataset {
    pub layout: GlobalLayout,
    /// Number of complete steps present for every variable.
    pub steps: u64,
}

/// Uniform primitive set over one storage family.
///
/// Methods documented as collective must be called by every rank in the
/// same order. Rank 0 performs structural changes.
pub trait StorageBackend {
    fn kind(&self) -> BackendKind;

    /// Files making up the dataset (existing or not).
    fn artifacts(&self) -> Vec<PathBuf>;

    /// Read the stored layout and step count; `None` if nothing is stored.
    /// Read-only, called on rank 0.
    fn probe(&self) -> Result<Option<StoredDataset>>;

    /// Does the stored geometry block of `rank` equal `partition`? Read-only, per rank.
    fn verify_geometry(
        &self,
        partition: &PartitionDescriptor,
        layout: &GlobalLayout,
        rank: usize,
    ) -> Result<bool>;

    /// Create or reopen storage. Collective.
    fn create_or_open(
        &mut self,
        comm: &dyn Communicator,
        mode: OpenMode,
        layout: &GlobalLayout,
    ) -> Result<()>;

    /// Persist coordinates, global connectivity and cell ownership once;
    /// a no-op on reopened storage. Collective.
    fn write_geometry(&mut self, comm: &dyn Communicator, partition: &PartitionDescriptor)
    -> Result<()>;

    /// Reserve storage for `step` across all variables. Collective.
    fn allocate_step(&mut self, comm: &dyn Communicator, step: u64) -> Result<StepRegion>;

    /// Whether [`write_variable`](Self::write_variable) is collective.
    fn collective_writes(&self) -> bool;

    /// Write this rank's values of `variable` into `region`.
    fn write_variable(
        &mut self,
        comm: &dyn Communicator,
        region: &StepRegion,
        variable: usize,
        data: &[f64],
    ) -> Result<()>;

    /// Make every write durable and release handles. Collective; a second call is a no-op.
    fn flush_and_close(&mut self, comm: &dyn Communicator) -> Result<()>;

    /// Drop handles without any collective step (used from `Drop`).
    fn release(&mut self);
}

/// Construct the backend for `kind`. Performs no I/O.
pub fn open_backend(
    kind: BackendKind,
    paths: &DatasetPaths,
    variables: &VariableTable,
) -> Box<dyn StorageBackend> {
    match kind {
        BackendKind::Raw => Box::new(raw::RawBackend::new(paths.clone(), variables.clone())),
        #[cfg(feature = "hdf5-support")]
        BackendKind::Hdf5 => Box::new(hdf5::Hdf5Backend::new(paths.clone(), variables.clone())),
    }
}

/// File names derived from a base path without extension.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DatasetPaths {
    base: PathBuf,
}

impl DatasetPaths {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// `<base><suffix>`
    pub fn with_suffix(&self, suffix: &str) -> PathBuf {
        let mut raw: OsString = self.base.clone().into_os_string();
        raw.push(suffix);
        PathBuf::from(raw)
    }

    /// The metadata document, `<base>.xdmf`.
    pub fn xdmf(&self) -> PathBuf {
        self.with_suffix(".xdmf")
    }

    /// The HDF5 container, `<base>.h5`.
    pub fn container(&self) -> PathBuf {
        self.with_suffix(".h5")
    }

    /// A raw binary stream, `<base>_<name>.bin`.
    pub fn stream(&self, name: &str) -> PathBuf {
        self.with_suffix(&format!("_{name}.bin"))
    }

    /// The raw layout record, `<base>_layout.json`.
    pub fn layout_record(&self) -> PathBuf {
        self.with_suffix("_layout.json")
    }

    /// Name of `path` relative to the document's directory.
    pub fn reference(path: &Path) -> String {
        path.file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string())
    }

    /// Backup location of `path`, `<path>.bak`.
    pub fn backup(path: &Path) -> PathBuf {
        let mut raw = path.as_os_str().to_os_string();
        raw.push(".bak");
        PathBuf::from(raw)
    }
}

/// Rename `path` to its backup (replacing an older backup) or delete it.
/// Missing files are fine.
pub(crate) fn retire_file(path: &Path, backup: bool) -> Result<()> {
    use crate::writer_error::IoContext;
    if !path.exists() {
        return Ok(());
    }
    if backup {
        let target = DatasetPaths::backup(path);
        log::info!("backing up {} to {}", path.display(), target.display());
        std::fs::rename(path, &target).with_path("rename", path)
    } else {
        std::fs::remove_file(path).with_path("remove", path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths() {
        let paths = DatasetPaths::new("/out/run1");
        assert_eq!(paths.xdmf(), PathBuf::from("/out/run1.xdmf"));
        assert_eq!(paths.container(), PathBuf::from("/out/run1.h5"));
        assert_eq!(paths.stream("a"), PathBuf::from("/out/run1_a.bin"));
        assert_eq!(paths.layout_record(), PathBuf::from("/out/run1_layout.json"));
        assert_eq!(DatasetPaths::reference(&paths.stream("geometry")), "run1_geometry.bin");
        assert_eq!(
            DatasetPaths::backup(&paths.xdmf()),
            PathBuf::from("/out/run1.xdmf.bak")
        );
    }

    #[test]
    fn retire_missing_file_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        retire_file(&dir.path().join("absent.bin"), true).unwrap();
    }

    #[test]
    fn retire_moves_or_removes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.bin");
        std::fs::write(&path, b"old").unwrap();
        retire_file(&path, true).unwrap();
        assert!(!path.exists());
        assert_eq!(std::fs::read(dir.path().join("x.bin.bak")).unwrap(), b"old");

        std::fs::write(&path, b"new").unwrap();
        retire_file(&path, false).unwrap();
        assert!(!path.exists());
    }
}
