//! Writer configuration.
//!
//! Options are plain data so they can be built in code with the `with_*`
//! methods or loaded from a JSON document shipped with a simulation setup.

use crate::writer_error::{Result, WriterError};
use serde::{Deserialize, Serialize};

/// Storage family a writer persists into.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Flat little-endian binary files, one per variable.
    #[default]
    Raw,
    /// One HDF5 container with an extendable dataset per variable.
    #[cfg(feature = "hdf5-support")]
    Hdf5,
}

/// Writer options; `Default` gives a fresh raw-binary run.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WriterOptions {
    /// Storage backend.
    pub backend: BackendKind,
    /// Step index to continue from; 0 starts a new dataset.
    pub initial_step: u64,
    /// On a fresh start, rename existing artifacts to `<file>.bak` instead of truncating them.
    pub backup_existing: bool,
    /// On append, keep the step blocks below `initial_step` in the metadata document.
    pub keep_history: bool,
    /// Rewrite the metadata document after every `add_time_step`.
    pub flush_metadata_every_step: bool,
    /// Treat a second `write_data` for the same variable in one step as an error.
    pub reject_duplicate_writes: bool,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            initial_step: 0,
            backup_existing: true,
            keep_history: true,
            flush_metadata_every_step: false,
            reject_duplicate_writes: false,
        }
    }
}

impl WriterOptions {
    /// Parse options from JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| WriterError::InvalidConfiguration(format!("writer options: {e}")))
    }

    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Continue an existing sequence at `step`.
    pub fn with_initial_step(mut self, step: u64) -> Self {
        self.initial_step = step;
        self
    }

    pub fn with_backup_existing(mut self, backup: bool) -> Self {
        self.backup_existing = backup;
        self
    }

    pub fn with_keep_history(mut self, keep: bool) -> Self {
        self.keep_history = keep;
        self
    }

    pub fn with_flush_metadata_every_step(mut self, flush: bool) -> Self {
        self.flush_metadata_every_step = flush;
        self
    }

    pub fn with_reject_duplicate_writes(mut self, reject: bool) -> Self {
        self.reject_duplicate_writes = reject;
        self
    }
}
