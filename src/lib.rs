#![cfg_attr(docsrs, feature(doc_cfg))]
//! # mesh-xdmf-writer
//!
//! Parallel writer for time series on a partitioned unstructured mesh. Each
//! process owns a disjoint block of cells and vertices and a set of named
//! scalar fields; the writer persists the mesh once, appends one sample of
//! every field per time step, and keeps an XDMF 2 document describing the
//! whole dataset so ParaView/VisIt can open it directly.
//!
//! ## Features
//! - Raw little-endian multi-file storage (default) or one HDF5 container (`hdf5-support`)
//! - Cell- and node-centered fields
//! - Restart: continue a stored run at any step, with output byte-identical to
//!   an uninterrupted run
//! - Pluggable communicators: serial ([`NoComm`](algs::communicator::NoComm)),
//!   threads ([`LocalComm`](algs::communicator::LocalComm)) and MPI (`mpi-support`)
//!
//! ## Usage
//!
//! ```toml
//! [dependencies]
//! mesh-xdmf-writer = "0.1"
//! # features = ["mpi-support", "hdf5-support"]
//! ```
//!
//! See [`writer::TimeStepWriter`] for the call sequence. The library logs
//! through the `log` facade and never installs a logger.

pub mod algs;
pub mod config;
pub mod data;
pub mod io;
pub mod restart;
pub mod topology;
pub mod writer;
pub mod writer_error;

/// A convenient prelude to import the most-used traits & types:
pub mod prelude {
    pub use crate::algs::communicator::{Communicator, LocalComm, NoComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::config::{BackendKind, WriterOptions};
    pub use crate::data::variables::{FieldCenter, Variable, VariableTable};
    pub use crate::topology::cell_type::CellTopology;
    pub use crate::writer::TimeStepWriter;
    pub use crate::writer_error::{ErrorKind, WriterError};
}
