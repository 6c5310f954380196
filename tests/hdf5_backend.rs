#![cfg(feature = "hdf5-support")]
mod util;
use util::*;

use mesh_xdmf_writer::io::DatasetPaths;
use mesh_xdmf_writer::prelude::*;

fn hdf5_options() -> WriterOptions {
    WriterOptions::default().with_backend(BackendKind::Hdf5)
}

fn dataset(base: &std::path::Path, name: &str) -> Vec<f64> {
    let file = hdf5::File::open(DatasetPaths::new(base).container()).unwrap();
    file.dataset(name).unwrap().read_raw().unwrap()
}

#[test]
fn split_run_matches_continuous_run() {
    let continuous = tempfile::tempdir().unwrap();
    let split = tempfile::tempdir().unwrap();
    let base_c = continuous.path().join("run");
    let base_s = split.path().join("run");

    for result in run_ranks(2, |comm| write_steps(comm, &base_c, hdf5_options(), 2, 0..5, 0)) {
        result.unwrap();
    }
    for result in run_ranks(2, |comm| write_steps(comm, &base_s, hdf5_options(), 2, 0..3, 0)) {
        result.unwrap();
    }
    for result in run_ranks(2, |comm| {
        write_steps(comm, &base_s, hdf5_options().with_initial_step(3), 2, 3..5, 0)
    }) {
        result.unwrap();
    }

    let doc_c = std::fs::read_to_string(DatasetPaths::new(&base_c).xdmf()).unwrap();
    let doc_s = std::fs::read_to_string(DatasetPaths::new(&base_s).xdmf()).unwrap();
    assert_eq!(doc_c, doc_s);
    assert!(doc_c.contains("run.h5:/a"));
    for name in ["a", "b", "geometry"] {
        assert_eq!(dataset(&base_c, name), dataset(&base_s, name), "{name}");
    }
}

#[test]
fn layout_mismatch_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("run");
    write_steps(NoComm, &base, hdf5_options(), 2, 0..2, 0).unwrap();
    let err = write_steps(NoComm, &base, hdf5_options().with_initial_step(1), 3, 1..2, 0)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StorageConsistency);
}
