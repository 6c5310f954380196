mod util;
use util::*;

use mesh_xdmf_writer::io::DatasetPaths;
use mesh_xdmf_writer::prelude::*;

#[test]
fn write_before_first_step_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("run");
    let results = run_ranks(2, |comm| {
        let rank = comm.rank();
        let (connectivity, vertices) = triangle_soup(rank, 2);
        let mut w = TimeStepWriter::new(comm, CellTopology::Triangle, &base, variables()).unwrap();
        w.init(2, &connectivity, 6, &vertices).unwrap();
        let early = w.write_data(0, &[1.0, 2.0]);
        w.close().unwrap();
        early
    });
    for result in results {
        assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidSequence);
    }
    let paths = DatasetPaths::new(&base);
    assert_eq!(std::fs::metadata(paths.stream("a")).unwrap().len(), 0);
    assert_eq!(std::fs::metadata(paths.stream("b")).unwrap().len(), 0);
    assert_eq!(step_count(&std::fs::read_to_string(paths.xdmf()).unwrap()), 0);
}

#[test]
fn out_of_range_variable_and_wrong_length() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("run");
    let (connectivity, vertices) = triangle_soup(0, 2);
    let mut w = TimeStepWriter::new(NoComm, CellTopology::Triangle, &base, variables()).unwrap();
    w.init(2, &connectivity, 6, &vertices).unwrap();
    w.add_time_step(0.0).unwrap();
    assert_eq!(w.write_data(2, &[0.0; 2]).unwrap_err().kind(), ErrorKind::InvalidSequence);
    // node variable needs one value per vertex
    assert_eq!(w.write_data(1, &[0.0; 2]).unwrap_err().kind(), ErrorKind::InvalidSequence);
    w.close().unwrap();
    assert_eq!(w.write_data(0, &[0.0; 2]).unwrap_err().kind(), ErrorKind::InvalidSequence);

    let b = read_f64(&DatasetPaths::new(&base).stream("b"));
    assert_eq!(b, vec![0.0; 6], "allocated but untouched");
    let xdmf = std::fs::read_to_string(DatasetPaths::new(&base).xdmf()).unwrap();
    assert!(!xdmf.contains("<Attribute Name=\"b\""));
}

#[test]
fn duplicate_writes_last_one_wins_by_default() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("run");
    let (connectivity, vertices) = triangle_soup(0, 1);
    let mut w = TimeStepWriter::new(NoComm, CellTopology::Triangle, &base, variables()).unwrap();
    w.init(1, &connectivity, 3, &vertices).unwrap();
    w.add_time_step(0.0).unwrap();
    w.write_data(0, &[1.0]).unwrap();
    w.write_data(0, &[2.0]).unwrap();
    w.close().unwrap();
    assert_eq!(read_f64(&DatasetPaths::new(&base).stream("a")), vec![2.0]);
    let xdmf = std::fs::read_to_string(DatasetPaths::new(&base).xdmf()).unwrap();
    assert_eq!(xdmf.matches("<Attribute Name=\"a\"").count(), 1);
}

#[test]
fn duplicate_writes_can_be_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("run");
    let (connectivity, vertices) = triangle_soup(0, 1);
    let options = WriterOptions::default().with_reject_duplicate_writes(true);
    let mut w =
        TimeStepWriter::with_options(NoComm, CellTopology::Triangle, &base, variables(), options)
            .unwrap();
    w.init(1, &connectivity, 3, &vertices).unwrap();
    w.add_time_step(0.0).unwrap();
    w.write_data(0, &[1.0]).unwrap();
    let err = w.write_data(0, &[2.0]).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidSequence);
    // a new step accepts the variable again
    w.add_time_step(1.0).unwrap();
    w.write_data(0, &[3.0]).unwrap();
    w.close().unwrap();
    assert_eq!(read_f64(&DatasetPaths::new(&base).stream("a")), vec![1.0, 3.0]);
}

#[test]
fn invalid_partition_on_one_rank_fails_all() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("run");
    let results = run_ranks(2, |comm| {
        let rank = comm.rank();
        let (mut connectivity, vertices) = triangle_soup(rank, 2);
        if rank == 0 {
            connectivity[5] = 6;
        }
        let mut w = TimeStepWriter::new(comm, CellTopology::Triangle, &base, variables())?;
        w.init(2, &connectivity, 6, &vertices)
    });
    assert!(matches!(results[0], Err(WriterError::InvalidMesh(_))));
    assert!(matches!(results[1], Err(WriterError::PeerFailure { rank: 0, .. })));
    for result in &results {
        assert_eq!(result.as_ref().unwrap_err().kind(), ErrorKind::InvalidMesh);
    }
    assert!(!DatasetPaths::new(&base).xdmf().exists());
}

#[test]
fn zero_sized_partition_is_invalid() {
    let dir = tempfile::tempdir().unwrap();
    let mut w = TimeStepWriter::new(
        NoComm,
        CellTopology::Tetrahedron,
        dir.path().join("run"),
        variables(),
    )
    .unwrap();
    assert_eq!(w.init(0, &[], 0, &[]).unwrap_err().kind(), ErrorKind::InvalidMesh);
}

#[test]
fn non_finite_time_on_one_rank_fails_all() {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path().join("run");
    let results = run_ranks(2, |comm| {
        let rank = comm.rank();
        let (connectivity, vertices) = triangle_soup(rank, 2);
        let mut w = TimeStepWriter::new(comm, CellTopology::Triangle, &base, variables()).unwrap();
        w.init(2, &connectivity, 6, &vertices).unwrap();
        let time = if rank == 1 { f64::NAN } else { 0.0 };
        let added = w.add_time_step(time);
        assert_eq!((w.current_step(), w.next_step()), (None, 0));
        w.add_time_step(0.0).unwrap();
        w.close().unwrap();
        added
    });
    assert!(matches!(results[0], Err(WriterError::PeerFailure { rank: 1, .. })));
    assert!(matches!(results[1], Err(WriterError::InvalidSequence(_))));
    let xdmf = std::fs::read_to_string(DatasetPaths::new(&base).xdmf()).unwrap();
    assert_eq!(step_count(&xdmf), 1);
}
