#![allow(dead_code)]
use mesh_xdmf_writer::prelude::*;
use std::collections::BTreeMap;
use std::ops::Range;
use std::path::Path;

/// Run `body` once per rank of a thread group, results in rank order.
pub fn run_ranks<T: Send>(size: usize, body: impl Fn(LocalComm) -> T + Sync) -> Vec<T> {
    let comms = LocalComm::group(size);
    let body = &body;
    std::thread::scope(|s| {
        let handles: Vec<_> = comms
            .into_iter()
            .map(|comm| s.spawn(move || body(comm)))
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("rank panicked"))
            .collect()
    })
}

/// Unit square split into four triangles around its centre (4 cells, 5 vertices).
pub fn square_fan() -> (Vec<u32>, Vec<f64>) {
    (
        vec![0, 1, 4, 1, 2, 4, 2, 3, 4, 3, 0, 4],
        vec![
            0.0, 0.0, 0.0, //
            1.0, 0.0, 0.0, //
            1.0, 1.0, 0.0, //
            0.0, 1.0, 0.0, //
            0.5, 0.5, 0.0,
        ],
    )
}

/// `cells` disjoint triangles owned by `rank`, three vertices each.
pub fn triangle_soup(rank: usize, cells: usize) -> (Vec<u32>, Vec<f64>) {
    let connectivity = (0..cells as u32 * 3).collect();
    let mut vertices = Vec::with_capacity(cells * 9);
    for cell in 0..cells {
        let x = (rank * 100 + cell) as f64;
        vertices.extend_from_slice(&[x, 0.0, 0.0, x + 1.0, 0.0, 0.0, x, 1.0, 0.0]);
    }
    (connectivity, vertices)
}

/// Cell variable `a` and node variable `b`.
pub fn variables() -> VariableTable {
    VariableTable::new(vec![Variable::cell("a"), Variable::node("b")]).unwrap()
}

pub fn time_of(step: u64) -> f64 {
    step as f64 * 0.25
}

/// Deterministic sample of `variable` on `rank` at `step`; `seed` tells runs apart.
pub fn sample(seed: u64, rank: usize, step: u64, variable: usize, count: usize) -> Vec<f64> {
    (0..count)
        .map(|i| (seed * 100_000 + rank as u64 * 1000 + step * 10 + variable as u64) as f64 + i as f64 * 0.01)
        .collect()
}

/// Write `steps` of both variables over a triangle soup of `cells` per rank.
pub fn write_steps<C: Communicator>(
    comm: C,
    base: &Path,
    options: WriterOptions,
    cells: usize,
    steps: Range<u64>,
    seed: u64,
) -> Result<(), WriterError> {
    let rank = comm.rank();
    let (connectivity, vertices) = triangle_soup(rank, cells);
    let mut w = TimeStepWriter::with_options(comm, CellTopology::Triangle, base, variables(), options)?;
    w.init(cells, &connectivity, cells * 3, &vertices)?;
    for step in steps {
        w.add_time_step(time_of(step))?;
        w.write_data(0, &sample(seed, rank, step, 0, cells))?;
        w.write_data(1, &sample(seed, rank, step, 1, cells * 3))?;
    }
    w.close()
}

/// Every regular file in `dir`, by name.
pub fn snapshot(dir: &Path) -> BTreeMap<String, Vec<u8>> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .filter(|path| path.is_file())
        .map(|path| {
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            (name, std::fs::read(&path).unwrap())
        })
        .collect()
}

pub fn read_f64(path: &Path) -> Vec<f64> {
    std::fs::read(path)
        .unwrap()
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

pub fn read_i64(path: &Path) -> Vec<i64> {
    std::fs::read(path)
        .unwrap()
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

pub fn read_i32(path: &Path) -> Vec<i32> {
    std::fs::read(path)
        .unwrap()
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

/// Number of step grids in an XDMF document.
pub fn step_count(xdmf: &str) -> usize {
    xdmf.matches("GridType=\"Uniform\"").count()
}
