//! Per-rank partition data and the group-wide layout derived from it.
//!
//! Connectivity handed to the writer is local: indices are 0-based within the
//! calling rank's vertex block. Backends shift every rank's indices by
//! [`GlobalLayout::vertex_offset`] when persisting.

use crate::algs::agreement::all_gather_u64;
use crate::algs::communicator::Communicator;
use crate::data::variables::FieldCenter;
use crate::topology::cell_type::CellTopology;
use crate::writer_error::{Result, WriterError};
use serde::{Deserialize, Serialize};

/// One rank's share of the mesh. Read-only once validated.
#[derive(Clone, Debug, PartialEq)]
pub struct PartitionDescriptor {
    topology: CellTopology,
    cell_count: usize,
    vertex_count: usize,
    connectivity: Vec<u32>,
    vertices: Vec<f64>,
}

impl PartitionDescriptor {
    /// Validate and take a copy of the local buffers.
    ///
    /// `vertices` holds three coordinates per vertex.
    pub fn new(
        topology: CellTopology,
        cell_count: usize,
        connectivity: &[u32],
        vertex_count: usize,
        vertices: &[f64],
    ) -> Result<Self> {
        if cell_count == 0 || vertex_count == 0 {
            return Err(WriterError::InvalidMesh(format!(
                "partition must have cells and vertices (cells={cell_count}, vertices={vertex_count})"
            )));
        }
        let vpc = topology.vertices_per_cell();
        if connectivity.len() != cell_count * vpc {
            return Err(WriterError::InvalidMesh(format!(
                "connectivity has {} entries, expected {cell_count} cells x {vpc}",
                connectivity.len()
            )));
        }
        if vertices.len() != vertex_count * 3 {
            return Err(WriterError::InvalidMesh(format!(
                "vertex buffer has {} coordinates, expected {vertex_count} x 3",
                vertices.len()
            )));
        }
        if let Some((pos, idx)) = connectivity
            .iter()
            .enumerate()
            .find(|&(_, &idx)| idx as usize >= vertex_count)
        {
            return Err(WriterError::InvalidMesh(format!(
                "cell {} references vertex {idx}, only {vertex_count} local vertices",
                pos / vpc
            )));
        }
        Ok(Self {
            topology,
            cell_count,
            vertex_count,
            connectivity: connectivity.to_vec(),
            vertices: vertices.to_vec(),
        })
    }

    pub fn topology(&self) -> CellTopology {
        self.topology
    }

    pub fn cell_count(&self) -> usize {
        self.cell_count
    }

    pub fn vertex_count(&self) -> usize {
        self.vertex_count
    }

    /// Local connectivity, `cell_count × vertices_per_cell` entries.
    pub fn connectivity(&self) -> &[u32] {
        &self.connectivity
    }

    /// Flat coordinates, `vertex_count × 3` entries.
    pub fn vertices(&self) -> &[f64] {
        &self.vertices
    }

    /// Local count for a field with the given centering.
    pub fn count(&self, center: FieldCenter) -> usize {
        match center {
            FieldCenter::Cell => self.cell_count,
            FieldCenter::Node => self.vertex_count,
        }
    }

    /// Connectivity shifted by this rank's global vertex offset.
    pub fn global_connectivity(&self, vertex_offset: u64) -> Vec<i64> {
        self.connectivity
            .iter()
            .map(|&idx| (vertex_offset + idx as u64) as i64)
            .collect()
    }
}

/// Cell and vertex counts of every rank, indexed by rank.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct GlobalLayout {
    pub topology: CellTopology,
    pub cells: Vec<u64>,
    pub vertices: Vec<u64>,
}

impl GlobalLayout {
    /// Exchange counts across the group. Collective.
    ///
    /// Every rank must use the same topology.
    pub fn gather<C>(comm: &C, partition: &PartitionDescriptor) -> Result<Self>
    where
        C: Communicator + ?Sized,
    {
        let gathered = all_gather_u64(
            comm,
            &[
                partition.topology().code(),
                partition.cell_count() as u64,
                partition.vertex_count() as u64,
            ],
        )?;
        let mut cells = Vec::with_capacity(gathered.len());
        let mut vertices = Vec::with_capacity(gathered.len());
        for (rank, entry) in gathered.iter().enumerate() {
            if entry[0] != partition.topology().code() {
                let theirs = CellTopology::from_code(entry[0])
                    .map(|t| t.xdmf_name())
                    .unwrap_or("unknown");
                return Err(WriterError::InvalidMesh(format!(
                    "rank {rank} uses {theirs} cells, expected {}",
                    partition.topology().xdmf_name()
                )));
            }
            cells.push(entry[1]);
            vertices.push(entry[2]);
        }
        Ok(Self {
            topology: partition.topology(),
            cells,
            vertices,
        })
    }

    /// Number of ranks the layout covers.
    pub fn size(&self) -> usize {
        self.cells.len()
    }

    pub fn total_cells(&self) -> u64 {
        self.cells.iter().sum()
    }

    pub fn total_vertices(&self) -> u64 {
        self.vertices.iter().sum()
    }

    pub fn cell_offset(&self, rank: usize) -> u64 {
        self.cells[..rank].iter().sum()
    }

    pub fn vertex_offset(&self, rank: usize) -> u64 {
        self.vertices[..rank].iter().sum()
    }

    pub fn total(&self, center: FieldCenter) -> u64 {
        match center {
            FieldCenter::Cell => self.total_cells(),
            FieldCenter::Node => self.total_vertices(),
        }
    }

    pub fn offset(&self, center: FieldCenter, rank: usize) -> u64 {
        match center {
            FieldCenter::Cell => self.cell_offset(rank),
            FieldCenter::Node => self.vertex_offset(rank),
        }
    }

    /// Human-readable difference to another layout, if any.
    pub fn mismatch(&self, stored: &GlobalLayout) -> Option<String> {
        if self.topology != stored.topology {
            return Some(format!(
                "stored topology {} differs from {}",
                stored.topology.xdmf_name(),
                self.topology.xdmf_name()
            ));
        }
        if self.size() != stored.size() {
            return Some(format!(
                "stored layout has {} ranks, running with {}",
                stored.size(),
                self.size()
            ));
        }
        for rank in 0..self.size() {
            if self.cells[rank] != stored.cells[rank] || self.vertices[rank] != stored.vertices[rank] {
                return Some(format!(
                    "rank {rank}: stored {} cells / {} vertices, got {} / {}",
                    stored.cells[rank], stored.vertices[rank], self.cells[rank], self.vertices[rank]
                ));
            }
        }
        None
    }
}
