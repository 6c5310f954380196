//! Cell topology metadata for partitioned meshes.

use serde::{Deserialize, Serialize};

/// Cell kinds a writer can persist. One kind per writer, fixed at construction.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum CellTopology {
    /// 2D simplex (triangle).
    Triangle,
    /// 2D tensor-product cell (quad).
    Quadrilateral,
    /// 3D simplex (tet).
    Tetrahedron,
    /// 3D tensor-product cell (hex).
    Hexahedron,
}

impl CellTopology {
    pub const ALL: [CellTopology; 4] = [
        CellTopology::Triangle,
        CellTopology::Quadrilateral,
        CellTopology::Tetrahedron,
        CellTopology::Hexahedron,
    ];

    /// Number of vertices per cell.
    pub fn vertices_per_cell(self) -> usize {
        match self {
            CellTopology::Triangle => 3,
            CellTopology::Quadrilateral | CellTopology::Tetrahedron => 4,
            CellTopology::Hexahedron => 8,
        }
    }

    /// XDMF `TopologyType` tag.
    pub fn xdmf_name(self) -> &'static str {
        match self {
            CellTopology::Triangle => "Triangle",
            CellTopology::Quadrilateral => "Quadrilateral",
            CellTopology::Tetrahedron => "Tetrahedron",
            CellTopology::Hexahedron => "Hexahedron",
        }
    }

    /// Stable code stored in layout records.
    pub fn code(self) -> u64 {
        match self {
            CellTopology::Triangle => 3,
            CellTopology::Quadrilateral => 4,
            CellTopology::Tetrahedron => 5,
            CellTopology::Hexahedron => 6,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    pub fn from_xdmf_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.xdmf_name() == name)
    }
}
