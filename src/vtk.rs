//! Export of tree leaves for visual inspection.

use std::path::Path;

use vtkio::model::{
    Attributes, ByteOrder, CellType, Cells, DataSet, IOBuffer, UnstructuredGridPiece, Version,
    VertexNumbers, Vtk,
};

use crate::{
    geometry::BoundingBox,
    octree::{leaf_level, num_leaves},
    sfc::node_box,
};

// Corner offsets in VTK hexahedron order.
const HEXAHEDRON_CORNERS: [[usize; 3]; 8] = [
    [0, 0, 0],
    [1, 0, 0],
    [1, 1, 0],
    [0, 1, 0],
    [0, 0, 1],
    [1, 0, 1],
    [1, 1, 1],
    [0, 1, 1],
];

/// Write the leaves of a cornerstone tree as hexahedra to a legacy ASCII VTK file.
pub fn export_tree_to_vtk<P: AsRef<Path>>(
    tree: &[u64],
    bbox: &BoundingBox,
    path: P,
) -> Result<(), vtkio::Error> {
    let nleaves = num_leaves(tree);
    let mut points = Vec::<f64>::with_capacity(3 * 8 * nleaves);

    for leaf in 0..nleaves {
        let aabb = bbox.cell_aabb(&node_box(tree[leaf], leaf_level(tree, leaf)));
        let corners = [aabb.min, aabb.max];
        for corner in HEXAHEDRON_CORNERS {
            for axis in 0..3 {
                points.push(corners[corner[axis]][axis]);
            }
        }
    }

    let connectivity = (0..8 * nleaves as u64).collect::<Vec<_>>();
    let offsets = (1..=nleaves as u64).map(|leaf| 8 * leaf).collect::<Vec<_>>();

    let vtk = Vtk {
        version: Version { major: 4, minor: 1 },
        byte_order: ByteOrder::BigEndian,
        title: String::from("Cornerstone tree"),
        file_path: None,
        data: DataSet::inline(UnstructuredGridPiece {
            points: IOBuffer::F64(points),
            cells: Cells {
                cell_verts: VertexNumbers::XML {
                    connectivity,
                    offsets,
                },
                types: vec![CellType::Hexahedron; nleaves],
            },
            data: Attributes {
                point: Vec::new(),
                cell: Vec::new(),
            },
        }),
    };

    vtk.export_ascii(path.as_ref())
}
