use std::mem;

use anyhow::Result;
use byteorder::{WriteBytesExt, LE};
use glam::Mat4;
use gltf::json::{self, validation::Checked, Value};

use crate::conversion::Vertex;

/// Writes float elements into the binary buffer and registers the matching
/// buffer view and accessor. When `bounds` is set, the per-component minimum
/// and maximum are tracked while writing and recorded on the accessor.
/// Returns the index of the accessor.
pub fn insert_float_bytes<const N: usize>(
    root: &mut json::Root,
    buffer: &mut Vec<u8>,
    elements: &[[f32; N]],
    type_: json::accessor::Type,
    bounds: bool,
    target: Option<json::buffer::Target>,
) -> Result<usize> {
    align_to(buffer, mem::size_of::<f32>());
    let view = push_view(root, buffer.len(), elements.len() * mem::size_of::<[f32; N]>(), target);

    let mut min = [f32::MAX; N];
    let mut max = [f32::MIN; N];
    for element in elements {
        for (component, &value) in element.iter().enumerate() {
            min[component] = min[component].min(value);
            max[component] = max[component].max(value);
            buffer.write_f32::<LE>(value)?;
        }
    }

    root.accessors.push(json::Accessor {
        buffer_view: Some(view),
        byte_offset: 0,
        count: elements.len() as u32,
        type_: Checked::Valid(type_),
        component_type: Checked::Valid(json::accessor::GenericComponentType(
            json::accessor::ComponentType::F32,
        )),
        min: bounds.then(|| Value::from(min.to_vec())),
        max: bounds.then(|| Value::from(max.to_vec())),
        name: None,
        normalized: false,
        sparse: None,
        extensions: None,
        extras: Default::default(),
    });

    Ok(root.accessors.len() - 1)
}

/// Writes the JOINTS_0 attribute of the vertices as unsigned shorts. Unused
/// influence slots are written as joint 0; their zero weight keeps them inert.
pub fn insert_joint_bytes(
    root: &mut json::Root,
    buffer: &mut Vec<u8>,
    vertices: &[Vertex],
) -> Result<usize> {
    align_to(buffer, mem::size_of::<u16>());
    let view = push_view(
        root,
        buffer.len(),
        vertices.len() * mem::size_of::<[u16; 4]>(),
        Some(json::buffer::Target::ArrayBuffer),
    );

    for vertex in vertices {
        for &bone in &vertex.bones {
            buffer.write_u16::<LE>(bone.max(0) as u16)?;
        }
    }

    root.accessors.push(json::Accessor {
        buffer_view: Some(view),
        byte_offset: 0,
        count: vertices.len() as u32,
        type_: Checked::Valid(json::accessor::Type::Vec4),
        component_type: Checked::Valid(json::accessor::GenericComponentType(
            json::accessor::ComponentType::U16,
        )),
        min: None,
        max: None,
        name: None,
        normalized: false,
        sparse: None,
        extensions: None,
        extras: Default::default(),
    });

    Ok(root.accessors.len() - 1)
}

/// Writes the WEIGHTS_0 attribute of the vertices, renormalizing the weights
/// of each vertex so they sum to one. Vertices without influences keep their
/// all-zero weights.
pub fn insert_weight_bytes(
    root: &mut json::Root,
    buffer: &mut Vec<u8>,
    vertices: &[Vertex],
) -> Result<usize> {
    align_to(buffer, mem::size_of::<f32>());
    let view = push_view(
        root,
        buffer.len(),
        vertices.len() * mem::size_of::<[f32; 4]>(),
        Some(json::buffer::Target::ArrayBuffer),
    );

    let mut min = [f32::MAX; 4];
    let mut max = [f32::MIN; 4];
    for vertex in vertices {
        let total: f32 = vertex.weights.iter().sum();
        let weights = if total > 0. {
            vertex.weights.map(|weight| weight / total)
        } else {
            vertex.weights
        };
        for (component, weight) in weights.into_iter().enumerate() {
            min[component] = min[component].min(weight);
            max[component] = max[component].max(weight);
            buffer.write_f32::<LE>(weight)?;
        }
    }

    root.accessors.push(json::Accessor {
        buffer_view: Some(view),
        byte_offset: 0,
        count: vertices.len() as u32,
        type_: Checked::Valid(json::accessor::Type::Vec4),
        component_type: Checked::Valid(json::accessor::GenericComponentType(
            json::accessor::ComponentType::F32,
        )),
        min: (!vertices.is_empty()).then(|| Value::from(min.to_vec())),
        max: (!vertices.is_empty()).then(|| Value::from(max.to_vec())),
        name: None,
        normalized: false,
        sparse: None,
        extensions: None,
        extras: Default::default(),
    });

    Ok(root.accessors.len() - 1)
}

/// Writes the index buffer of a mesh as unsigned ints.
pub fn insert_index_bytes(
    root: &mut json::Root,
    buffer: &mut Vec<u8>,
    indices: &[u32],
) -> Result<usize> {
    align_to(buffer, mem::size_of::<u32>());
    let view = push_view(
        root,
        buffer.len(),
        indices.len() * mem::size_of::<u32>(),
        Some(json::buffer::Target::ElementArrayBuffer),
    );

    for &index in indices {
        buffer.write_u32::<LE>(index)?;
    }

    root.accessors.push(json::Accessor {
        buffer_view: Some(view),
        byte_offset: 0,
        count: indices.len() as u32,
        type_: Checked::Valid(json::accessor::Type::Scalar),
        component_type: Checked::Valid(json::accessor::GenericComponentType(
            json::accessor::ComponentType::U32,
        )),
        min: None,
        max: None,
        name: None,
        normalized: false,
        sparse: None,
        extensions: None,
        extras: Default::default(),
    });

    Ok(root.accessors.len() - 1)
}

/// Writes a list of matrices in column-major order, used for the inverse bind
/// matrices of the skin.
pub fn insert_matrix_bytes(
    root: &mut json::Root,
    buffer: &mut Vec<u8>,
    matrices: &[Mat4],
) -> Result<usize> {
    align_to(buffer, mem::size_of::<f32>());
    let view = push_view(
        root,
        buffer.len(),
        matrices.len() * mem::size_of::<[f32; 4 * 4]>(),
        None,
    );

    for matrix in matrices {
        for value in matrix.to_cols_array() {
            buffer.write_f32::<LE>(value)?;
        }
    }

    root.accessors.push(json::Accessor {
        buffer_view: Some(view),
        byte_offset: 0,
        count: matrices.len() as u32,
        type_: Checked::Valid(json::accessor::Type::Mat4),
        component_type: Checked::Valid(json::accessor::GenericComponentType(
            json::accessor::ComponentType::F32,
        )),
        min: None,
        max: None,
        name: None,
        normalized: false,
        sparse: None,
        extensions: None,
        extras: Default::default(),
    });

    Ok(root.accessors.len() - 1)
}

fn push_view(
    root: &mut json::Root,
    offset: usize,
    length: usize,
    target: Option<json::buffer::Target>,
) -> json::Index<json::buffer::View> {
    root.buffer_views.push(json::buffer::View {
        buffer: json::Index::new(0),
        byte_offset: Some(offset as u32),
        byte_length: length as u32,
        byte_stride: None,
        name: None,
        target: target.map(Checked::Valid),
        extensions: None,
        extras: Default::default(),
    });

    json::Index::new(root.buffer_views.len() as u32 - 1)
}

/// Adds zeros to the buffer until its length is a multiple of n.
pub fn align_to(buffer: &mut Vec<u8>, n: usize) {
    while buffer.len() % n != 0 {
        buffer.push(0);
    }
}
