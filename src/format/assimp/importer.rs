use anyhow::{anyhow, Context, Result};
use asset_importer::{material_keys, postprocess::PostProcessSteps, TextureType};
use glam::{Mat4, Quat, Vec2, Vec3A};
use log::debug;

use crate::conversion::{
    Animation, Asset, Channel, Importer, Material, Mesh, QuatKey, Scene, SceneNode, VectorKey,
    Vertex,
};

/// Imports every interchange format the Assimp library knows how to read,
/// covering the sources the native importers do not. The scene returned by
/// the bindings owns the native data; it is released when the import ends,
/// after everything is copied into the intermediate model.
#[derive(Default)]
pub struct AssimpImporter {}

impl Importer for AssimpImporter {
    fn import(&self, asset: &Asset, scene: &mut Scene) -> Result<()> {
        let source = asset_importer::Scene::from_file_with_flags(asset.path(), import_flags())
            .with_context(|| format!("Failed to import '{}'", asset.path().display()))?;

        scene.name = asset.name().to_string();

        convert_nodes(&source, scene)?;
        convert_meshes(&source, scene);
        convert_animations(&source, scene);
        convert_materials(&source, scene);

        debug!(
            "Imported '{}': {} meshes, {} bones, {} animations",
            asset.name(),
            scene.meshes.len(),
            scene.skeleton.len(),
            scene.animations.len()
        );

        Ok(())
    }

    fn postprocess(&self, scene: &mut Scene) {
        scene.skeleton.derive_parents(&scene.nodes);
    }

    fn extensions(&self) -> &[&str] {
        &["fbx", "obj", "dae", "3ds", "blend", "stl", "ply"]
    }
}

fn import_flags() -> PostProcessSteps {
    PostProcessSteps::TRIANGULATE
        | PostProcessSteps::JOIN_IDENTICAL_VERTICES
        | PostProcessSteps::CALC_TANGENT_SPACE
        | PostProcessSteps::SORT_BY_PTYPE
        | PostProcessSteps::FLIP_UVS
        | PostProcessSteps::FIND_INVALID_DATA
}

fn convert_nodes(source: &asset_importer::Scene, scene: &mut Scene) -> Result<()> {
    let root = source
        .root_node()
        .ok_or_else(|| anyhow!("The imported scene has no root node"))?;
    push_node(scene, &root, None);

    Ok(())
}

fn push_node(scene: &mut Scene, node: &asset_importer::node::Node, parent: Option<usize>) -> usize {
    let index = scene.nodes.len();
    let mut scene_node = SceneNode::new(&node.name(), parent);
    scene_node.transform = matrix(node.transformation());
    scene_node.meshes = node.mesh_indices_iter().collect();
    scene.nodes.push(scene_node);

    for child in node.children() {
        let child_index = push_node(scene, &child, Some(index));
        scene.nodes[index].children.push(child_index);
    }

    index
}

fn convert_meshes(source: &asset_importer::Scene, scene: &mut Scene) {
    for mesh in source.meshes() {
        let normals = mesh.normals().unwrap_or_default();
        let tangents = mesh.tangents().unwrap_or_default();
        let bitangents = mesh.bitangents().unwrap_or_default();
        let uvs = mesh.texture_coords(0).unwrap_or_default();

        let mut vertices: Vec<_> = mesh
            .vertices()
            .iter()
            .enumerate()
            .map(|(index, position)| Vertex {
                position: Vec3A::new(position.x, position.y, position.z),
                normal: vector(&normals, index),
                uv: uvs
                    .get(index)
                    .map(|uv| Vec2::new(uv.x, uv.y))
                    .unwrap_or_default(),
                tangent: vector(&tangents, index),
                bitangent: vector(&bitangents, index),
                ..Default::default()
            })
            .collect();

        for bone in mesh.bones() {
            let id = scene.skeleton.insert(&bone.name(), matrix(bone.offset_matrix())) as i32;
            for influence in bone.weights_iter() {
                if influence.weight > 0. {
                    if let Some(vertex) = vertices.get_mut(influence.vertex_id as usize) {
                        attach_influence(vertex, id, influence.weight);
                    }
                }
            }
        }

        // Post-processing sorts primitives by type, but lines and points may
        // still be present; only triangles survive the conversion.
        let mut indices = Vec::new();
        for face in mesh.faces() {
            if face.num_indices() == 3 {
                indices.extend_from_slice(face.indices());
            }
        }

        scene.meshes.push(Mesh {
            name: mesh.name(),
            vertices,
            indices,
            material: Some(mesh.material_index()),
        });
    }
}

/// Attaches a bone influence to the vertex. A vertex keeps at most four
/// influences; once the slots are full the smallest weight gives way.
fn attach_influence(vertex: &mut Vertex, bone: i32, weight: f32) {
    for slot in 0..vertex.bones.len() {
        if vertex.bones[slot] < 0 {
            vertex.bones[slot] = bone;
            vertex.weights[slot] = weight;
            return;
        }
    }

    let mut smallest = 0;
    for slot in 1..vertex.weights.len() {
        if vertex.weights[slot] < vertex.weights[smallest] {
            smallest = slot;
        }
    }
    if weight > vertex.weights[smallest] {
        vertex.bones[smallest] = bone;
        vertex.weights[smallest] = weight;
    }
}

fn convert_animations(source: &asset_importer::Scene, scene: &mut Scene) {
    for animation in source.animations() {
        let channels = animation
            .channels()
            .map(|channel| Channel {
                target: channel.node_name(),
                translations: channel
                    .position_keys()
                    .iter()
                    .map(|key| VectorKey {
                        time: key.time,
                        value: Vec3A::new(key.value.x, key.value.y, key.value.z),
                    })
                    .collect(),
                rotations: channel
                    .rotation_keys()
                    .iter()
                    .map(|key| QuatKey {
                        time: key.time,
                        value: Quat::from_xyzw(
                            key.value.x,
                            key.value.y,
                            key.value.z,
                            key.value.w,
                        ),
                    })
                    .collect(),
                scales: channel
                    .scaling_keys()
                    .iter()
                    .map(|key| VectorKey {
                        time: key.time,
                        value: Vec3A::new(key.value.x, key.value.y, key.value.z),
                    })
                    .collect(),
            })
            .collect();

        scene.animations.push(Animation {
            name: animation.name(),
            ticks_per_second: animation.ticks_per_second(),
            channels,
        });
    }
}

fn convert_materials(source: &asset_importer::Scene, scene: &mut Scene) {
    for material in source.materials() {
        let base_color = material
            .get_color_property("$clr.base")
            .or_else(|| material.get_color_property(material_keys::COLOR_DIFFUSE))
            .map(|color| [color.x, color.y, color.z, color.w])
            .unwrap_or([1.; 4]);

        scene.materials.push(Material {
            name: material.name(),
            base_color,
            metallic: material
                .get_float_property("$mat.metallicFactor")
                .unwrap_or(0.),
            roughness: material
                .get_float_property("$mat.roughnessFactor")
                .unwrap_or(1.),
            base_color_texture: texture_path(
                &material,
                &[TextureType::BaseColor, TextureType::Diffuse],
            ),
            normal_texture: texture_path(&material, &[TextureType::Normals, TextureType::Height]),
            metallic_roughness_texture: texture_path(
                &material,
                &[TextureType::Metalness, TextureType::DiffuseRoughness],
            ),
        });
    }
}

/// Returns the path of the first texture found among the given kinds, checked
/// in order so modern slots win over their legacy equivalents.
fn texture_path(
    material: &asset_importer::Material,
    kinds: &[TextureType],
) -> Option<String> {
    kinds
        .iter()
        .find_map(|&kind| material.texture(kind, 0).map(|texture| texture.path))
}

/// Bridges a matrix from the bindings' linear algebra types to ours.
fn matrix(matrix: asset_importer::Matrix4x4) -> Mat4 {
    Mat4::from_cols_array(&matrix.to_cols_array())
}

fn vector(vectors: &[asset_importer::Vector3D], index: usize) -> Vec3A {
    vectors
        .get(index)
        .map(|vector| Vec3A::new(vector.x, vector.y, vector.z))
        .unwrap_or_default()
}
