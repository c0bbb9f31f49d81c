use std::{collections::HashMap, path::Path};

use anyhow::{Context, Result};
use glam::{Mat4, Quat, Vec3A};
use gltf::animation::util::ReadOutputs;
use log::warn;

use crate::conversion::{
    Animation, Asset, Channel, Importer, Material, Mesh, QuatKey, Scene, SceneNode, Skeleton,
    VectorKey, Vertex,
};

/// Imports glTF and GLB documents. External buffers are read from the
/// directory of the asset, embedded buffers are decoded in place.
#[derive(Default)]
pub struct GltfImporter {}

impl Importer for GltfImporter {
    fn import(&self, asset: &Asset, scene: &mut Scene) -> Result<()> {
        let gltf = gltf::Gltf::from_slice(&asset.bytes)
            .context("Failed to deserialize the glTF document")?;
        let buffers = load_buffers(&gltf, asset.path())?;

        scene.name = asset.name().to_string();

        let node_map = convert_nodes(&gltf, scene);
        convert_skins(&gltf, &buffers, scene);
        let mesh_lists = convert_meshes(&gltf, &buffers, scene);
        assign_meshes(&gltf, &node_map, &mesh_lists, scene);
        convert_animations(&gltf, &buffers, scene);
        convert_materials(&gltf, scene);

        Ok(())
    }

    fn postprocess(&self, scene: &mut Scene) {
        scene.skeleton.derive_parents(&scene.nodes);
    }

    fn extensions(&self) -> &[&str] {
        &["gltf", "glb"]
    }
}

/// Walks the default scene of the document into the node arena. Multiple root
/// nodes are gathered under a synthesized root so the arena keeps a single
/// entry point. Returns the map from glTF node indices to arena indices.
fn convert_nodes(gltf: &gltf::Gltf, scene: &mut Scene) -> HashMap<usize, usize> {
    let mut map = HashMap::new();
    let roots: Vec<_> = match gltf.default_scene().or_else(|| gltf.scenes().next()) {
        Some(source) => source.nodes().collect(),
        None => Vec::new(),
    };

    match roots.len() {
        1 => {
            for root in roots {
                push_node(scene, &mut map, root, None);
            }
        }
        _ => {
            let root = SceneNode::new(&scene.name, None);
            scene.nodes.push(root);
            for root in roots {
                let index = push_node(scene, &mut map, root, Some(0));
                scene.nodes[0].children.push(index);
            }
        }
    }

    map
}

fn push_node(
    scene: &mut Scene,
    map: &mut HashMap<usize, usize>,
    node: gltf::Node,
    parent: Option<usize>,
) -> usize {
    let index = scene.nodes.len();
    let mut scene_node = SceneNode::new(&node_label(&node), parent);
    scene_node.transform = Mat4::from_cols_array_2d(&node.transform().matrix());
    scene.nodes.push(scene_node);
    map.insert(node.index(), index);

    for child in node.children() {
        let child_index = push_node(scene, map, child, Some(index));
        scene.nodes[index].children.push(child_index);
    }

    index
}

/// Registers the joints of every skin as skeleton bones. Joints shared between
/// skins collapse into a single bone; a skin without inverse bind matrices
/// gets identity matrices, as the format prescribes.
fn convert_skins(gltf: &gltf::Gltf, buffers: &[Vec<u8>], scene: &mut Scene) {
    for skin in gltf.skins() {
        let reader = skin.reader(|buffer| buffers.get(buffer.index()).map(|bytes| bytes.as_slice()));
        let mut matrices: Vec<_> = reader
            .read_inverse_bind_matrices()
            .map(|matrices| {
                matrices
                    .map(|matrix| Mat4::from_cols_array_2d(&matrix))
                    .collect()
            })
            .unwrap_or_default();
        matrices.resize(skin.joints().count(), Mat4::IDENTITY);

        for (joint, matrix) in skin.joints().zip(matrices) {
            scene.skeleton.insert(&node_label(&joint), matrix);
        }
    }
}

/// Converts every primitive of every mesh into its own [`Mesh`], named after
/// the glTF mesh so the primitives reunite on export. Returns, per glTF mesh,
/// the list of converted mesh indices.
fn convert_meshes(gltf: &gltf::Gltf, buffers: &[Vec<u8>], scene: &mut Scene) -> Vec<Vec<usize>> {
    // The skin attached to the node that renders a mesh decides which bones
    // the JOINTS_0 values of its primitives refer to.
    let mut skin_of_mesh: HashMap<usize, gltf::Skin> = HashMap::new();
    for node in gltf.nodes() {
        if let (Some(mesh), Some(skin)) = (node.mesh(), node.skin()) {
            skin_of_mesh.entry(mesh.index()).or_insert(skin);
        }
    }

    let mut lists = Vec::new();
    for mesh in gltf.meshes() {
        let mut list = Vec::new();
        let joint_map = skin_of_mesh
            .get(&mesh.index())
            .map(|skin| joint_ids(skin, &scene.skeleton));

        for primitive in mesh.primitives() {
            if primitive.mode() != gltf::mesh::Mode::Triangles {
                warn!(
                    "Mesh '{}' has a non-triangle primitive, which is skipped",
                    mesh_label(&mesh)
                );
                continue;
            }

            let reader =
                primitive.reader(|buffer| buffers.get(buffer.index()).map(|bytes| bytes.as_slice()));
            let positions = match reader.read_positions() {
                Some(positions) => positions,
                None => continue,
            };
            let mut vertices: Vec<Vertex> = positions
                .map(|position| Vertex {
                    position: position.into(),
                    ..Default::default()
                })
                .collect();

            if let Some(normals) = reader.read_normals() {
                for (vertex, normal) in vertices.iter_mut().zip(normals) {
                    vertex.normal = normal.into();
                }
            }
            if let Some(uvs) = reader.read_tex_coords(0) {
                for (vertex, uv) in vertices.iter_mut().zip(uvs.into_f32()) {
                    vertex.uv = uv.into();
                }
            }
            if let Some(tangents) = reader.read_tangents() {
                for (vertex, [x, y, z, w]) in vertices.iter_mut().zip(tangents) {
                    vertex.tangent = Vec3A::new(x, y, z);
                    // The w component stores the handedness of the basis.
                    vertex.bitangent = vertex.normal.cross(vertex.tangent) * w;
                }
            }
            if let (Some(joints), Some(weights), Some(map)) = (
                reader.read_joints(0),
                reader.read_weights(0),
                joint_map.as_ref(),
            ) {
                for (vertex, (vertex_joints, vertex_weights)) in vertices
                    .iter_mut()
                    .zip(joints.into_u16().zip(weights.into_f32()))
                {
                    let mut slot = 0;
                    for (&joint, &weight) in vertex_joints.iter().zip(&vertex_weights) {
                        if weight > 0. {
                            if let Some(&bone) = map.get(joint as usize) {
                                vertex.bones[slot] = bone;
                                vertex.weights[slot] = weight;
                                slot += 1;
                            }
                        }
                    }
                }
            }

            let indices = match reader.read_indices() {
                Some(indices) => indices.into_u32().collect(),
                None => (0..vertices.len() as u32).collect(),
            };

            list.push(scene.meshes.len());
            scene.meshes.push(Mesh {
                name: mesh_label(&mesh),
                vertices,
                indices,
                material: primitive.material().index(),
            });
        }
        lists.push(list);
    }

    lists
}

/// Maps the joint slots of the skin to the global bone ids of the skeleton.
fn joint_ids(skin: &gltf::Skin, skeleton: &Skeleton) -> Vec<i32> {
    skin.joints()
        .map(|joint| {
            skeleton
                .get(&node_label(&joint))
                .map(|id| id as i32)
                .unwrap_or(-1)
        })
        .collect()
}

fn assign_meshes(
    gltf: &gltf::Gltf,
    node_map: &HashMap<usize, usize>,
    mesh_lists: &[Vec<usize>],
    scene: &mut Scene,
) {
    for node in gltf.nodes() {
        if let (Some(mesh), Some(&index)) = (node.mesh(), node_map.get(&node.index())) {
            if let Some(list) = mesh_lists.get(mesh.index()) {
                scene.nodes[index].meshes = list.clone();
            }
        }
    }
}

/// Converts the animations of the document, gathering the channels of each
/// target node into a single [`Channel`]. Key times stay in seconds, which a
/// tick rate of one preserves on the way back out.
fn convert_animations(gltf: &gltf::Gltf, buffers: &[Vec<u8>], scene: &mut Scene) {
    for animation in gltf.animations() {
        let name = match animation.name() {
            Some(name) => name.to_string(),
            None => format!("animation_{}", animation.index()),
        };

        let mut channels: Vec<Channel> = Vec::new();
        let mut by_target: HashMap<String, usize> = HashMap::new();

        for gltf_channel in animation.channels() {
            let target = node_label(&gltf_channel.target().node());
            let reader = gltf_channel
                .reader(|buffer| buffers.get(buffer.index()).map(|bytes| bytes.as_slice()));
            let times: Vec<f64> = match reader.read_inputs() {
                Some(inputs) => inputs.map(|time| time as f64).collect(),
                None => continue,
            };
            let outputs = match reader.read_outputs() {
                Some(outputs) => outputs,
                None => continue,
            };

            let index = *by_target.entry(target.clone()).or_insert_with(|| {
                channels.push(Channel {
                    target,
                    ..Default::default()
                });
                channels.len() - 1
            });
            let channel = &mut channels[index];

            match outputs {
                ReadOutputs::Translations(values) => {
                    channel
                        .translations
                        .extend(times.iter().zip(values).map(|(&time, value)| VectorKey {
                            time,
                            value: value.into(),
                        }));
                }
                ReadOutputs::Rotations(values) => {
                    channel.rotations.extend(
                        times
                            .iter()
                            .zip(values.into_f32())
                            .map(|(&time, value)| QuatKey {
                                time,
                                value: Quat::from_array(value),
                            }),
                    );
                }
                ReadOutputs::Scales(values) => {
                    channel
                        .scales
                        .extend(times.iter().zip(values).map(|(&time, value)| VectorKey {
                            time,
                            value: value.into(),
                        }));
                }
                ReadOutputs::MorphTargetWeights(_) => {}
            }
        }

        scene.animations.push(Animation {
            name,
            ticks_per_second: 1.,
            channels,
        });
    }
}

fn convert_materials(gltf: &gltf::Gltf, scene: &mut Scene) {
    for material in gltf.materials() {
        let pbr = material.pbr_metallic_roughness();
        scene.materials.push(Material {
            name: match material.name() {
                Some(name) => name.to_string(),
                None => format!("material_{}", material.index().unwrap_or_default()),
            },
            base_color: pbr.base_color_factor(),
            metallic: pbr.metallic_factor(),
            roughness: pbr.roughness_factor(),
            base_color_texture: pbr
                .base_color_texture()
                .and_then(|info| texture_uri(&info.texture())),
            normal_texture: material
                .normal_texture()
                .and_then(|normal| texture_uri(&normal.texture())),
            metallic_roughness_texture: pbr
                .metallic_roughness_texture()
                .and_then(|info| texture_uri(&info.texture())),
        });
    }
}

/// Returns the file the texture points at. Embedded images have no standalone
/// file to reference and yield nothing.
fn texture_uri(texture: &gltf::Texture) -> Option<String> {
    match texture.source().source() {
        gltf::image::Source::Uri { uri, .. } if !uri.starts_with("data:") => Some(uri.to_string()),
        _ => None,
    }
}

/// Nodes without a name get a stable label derived from their index, so that
/// bones and animation channels can keep referring to them by name.
fn node_label(node: &gltf::Node) -> String {
    match node.name() {
        Some(name) => name.to_string(),
        None => format!("node_{}", node.index()),
    }
}

fn mesh_label(mesh: &gltf::Mesh) -> String {
    match mesh.name() {
        Some(name) => name.to_string(),
        None => format!("mesh_{}", mesh.index()),
    }
}

// Adapted from https://github.com/bevyengine/bevy/blob/c6fec1f0c256597af9746050dd1a4dcd3b80fe24/crates/bevy_gltf/src/loader.rs#L643
fn load_buffers(gltf: &gltf::Gltf, asset_path: &Path) -> Result<Vec<Vec<u8>>> {
    const VALID_MIME_TYPES: &[&str] = &["application/octet-stream", "application/gltf-buffer"];

    let mut buffer_data = Vec::new();
    for buffer in gltf.buffers() {
        match buffer.source() {
            gltf::buffer::Source::Uri(uri) => {
                let buffer_bytes = match DataUri::parse(uri) {
                    Ok(data_uri) if VALID_MIME_TYPES.contains(&data_uri.mime_type) => {
                        data_uri.decode()?
                    }
                    Ok(_) => return Err(anyhow::anyhow!("Buffer format unsupported")),
                    Err(()) => {
                        let parent = asset_path.parent().unwrap_or_else(|| Path::new("."));
                        let buffer_path = parent.join(uri);
                        std::fs::read(&buffer_path).with_context(|| {
                            format!("Failed to read buffer '{}'", buffer_path.display())
                        })?
                    }
                };
                buffer_data.push(buffer_bytes);
            }
            gltf::buffer::Source::Bin => {
                if let Some(blob) = gltf.blob.as_deref() {
                    buffer_data.push(blob.into());
                } else {
                    return Err(anyhow::anyhow!("The GLB binary chunk is missing"));
                }
            }
        }
    }

    Ok(buffer_data)
}

// Taken from https://github.com/bevyengine/bevy/blob/c6fec1f0c256597af9746050dd1a4dcd3b80fe24/crates/bevy_gltf/src/loader.rs#L742
struct DataUri<'a> {
    mime_type: &'a str,
    base64: bool,
    data: &'a str,
}

fn split_once(input: &str, delimiter: char) -> Option<(&str, &str)> {
    let mut iter = input.splitn(2, delimiter);
    Some((iter.next()?, iter.next()?))
}

impl<'a> DataUri<'a> {
    fn parse(uri: &'a str) -> Result<DataUri<'a>, ()> {
        let uri = uri.strip_prefix("data:").ok_or(())?;
        let (mime_type, data) = split_once(uri, ',').ok_or(())?;

        let (mime_type, base64) = match mime_type.strip_suffix(";base64") {
            Some(mime_type) => (mime_type, true),
            None => (mime_type, false),
        };

        Ok(DataUri {
            mime_type,
            base64,
            data,
        })
    }

    fn decode(&self) -> Result<Vec<u8>, base64::DecodeError> {
        if self.base64 {
            base64::decode(self.data)
        } else {
            Ok(self.data.as_bytes().to_owned())
        }
    }
}

#[cfg(test)]
mod tests {
    use glam::Vec3;
    use pretty_assertions::assert_eq;

    use super::*;

    fn import(json: &str) -> Scene {
        let mut scene = Scene::default();
        let importer = GltfImporter::default();
        let asset = Asset::new(json.as_bytes().to_vec(), "fixture.gltf");
        importer.import(&asset, &mut scene).unwrap();
        importer.postprocess(&mut scene);
        scene
    }

    #[test]
    fn nodes_keep_hierarchy_and_transforms() {
        let scene = import(
            r#"{
                "asset": {"version": "2.0"},
                "scene": 0,
                "scenes": [{"nodes": [0]}],
                "nodes": [
                    {"name": "a", "children": [1], "translation": [1, 2, 3]},
                    {"name": "b"}
                ]
            }"#,
        );

        assert_eq!(2, scene.nodes.len());
        assert_eq!("a", scene.nodes[0].name);
        assert_eq!("b", scene.nodes[1].name);
        assert_eq!(Some(0), scene.nodes[1].parent);
        assert_eq!(vec![1], scene.nodes[0].children);
        assert_eq!(
            Mat4::from_translation(Vec3::new(1., 2., 3.)),
            scene.nodes[0].transform
        );
    }

    #[test]
    fn multiple_roots_gain_a_synthetic_parent() {
        let scene = import(
            r#"{
                "asset": {"version": "2.0"},
                "scene": 0,
                "scenes": [{"nodes": [0, 1]}],
                "nodes": [{"name": "a"}, {"name": "b"}]
            }"#,
        );

        assert_eq!(3, scene.nodes.len());
        assert_eq!("fixture", scene.nodes[0].name);
        assert_eq!(vec![1, 2], scene.nodes[0].children);
        assert_eq!(Some(0), scene.nodes[1].parent);
        assert_eq!(Some(0), scene.nodes[2].parent);
    }

    #[test]
    fn unnamed_nodes_get_stable_labels() {
        let scene = import(
            r#"{
                "asset": {"version": "2.0"},
                "scene": 0,
                "scenes": [{"nodes": [0]}],
                "nodes": [{"children": [1]}, {}]
            }"#,
        );

        assert_eq!("node_0", scene.nodes[0].name);
        assert_eq!("node_1", scene.nodes[1].name);
    }

    #[test]
    fn data_uris_decode_their_payload() {
        let uri = DataUri::parse("data:application/octet-stream;base64,AAECAw==").unwrap();
        assert_eq!("application/octet-stream", uri.mime_type);
        assert!(uri.base64);
        assert_eq!(vec![0, 1, 2, 3], uri.decode().unwrap());
    }
}
