use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
};

use anyhow::Result;
use gltf::{
    json::{
        self,
        mesh::{Primitive, Semantic},
        validation::Checked,
    },
    Glb,
};
use log::warn;

use crate::conversion::{Animation, Asset, Exporter, Material, Mesh, Scene, Skeleton};

use super::{
    buffer::{
        insert_float_bytes, insert_index_bytes, insert_joint_bytes, insert_matrix_bytes,
        insert_weight_bytes,
    },
    graph::NodeGraph,
};

/// Exports a scene as a glTF 2.0 document. The extension of the output path
/// selects the flavor: `.glb` packs the JSON and the binary buffer into a
/// single container, anything else produces a JSON document with an external
/// `.bin` buffer next to it.
pub struct GltfExporter {
    path: PathBuf,
}

impl GltfExporter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

// https://www.khronos.org/registry/glTF/specs/2.0/glTF-2.0.html
impl Exporter for GltfExporter {
    fn export(&self, scene: &Scene) -> Result<Vec<Asset>> {
        let mut root = json::Root::default();
        let mut buffer = Vec::new();

        let mesh_map = insert_meshes(&mut root, &mut buffer, scene)?;
        insert_materials(&mut root, &scene.materials);

        let mut graph = NodeGraph::build(scene, &mesh_map);
        if !scene.skeleton.is_empty() {
            let joints = graph.resolve_joints(&scene.skeleton);
            graph.assign_skin(0, &skinned_meshes(scene, &mesh_map));
            graph.hoist_skinned();
            insert_skin(&mut root, &mut buffer, &scene.skeleton, &graph, joints)?;
        }
        insert_animations(&mut root, &mut buffer, &scene.animations, &graph)?;

        root.scene = Some(json::Index::new(0));
        root.scenes.push(json::Scene {
            nodes: graph
                .roots
                .iter()
                .map(|&node| json::Index::new(node))
                .collect(),
            name: (!scene.name.is_empty()).then(|| scene.name.clone()),
            extensions: None,
            extras: Default::default(),
        });
        root.nodes = graph.nodes;

        root.asset = json::Asset {
            generator: Some(format!(
                "{} {}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            )),
            ..Default::default()
        };

        self.write_assets(root, buffer)
    }
}

impl GltfExporter {
    fn write_assets(&self, mut root: json::Root, buffer: Vec<u8>) -> Result<Vec<Asset>> {
        let binary = self
            .path
            .extension()
            .map_or(false, |extension| extension.eq_ignore_ascii_case("glb"));

        if binary {
            root.buffers.push(json::Buffer {
                byte_length: buffer.len() as u32,
                uri: None,
                name: None,
                extensions: None,
                extras: Default::default(),
            });

            let json_string = json::serialize::to_string(&root)?;
            let bytes = Glb {
                header: gltf::binary::Header {
                    magic: *b"glTF",
                    version: 2,
                    length: calculate_length(&json_string, &buffer) as u32,
                },
                json: json_string.into_bytes().into(),
                bin: Some(buffer.into()),
            }
            .to_vec()?;

            Ok(vec![Asset::new(bytes, &self.path)])
        } else {
            let bin_path = self.path.with_extension("bin");
            root.buffers.push(json::Buffer {
                byte_length: buffer.len() as u32,
                uri: Some(
                    bin_path
                        .file_name()
                        .unwrap_or_default()
                        .to_string_lossy()
                        .into_owned(),
                ),
                name: None,
                extensions: None,
                extras: Default::default(),
            });

            let json_string = json::serialize::to_string_pretty(&root)?;
            Ok(vec![
                Asset::new(json_string.into_bytes(), &self.path),
                Asset::new(buffer, &bin_path),
            ])
        }
    }
}

fn calculate_length(json: &str, bin: &[u8]) -> usize {
    const HEADER_SIZE: usize = 12;
    const CHUNK_HEADER_SIZE: usize = 8;

    let mut length = HEADER_SIZE + CHUNK_HEADER_SIZE + json.len();
    length += (4 - length % 4) % 4;
    length += CHUNK_HEADER_SIZE + bin.len();
    length += (4 - length % 4) % 4;

    length
}

/// Converts the meshes of the scene into glTF meshes, writing their geometry
/// into the binary buffer. Source meshes that share a name are merged into a
/// single multi-primitive mesh. Returns the map from source mesh indices to
/// the indices of the glTF meshes.
fn insert_meshes(
    root: &mut json::Root,
    buffer: &mut Vec<u8>,
    scene: &Scene,
) -> Result<HashMap<usize, usize>> {
    let mut mesh_map = HashMap::new();
    let mut merged: HashMap<&str, usize> = HashMap::new();

    for (index, mesh) in scene.meshes.iter().enumerate() {
        if mesh.vertices.is_empty() {
            warn!("Mesh '{}' has no vertices and is skipped", mesh.name);
            continue;
        }

        let output = match merged.get(mesh.name.as_str()) {
            Some(&output) => output,
            None => {
                let output = root.meshes.len();
                root.meshes.push(json::Mesh {
                    name: (!mesh.name.is_empty()).then(|| mesh.name.clone()),
                    primitives: Vec::new(),
                    extensions: None,
                    weights: None,
                    extras: Default::default(),
                });
                merged.insert(&mesh.name, output);
                output
            }
        };

        let primitive = insert_primitive(root, buffer, mesh)?;
        root.meshes[output].primitives.push(primitive);
        mesh_map.insert(index, output);
    }

    Ok(mesh_map)
}

fn insert_primitive(root: &mut json::Root, buffer: &mut Vec<u8>, mesh: &Mesh) -> Result<Primitive> {
    let positions: Vec<[f32; 3]> = mesh.vertices.iter().map(|v| v.position.into()).collect();
    let normals: Vec<[f32; 3]> = mesh.vertices.iter().map(|v| v.normal.into()).collect();
    let uvs: Vec<[f32; 2]> = mesh.vertices.iter().map(|v| v.uv.into()).collect();

    let target = Some(json::buffer::Target::ArrayBuffer);
    let mut attributes = HashMap::new();
    attributes.insert(
        Checked::Valid(Semantic::Positions),
        json::Index::new(insert_float_bytes(
            root,
            buffer,
            &positions,
            json::accessor::Type::Vec3,
            true,
            target,
        )? as u32),
    );
    attributes.insert(
        Checked::Valid(Semantic::Normals),
        json::Index::new(insert_float_bytes(
            root,
            buffer,
            &normals,
            json::accessor::Type::Vec3,
            true,
            target,
        )? as u32),
    );
    attributes.insert(
        Checked::Valid(Semantic::TexCoords(0)),
        json::Index::new(insert_float_bytes(
            root,
            buffer,
            &uvs,
            json::accessor::Type::Vec2,
            true,
            target,
        )? as u32),
    );
    // Unskinned meshes carry no joint attributes; a zero-weight pair would
    // still make validators look for a skin on the node.
    if mesh.is_skinned() {
        attributes.insert(
            Checked::Valid(Semantic::Joints(0)),
            json::Index::new(insert_joint_bytes(root, buffer, &mesh.vertices)? as u32),
        );
        attributes.insert(
            Checked::Valid(Semantic::Weights(0)),
            json::Index::new(insert_weight_bytes(root, buffer, &mesh.vertices)? as u32),
        );
    }

    let indices = insert_index_bytes(root, buffer, &mesh.indices)?;

    Ok(Primitive {
        attributes,
        extensions: None,
        indices: Some(json::Index::new(indices as u32)),
        material: mesh
            .material
            .map(|material| json::Index::new(material as u32)),
        mode: Default::default(),
        targets: None,
        extras: Default::default(),
    })
}

/// Returns the glTF meshes that need a skin, i.e. those merged from at least
/// one source mesh with bone influences.
fn skinned_meshes(scene: &Scene, mesh_map: &HashMap<usize, usize>) -> HashSet<usize> {
    scene
        .meshes
        .iter()
        .enumerate()
        .filter(|(_, mesh)| mesh.is_skinned())
        .filter_map(|(index, _)| mesh_map.get(&index).copied())
        .collect()
}

fn insert_skin(
    root: &mut json::Root,
    buffer: &mut Vec<u8>,
    skeleton: &Skeleton,
    graph: &NodeGraph,
    joints: Vec<u32>,
) -> Result<()> {
    let matrices: Vec<_> = skeleton
        .bones()
        .iter()
        .map(|bone| bone.inverse_bind)
        .collect();
    let accessor = insert_matrix_bytes(root, buffer, &matrices)?;
    let skeleton_root = graph.skeleton_root(&joints);

    root.skins.push(json::Skin {
        inverse_bind_matrices: Some(json::Index::new(accessor as u32)),
        joints: joints.into_iter().map(json::Index::new).collect(),
        skeleton: Some(json::Index::new(skeleton_root)),
        name: None,
        extensions: None,
        extras: Default::default(),
    });

    Ok(())
}

/// Converts the animations of the scene, translating key times from source
/// ticks into seconds. Each occupied path of a channel becomes its own glTF
/// channel with a linear sampler.
fn insert_animations(
    root: &mut json::Root,
    buffer: &mut Vec<u8>,
    animations: &[Animation],
    graph: &NodeGraph,
) -> Result<()> {
    for animation in animations {
        let mut gltf_animation = json::Animation {
            name: Some(animation.name.clone()),
            samplers: Vec::new(),
            channels: Vec::new(),
            extensions: None,
            extras: Default::default(),
        };
        let ticks_per_second = animation.effective_ticks_per_second();

        for channel in &animation.channels {
            let node = match graph.node_index(&channel.target) {
                Some(index) => index as u32,
                None => {
                    warn!(
                        "Animation '{}' targets the unknown node '{}'; retargeting to node 0",
                        animation.name, channel.target
                    );
                    0
                }
            };

            if !channel.translations.is_empty() {
                let values: Vec<[f32; 3]> = channel
                    .translations
                    .iter()
                    .map(|key| key.value.into())
                    .collect();
                let input = insert_key_times(
                    root,
                    buffer,
                    channel.translations.iter().map(|key| key.time),
                    ticks_per_second,
                )?;
                let output = insert_float_bytes(
                    root,
                    buffer,
                    &values,
                    json::accessor::Type::Vec3,
                    false,
                    None,
                )?;
                push_channel(
                    &mut gltf_animation,
                    input,
                    output,
                    node,
                    gltf::animation::Property::Translation,
                );
            }
            if !channel.rotations.is_empty() {
                let values: Vec<[f32; 4]> = channel
                    .rotations
                    .iter()
                    .map(|key| key.value.into())
                    .collect();
                let input = insert_key_times(
                    root,
                    buffer,
                    channel.rotations.iter().map(|key| key.time),
                    ticks_per_second,
                )?;
                let output = insert_float_bytes(
                    root,
                    buffer,
                    &values,
                    json::accessor::Type::Vec4,
                    false,
                    None,
                )?;
                push_channel(
                    &mut gltf_animation,
                    input,
                    output,
                    node,
                    gltf::animation::Property::Rotation,
                );
            }
            if !channel.scales.is_empty() {
                let values: Vec<[f32; 3]> =
                    channel.scales.iter().map(|key| key.value.into()).collect();
                let input = insert_key_times(
                    root,
                    buffer,
                    channel.scales.iter().map(|key| key.time),
                    ticks_per_second,
                )?;
                let output = insert_float_bytes(
                    root,
                    buffer,
                    &values,
                    json::accessor::Type::Vec3,
                    false,
                    None,
                )?;
                push_channel(
                    &mut gltf_animation,
                    input,
                    output,
                    node,
                    gltf::animation::Property::Scale,
                );
            }
        }

        if !gltf_animation.channels.is_empty() {
            root.animations.push(gltf_animation);
        }
    }

    Ok(())
}

fn insert_key_times(
    root: &mut json::Root,
    buffer: &mut Vec<u8>,
    times: impl Iterator<Item = f64>,
    ticks_per_second: f64,
) -> Result<usize> {
    let seconds: Vec<[f32; 1]> = times
        .map(|time| [(time / ticks_per_second) as f32])
        .collect();
    insert_float_bytes(
        root,
        buffer,
        &seconds,
        json::accessor::Type::Scalar,
        true,
        None,
    )
}

fn push_channel(
    animation: &mut json::Animation,
    input: usize,
    output: usize,
    node: u32,
    path: gltf::animation::Property,
) {
    animation.samplers.push(json::animation::Sampler {
        input: json::Index::new(input as u32),
        output: json::Index::new(output as u32),
        interpolation: Checked::Valid(gltf::animation::Interpolation::Linear),
        extensions: None,
        extras: Default::default(),
    });
    animation.channels.push(json::animation::Channel {
        sampler: json::Index::new(animation.channels.len() as u32),
        target: json::animation::Target {
            node: json::Index::new(node),
            path: Checked::Valid(path),
            extensions: None,
            extras: Default::default(),
        },
        extensions: None,
        extras: Default::default(),
    });
}

/// Converts the materials of the scene. Images are shared between materials
/// that reference the same texture file, and all textures use a single
/// repeat-wrap sampler.
fn insert_materials(root: &mut json::Root, materials: &[Material]) {
    let mut images: HashMap<String, usize> = HashMap::new();

    for material in materials {
        let base_color_texture = material
            .base_color_texture
            .as_ref()
            .map(|uri| texture_info(insert_texture(root, &mut images, uri)));
        let metallic_roughness_texture = material
            .metallic_roughness_texture
            .as_ref()
            .map(|uri| texture_info(insert_texture(root, &mut images, uri)));
        let normal_texture =
            material
                .normal_texture
                .as_ref()
                .map(|uri| json::material::NormalTexture {
                    index: json::Index::new(insert_texture(root, &mut images, uri) as u32),
                    scale: 1.,
                    tex_coord: 0,
                    extensions: None,
                    extras: Default::default(),
                });

        root.materials.push(json::Material {
            name: (!material.name.is_empty()).then(|| material.name.clone()),
            pbr_metallic_roughness: json::material::PbrMetallicRoughness {
                base_color_factor: json::material::PbrBaseColorFactor(material.base_color),
                base_color_texture,
                metallic_factor: json::material::StrengthFactor(material.metallic),
                roughness_factor: json::material::StrengthFactor(material.roughness),
                metallic_roughness_texture,
                extensions: None,
                extras: Default::default(),
            },
            normal_texture,
            ..Default::default()
        });
    }
}

fn texture_info(texture: usize) -> json::texture::Info {
    json::texture::Info {
        index: json::Index::new(texture as u32),
        tex_coord: 0,
        extensions: None,
        extras: Default::default(),
    }
}

/// Returns the index of the texture for the image at the given URI, creating
/// the image and texture entries on first use.
fn insert_texture(root: &mut json::Root, images: &mut HashMap<String, usize>, uri: &str) -> usize {
    if let Some(&texture) = images.get(uri) {
        return texture;
    }

    if root.samplers.is_empty() {
        root.samplers.push(json::texture::Sampler {
            mag_filter: Some(Checked::Valid(json::texture::MagFilter::Linear)),
            min_filter: Some(Checked::Valid(json::texture::MinFilter::LinearMipmapLinear)),
            name: None,
            wrap_s: Checked::Valid(json::texture::WrappingMode::Repeat),
            wrap_t: Checked::Valid(json::texture::WrappingMode::Repeat),
            extensions: None,
            extras: Default::default(),
        });
    }

    root.images.push(json::Image {
        buffer_view: None,
        mime_type: None,
        name: None,
        uri: Some(uri.to_string()),
        extensions: None,
        extras: Default::default(),
    });

    let texture = root.textures.len();
    root.textures.push(json::Texture {
        name: None,
        sampler: Some(json::Index::new(0)),
        source: json::Index::new(root.images.len() as u32 - 1),
        extensions: None,
        extras: Default::default(),
    });
    images.insert(uri.to_string(), texture);

    texture
}

#[cfg(test)]
mod tests {
    use glam::Vec3A;
    use pretty_assertions::assert_eq;

    use crate::conversion::{Channel, SceneNode, VectorKey, Vertex};

    use super::*;

    fn triangle(name: &str) -> Mesh {
        Mesh {
            name: name.to_string(),
            vertices: vec![
                Vertex {
                    position: Vec3A::new(0., 0., 0.),
                    ..Default::default()
                },
                Vertex {
                    position: Vec3A::new(1., 0., 0.),
                    ..Default::default()
                },
                Vertex {
                    position: Vec3A::new(0., 1., 0.),
                    ..Default::default()
                },
            ],
            indices: vec![0, 1, 2],
            material: None,
        }
    }

    #[test]
    fn merged_meshes_share_one_gltf_mesh() {
        let mut root = json::Root::default();
        let mut buffer = Vec::new();
        let mut scene = Scene::default();
        scene.meshes = vec![triangle("body"), triangle("body"), triangle("face")];

        let mesh_map = insert_meshes(&mut root, &mut buffer, &scene).unwrap();

        assert_eq!(2, root.meshes.len());
        assert_eq!(2, root.meshes[0].primitives.len());
        assert_eq!(1, root.meshes[1].primitives.len());
        assert_eq!(Some(&0), mesh_map.get(&0));
        assert_eq!(Some(&0), mesh_map.get(&1));
        assert_eq!(Some(&1), mesh_map.get(&2));
    }

    #[test]
    fn unskinned_meshes_have_no_joint_attributes() {
        let mut root = json::Root::default();
        let mut buffer = Vec::new();

        let plain = insert_primitive(&mut root, &mut buffer, &triangle("plain")).unwrap();
        assert!(plain
            .attributes
            .contains_key(&Checked::Valid(Semantic::Positions)));
        assert!(plain
            .attributes
            .contains_key(&Checked::Valid(Semantic::Normals)));
        assert!(plain
            .attributes
            .contains_key(&Checked::Valid(Semantic::TexCoords(0))));
        assert!(!plain
            .attributes
            .contains_key(&Checked::Valid(Semantic::Joints(0))));
        assert!(!plain
            .attributes
            .contains_key(&Checked::Valid(Semantic::Weights(0))));

        let mut skinned = triangle("skinned");
        skinned.vertices[0].bones = [1, -1, -1, -1];
        skinned.vertices[0].weights = [1., 0., 0., 0.];
        let skinned = insert_primitive(&mut root, &mut buffer, &skinned).unwrap();
        assert!(skinned
            .attributes
            .contains_key(&Checked::Valid(Semantic::Joints(0))));
        assert!(skinned
            .attributes
            .contains_key(&Checked::Valid(Semantic::Weights(0))));
    }

    #[test]
    fn key_times_are_converted_to_seconds() {
        let mut root = json::Root::default();
        let mut buffer = Vec::new();
        let mut scene = Scene::default();
        scene.nodes.push(SceneNode::new("bone", None));
        let graph = NodeGraph::build(&scene, &HashMap::new());

        let animations = [Animation {
            name: "walk".to_string(),
            ticks_per_second: 30.,
            channels: vec![Channel {
                target: "bone".to_string(),
                translations: vec![
                    VectorKey {
                        time: 0.,
                        value: Vec3A::ZERO,
                    },
                    VectorKey {
                        time: 15.,
                        value: Vec3A::ONE,
                    },
                    VectorKey {
                        time: 30.,
                        value: Vec3A::ONE,
                    },
                ],
                rotations: Vec::new(),
                scales: Vec::new(),
            }],
        }];
        insert_animations(&mut root, &mut buffer, &animations, &graph).unwrap();

        let input = root.animations[0].samplers[0].input.value();
        assert_eq!(Some(json::Value::from(vec![0.])), root.accessors[input].min);
        assert_eq!(Some(json::Value::from(vec![1.])), root.accessors[input].max);
        assert_eq!(3, root.accessors[input].count);
    }

    #[test]
    fn unknown_channel_targets_fall_back_to_the_first_node() {
        let mut root = json::Root::default();
        let mut buffer = Vec::new();
        let mut scene = Scene::default();
        scene.nodes.push(SceneNode::new("root", None));
        let graph = NodeGraph::build(&scene, &HashMap::new());

        let animations = [Animation {
            name: "walk".to_string(),
            ticks_per_second: 0.,
            channels: vec![Channel {
                target: "ghost".to_string(),
                translations: vec![VectorKey {
                    time: 25.,
                    value: Vec3A::ZERO,
                }],
                rotations: Vec::new(),
                scales: Vec::new(),
            }],
        }];
        insert_animations(&mut root, &mut buffer, &animations, &graph).unwrap();

        assert_eq!(0, root.animations[0].channels[0].target.node.value());
        // A zero tick rate falls back to 25 ticks per second.
        let input = root.animations[0].samplers[0].input.value();
        assert_eq!(Some(json::Value::from(vec![1.])), root.accessors[input].max);
    }

    #[test]
    fn materials_share_images_by_uri() {
        let mut root = json::Root::default();
        let materials = [
            Material {
                name: "skin".to_string(),
                base_color_texture: Some("skin.png".to_string()),
                normal_texture: Some("skin_n.png".to_string()),
                ..Default::default()
            },
            Material {
                name: "cloth".to_string(),
                base_color_texture: Some("skin.png".to_string()),
                ..Default::default()
            },
        ];

        insert_materials(&mut root, &materials);

        assert_eq!(2, root.materials.len());
        assert_eq!(2, root.images.len());
        assert_eq!(2, root.textures.len());
        assert_eq!(1, root.samplers.len());
        let shared = root.materials[1]
            .pbr_metallic_roughness
            .base_color_texture
            .as_ref()
            .unwrap()
            .index
            .value();
        assert_eq!(0, shared);
    }

    #[test]
    fn gltf_output_splits_json_and_buffer() {
        let mut scene = Scene::default();
        scene.name = "model".to_string();
        let mut node = SceneNode::new("mesh", None);
        node.meshes.push(0);
        scene.nodes.push(node);
        scene.meshes.push(triangle("mesh"));

        let assets = GltfExporter::new("out/model.gltf").export(&scene).unwrap();

        assert_eq!(2, assets.len());
        assert_eq!("model", assets[0].name());
        assert_eq!(std::path::Path::new("out/model.bin"), assets[1].path());

        let gltf = gltf::Gltf::from_slice(&assets[0].bytes).unwrap();
        let buffer = gltf.buffers().next().unwrap();
        assert!(matches!(
            buffer.source(),
            gltf::buffer::Source::Uri("model.bin")
        ));
        assert_eq!(assets[1].bytes.len(), buffer.length());
    }

    #[test]
    fn glb_output_packs_a_single_container() {
        let mut scene = Scene::default();
        scene.name = "model".to_string();
        let mut node = SceneNode::new("mesh", None);
        node.meshes.push(0);
        scene.nodes.push(node);
        scene.meshes.push(triangle("mesh"));

        let assets = GltfExporter::new("model.glb").export(&scene).unwrap();

        assert_eq!(1, assets.len());
        let gltf = gltf::Gltf::from_slice(&assets[0].bytes).unwrap();
        assert!(gltf.blob.is_some());
        assert_eq!(1, gltf.document.meshes().count());
    }
}
