use std::collections::HashMap;

use glam::{Mat4, Quat, Vec2, Vec3A};

/// Represents a 3D scene comprised of a node hierarchy, meshes, a skeleton,
/// animations, and materials. It's the intermediary format between conversions
/// and provides some operations.
#[derive(Debug, Clone, Default)]
pub struct Scene {
    pub name: String,
    /// The flattened node hierarchy of the scene. Parents always precede their
    /// children, and index 0 is the root of the hierarchy.
    pub nodes: Vec<SceneNode>,
    pub meshes: Vec<Mesh>,
    pub skeleton: Skeleton,
    pub animations: Vec<Animation>,
    pub materials: Vec<Material>,
}

impl Scene {
    /// Returns the transform of the node with the given index, relative to the
    /// origin of the scene.
    pub fn world_transform(&self, index: usize) -> Mat4 {
        let mut node = &self.nodes[index];
        let mut transform = node.transform;
        while let Some(parent) = node.parent {
            node = &self.nodes[parent];
            transform = node.transform * transform;
        }

        transform
    }

    /// Returns the index of the first node with the given name.
    pub fn find_node(&self, name: &str) -> Option<usize> {
        self.nodes.iter().position(|node| node.name == name)
    }
}

/// Represents a node of the [`Scene`] hierarchy.
#[derive(Debug, Clone, PartialEq)]
pub struct SceneNode {
    pub name: String,
    /// The column-major transform of the node, relative to its parent.
    pub transform: Mat4,
    /// The index of the parent of the node. The index refers to the [`Scene`] nodes.
    pub parent: Option<usize>,
    /// The indexes of the children of the node. The indexes refer to the [`Scene`] nodes.
    pub children: Vec<usize>,
    /// The indexes of the meshes attached to the node. The indexes refer to the
    /// [`Scene`] meshes.
    pub meshes: Vec<usize>,
}

impl SceneNode {
    pub fn new(name: &str, parent: Option<usize>) -> Self {
        Self {
            name: name.to_string(),
            transform: Mat4::IDENTITY,
            parent,
            children: Vec::new(),
            meshes: Vec::new(),
        }
    }
}

/// Represents the geometry of a mesh.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mesh {
    /// The name of the mesh. Meshes that share a name are merged into a single
    /// multi-primitive mesh when exported.
    pub name: String,
    /// The list of vertices (vertex buffer) of the geometry.
    pub vertices: Vec<Vertex>,
    /// The list of indices (index buffer) of the geometry, which determines the
    /// triangles of the mesh.
    pub indices: Vec<u32>,
    /// The index of the material of the mesh, if any. The index refers to the
    /// [`Scene`] materials.
    pub material: Option<usize>,
}

impl Mesh {
    /// Returns whether any vertex of the mesh carries a bone influence.
    pub fn is_skinned(&self) -> bool {
        self.vertices.iter().any(|vertex| {
            vertex
                .bones
                .iter()
                .zip(&vertex.weights)
                .any(|(&bone, &weight)| bone >= 0 && weight > 0.)
        })
    }
}

/// Represents a skinned vertex of a mesh. Up to four bones may influence it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Vertex {
    /// The position of the vertex, relative to the origin of the mesh.
    pub position: Vec3A,
    /// The normal vector of the vertex.
    pub normal: Vec3A,
    /// The UV-mapping texture coordinates of the vertex.
    pub uv: Vec2,
    pub tangent: Vec3A,
    pub bitangent: Vec3A,
    /// The ids of the influencing bones in the [`Scene`] skeleton. Unused slots
    /// hold -1.
    pub bones: [i32; 4],
    /// The weights of the influencing bones. Unused slots hold 0.
    pub weights: [f32; 4],
}

impl Default for Vertex {
    fn default() -> Self {
        Self {
            position: Vec3A::ZERO,
            normal: Vec3A::ZERO,
            uv: Vec2::ZERO,
            tangent: Vec3A::ZERO,
            bitangent: Vec3A::ZERO,
            bones: [-1; 4],
            weights: [0.; 4],
        }
    }
}

/// Represents the skeleton of the scene. Bones are deduplicated by name, and
/// the id of a bone is its position in the list. Vertex data refers to bones
/// by this id.
#[derive(Debug, Clone, Default)]
pub struct Skeleton {
    bones: Vec<Bone>,
    index: HashMap<String, usize>,
}

impl Skeleton {
    /// Returns the id of the bone with the given name, registering the bone
    /// first when it's not part of the skeleton yet. The inverse bind matrix
    /// of a bone is kept from its first registration.
    pub fn insert(&mut self, name: &str, inverse_bind: Mat4) -> usize {
        match self.index.get(name) {
            Some(&id) => id,
            None => {
                let id = self.bones.len();
                self.bones.push(Bone {
                    name: name.to_string(),
                    inverse_bind,
                    parent: None,
                });
                self.index.insert(name.to_string(), id);
                id
            }
        }
    }

    /// Returns the id of the bone with the given name.
    pub fn get(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn bones(&self) -> &[Bone] {
        &self.bones
    }

    pub fn len(&self) -> usize {
        self.bones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bones.is_empty()
    }

    /// Sets the parent of each bone to its nearest ancestor bone in the node
    /// hierarchy. Bones without a matching node, or without a bone among their
    /// ancestors, keep no parent.
    pub fn derive_parents(&mut self, nodes: &[SceneNode]) {
        let parents: Vec<_> = self
            .bones
            .iter()
            .map(|bone| {
                let mut current = nodes.iter().position(|node| node.name == bone.name)?;
                while let Some(parent) = nodes[current].parent {
                    if let Some(&id) = self.index.get(&nodes[parent].name) {
                        return Some(id);
                    }
                    current = parent;
                }
                None
            })
            .collect();

        for (bone, parent) in self.bones.iter_mut().zip(parents) {
            bone.parent = parent;
        }
    }
}

/// Represents a bone of the [`Scene`] skeleton.
#[derive(Debug, Clone, PartialEq)]
pub struct Bone {
    /// The name of the bone, which ties it to the hierarchy node of the same name.
    pub name: String,
    /// The matrix that transforms mesh space to the local space of the bone in
    /// its bind pose.
    pub inverse_bind: Mat4,
    /// The id of the nearest ancestor bone, if any. The id refers to the
    /// [`Skeleton`] bones.
    pub parent: Option<usize>,
}

/// Represents a keyframe animation sequence. Key times are expressed in ticks.
#[derive(Debug, Clone, Default)]
pub struct Animation {
    pub name: String,
    /// The number of key ticks per second. Zero means the source did not
    /// specify a rate.
    pub ticks_per_second: f64,
    pub channels: Vec<Channel>,
}

impl Animation {
    /// The tick rate used to convert key times to seconds. Sources that leave
    /// the rate unspecified get the conventional 25 ticks per second.
    pub fn effective_ticks_per_second(&self) -> f64 {
        if self.ticks_per_second > 0. {
            self.ticks_per_second
        } else {
            25.
        }
    }
}

/// Represents the keyframes of an animation for a single target node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Channel {
    /// The name of the node targeted by the channel.
    pub target: String,
    pub translations: Vec<VectorKey>,
    pub rotations: Vec<QuatKey>,
    pub scales: Vec<VectorKey>,
}

/// A keyframe holding a vector value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VectorKey {
    /// The time of the keyframe, in ticks.
    pub time: f64,
    pub value: Vec3A,
}

/// A keyframe holding a rotation value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QuatKey {
    /// The time of the keyframe, in ticks.
    pub time: f64,
    pub value: Quat,
}

/// Represents a material in the metallic-roughness model. Texture fields hold
/// URIs relative to the exported document.
#[derive(Debug, Clone, PartialEq)]
pub struct Material {
    pub name: String,
    pub base_color: [f32; 4],
    pub metallic: f32,
    pub roughness: f32,
    pub base_color_texture: Option<String>,
    pub normal_texture: Option<String>,
    pub metallic_roughness_texture: Option<String>,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            name: String::new(),
            base_color: [1.; 4],
            metallic: 0.,
            roughness: 1.,
            base_color_texture: None,
            normal_texture: None,
            metallic_roughness_texture: None,
        }
    }
}
