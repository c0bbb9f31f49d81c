use std::collections::{HashMap, HashSet};

use glam::{Mat4, Quat, Vec3};
use gltf::json;
use log::warn;

use crate::conversion::{Scene, Skeleton, Trs};

/// The glTF node hierarchy assembled from a [`Scene`], along with the lookup
/// tables the exporter needs once the nodes are in place. Node indexes are
/// assigned depth-first and never change afterwards, so accessors built
/// against them stay valid while the hierarchy is reshaped.
pub struct NodeGraph {
    pub nodes: Vec<json::Node>,
    /// The indexes of the nodes that sit directly under the glTF scene.
    pub roots: Vec<u32>,
    names: HashMap<String, usize>,
}

impl NodeGraph {
    /// Builds the hierarchy from the scene nodes. Transforms within tolerance
    /// of identity are left out of the node, and mesh references are remapped
    /// through `mesh_map`, which takes source mesh indexes to the glTF meshes
    /// they were merged into.
    pub fn build(scene: &Scene, mesh_map: &HashMap<usize, usize>) -> Self {
        let mut graph = Self {
            nodes: Vec::new(),
            roots: Vec::new(),
            names: HashMap::new(),
        };

        if !scene.nodes.is_empty() {
            let root = graph.push_node(scene, 0, mesh_map);
            graph.roots.push(root as u32);
        }

        graph
    }

    fn push_node(&mut self, scene: &Scene, source: usize, mesh_map: &HashMap<usize, usize>) -> usize {
        let node = &scene.nodes[source];

        let mut meshes = Vec::new();
        for source_mesh in &node.meshes {
            if let Some(&mesh) = mesh_map.get(source_mesh) {
                if !meshes.contains(&mesh) {
                    meshes.push(mesh);
                }
            }
        }
        if meshes.len() > 1 {
            warn!(
                "Node '{}' references {} meshes, but glTF nodes hold one; keeping the first",
                node.name,
                meshes.len()
            );
        }

        let (translation, rotation, scale) = trs_fields(&Trs::from_mat4(&node.transform));

        let index = self.nodes.len();
        self.nodes.push(json::Node {
            name: (!node.name.is_empty()).then(|| node.name.clone()),
            children: None,
            translation,
            rotation,
            scale,
            mesh: meshes.first().map(|&mesh| json::Index::new(mesh as u32)),
            camera: None,
            extensions: None,
            matrix: None,
            skin: None,
            weights: None,
            extras: Default::default(),
        });
        self.names.insert(node.name.clone(), index);

        let children: Vec<_> = node
            .children
            .iter()
            .map(|&child| self.push_node(scene, child, mesh_map))
            .collect();
        if !children.is_empty() {
            self.nodes[index].children = Some(
                children
                    .into_iter()
                    .map(|child| json::Index::new(child as u32))
                    .collect(),
            );
        }

        index
    }

    /// Returns the index of the node with the given name. When several scene
    /// nodes share a name, the last one built wins.
    pub fn node_index(&self, name: &str) -> Option<usize> {
        self.names.get(name).copied()
    }

    /// Returns the node index for each bone of the skeleton, in bone id order.
    /// A bone whose name matches a hierarchy node reuses that node; the rest
    /// get meshless nodes, placed under the node of their parent bone when one
    /// is already resolved and at the top of the hierarchy otherwise.
    pub fn resolve_joints(&mut self, skeleton: &Skeleton) -> Vec<u32> {
        let mut joints = Vec::with_capacity(skeleton.len());
        for bone in skeleton.bones() {
            let index = match self.names.get(&bone.name) {
                Some(&index) => index,
                None => {
                    warn!("Bone '{}' has no node in the hierarchy; adding one", bone.name);
                    let parent = bone
                        .parent
                        .and_then(|id| self.names.get(&skeleton.bones()[id].name))
                        .copied();
                    self.push_joint_node(&bone.name, parent)
                }
            };
            joints.push(index as u32);
        }

        joints
    }

    fn push_joint_node(&mut self, name: &str, parent: Option<usize>) -> usize {
        let index = self.nodes.len();
        self.nodes.push(json::Node {
            name: Some(name.to_string()),
            children: None,
            translation: None,
            rotation: None,
            scale: None,
            mesh: None,
            camera: None,
            extensions: None,
            matrix: None,
            skin: None,
            weights: None,
            extras: Default::default(),
        });
        self.names.insert(name.to_string(), index);

        match parent {
            Some(parent) => self.nodes[parent]
                .children
                .get_or_insert_with(Vec::new)
                .push(json::Index::new(index as u32)),
            None => self.roots.push(index as u32),
        }

        index
    }

    /// Returns the common ancestor of all the given joint nodes, used for the
    /// `skeleton` field of the skin. Joints that don't share an ancestor fall
    /// back to the first root of the hierarchy.
    pub fn skeleton_root(&self, joints: &[u32]) -> u32 {
        let parents = self.parent_map();
        let path_to = |joint: u32| {
            let mut path = vec![joint];
            let mut current = joint;
            while let Some(&parent) = parents.get(&(current as usize)) {
                path.push(parent as u32);
                current = parent as u32;
            }
            path.reverse();
            path
        };

        let mut joints = joints.iter();
        let mut common = match joints.next() {
            Some(&first) => path_to(first),
            None => return 0,
        };
        for &joint in joints {
            let path = path_to(joint);
            let shared = common
                .iter()
                .zip(&path)
                .take_while(|(a, b)| a == b)
                .count();
            common.truncate(shared);
        }

        match common.last() {
            Some(&root) => root,
            None => {
                warn!("Skin joints don't share a common ancestor; using the scene root");
                self.roots.first().copied().unwrap_or(0)
            }
        }
    }

    /// Assigns the skin with the given index to every node that references
    /// one of the skinned meshes.
    pub fn assign_skin(&mut self, skin: usize, skinned_meshes: &HashSet<usize>) {
        for node in &mut self.nodes {
            if let Some(mesh) = &node.mesh {
                if skinned_meshes.contains(&mesh.value()) {
                    node.skin = Some(json::Index::new(skin as u32));
                }
            }
        }
    }

    /// Detaches every node with a skin from its parent and reattaches it at
    /// the top of the hierarchy, replacing its local transform with its world
    /// transform. Skinned vertices are posed by the joints alone, so a node
    /// chain above the mesh would displace the geometry twice.
    pub fn hoist_skinned(&mut self) {
        let parents = self.parent_map();
        let locals: Vec<_> = self.nodes.iter().map(local_transform).collect();

        for index in 0..self.nodes.len() {
            if self.nodes[index].skin.is_none() {
                continue;
            }

            let mut world = locals[index];
            let mut current = index;
            while let Some(&parent) = parents.get(&current) {
                world = locals[parent] * world;
                current = parent;
            }

            if let Some(&parent) = parents.get(&index) {
                if let Some(mut children) = self.nodes[parent].children.take() {
                    children.retain(|child| child.value() != index);
                    if !children.is_empty() {
                        self.nodes[parent].children = Some(children);
                    }
                }
                self.roots.push(index as u32);
            }

            let (translation, rotation, scale) = trs_fields(&Trs::from_mat4(&world));
            self.nodes[index].translation = translation;
            self.nodes[index].rotation = rotation;
            self.nodes[index].scale = scale;
        }
    }

    fn parent_map(&self) -> HashMap<usize, usize> {
        let mut parents = HashMap::new();
        for (index, node) in self.nodes.iter().enumerate() {
            if let Some(children) = &node.children {
                for child in children {
                    parents.insert(child.value(), index);
                }
            }
        }

        parents
    }
}

fn trs_fields(
    trs: &Trs,
) -> (
    Option<[f32; 3]>,
    Option<json::scene::UnitQuaternion>,
    Option<[f32; 3]>,
) {
    if trs.is_identity() {
        (None, None, None)
    } else {
        (
            Some(trs.translation.into()),
            Some(json::scene::UnitQuaternion(trs.rotation.into())),
            Some(trs.scale.into()),
        )
    }
}

fn local_transform(node: &json::Node) -> Mat4 {
    let translation = node.translation.map(Vec3::from).unwrap_or(Vec3::ZERO);
    let rotation = node
        .rotation
        .map(|quat| Quat::from_xyzw(quat.0[0], quat.0[1], quat.0[2], quat.0[3]))
        .unwrap_or(Quat::IDENTITY);
    let scale = node.scale.map(Vec3::from).unwrap_or(Vec3::ONE);

    Mat4::from_scale_rotation_translation(scale, rotation, translation)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use crate::conversion::SceneNode;

    use super::*;

    /// root (0) -> pelvis (1) -> spine (2) -> arm_l (3), arm_r (4)
    /// root (0) -> prop (5)
    fn scene() -> Scene {
        let mut scene = Scene::default();
        scene.nodes.push(SceneNode::new("root", None));
        scene.nodes.push(SceneNode::new("pelvis", Some(0)));
        scene.nodes.push(SceneNode::new("spine", Some(1)));
        scene.nodes.push(SceneNode::new("arm_l", Some(2)));
        scene.nodes.push(SceneNode::new("arm_r", Some(2)));
        scene.nodes.push(SceneNode::new("prop", Some(0)));
        scene.nodes[0].children = vec![1, 5];
        scene.nodes[1].children = vec![2];
        scene.nodes[2].children = vec![3, 4];

        scene
    }

    fn children_of(node: &json::Node) -> Vec<usize> {
        node.children
            .as_ref()
            .map(|children| children.iter().map(|child| child.value()).collect())
            .unwrap_or_default()
    }

    #[test]
    fn build_assigns_depth_first_indexes() {
        let graph = NodeGraph::build(&scene(), &HashMap::new());

        let names: Vec<_> = graph
            .nodes
            .iter()
            .map(|node| node.name.clone().unwrap())
            .collect();
        assert_eq!(
            vec!["root", "pelvis", "spine", "arm_l", "arm_r", "prop"],
            names
        );
        assert_eq!(vec![0], graph.roots);
        assert_eq!(vec![1, 5], children_of(&graph.nodes[0]));
        assert_eq!(vec![3, 4], children_of(&graph.nodes[2]));
    }

    #[test]
    fn identity_transforms_are_omitted() {
        let mut scene = scene();
        scene.nodes[1].transform = Mat4::from_translation(Vec3::new(0., 3., 0.));

        let graph = NodeGraph::build(&scene, &HashMap::new());
        assert_eq!(None, graph.nodes[0].translation);
        assert!(graph.nodes[0].rotation.is_none());
        assert_eq!(None, graph.nodes[0].scale);
        assert_eq!(Some([0., 3., 0.]), graph.nodes[1].translation);
    }

    #[test]
    fn merged_meshes_collapse_into_one_reference() {
        let mut scene = scene();
        // Two source meshes merged into glTF mesh 0 and one kept as mesh 1.
        scene.nodes[5].meshes = vec![0, 1, 2];
        let mesh_map = HashMap::from([(0, 0), (1, 0), (2, 1)]);

        let graph = NodeGraph::build(&scene, &mesh_map);
        assert_eq!(Some(0), graph.nodes[5].mesh.map(|mesh| mesh.value()));
    }

    #[test]
    fn joints_reuse_nodes_and_synthesize_missing_ones() {
        let mut skeleton = Skeleton::default();
        skeleton.insert("pelvis", Mat4::IDENTITY);
        skeleton.insert("arm_l", Mat4::IDENTITY);
        skeleton.insert("ghost", Mat4::IDENTITY);
        skeleton.derive_parents(&scene().nodes);

        let mut graph = NodeGraph::build(&scene(), &HashMap::new());
        let joints = graph.resolve_joints(&skeleton);

        assert_eq!(vec![1, 3, 6], joints);
        assert_eq!(7, graph.nodes.len());
        assert_eq!(Some("ghost".to_string()), graph.nodes[6].name);
        // The synthesized joint has no parent bone, so it becomes a root.
        assert_eq!(vec![0, 6], graph.roots);
    }

    #[test]
    fn synthesized_joints_attach_to_their_parent_bone() {
        let mut skeleton = Skeleton::default();
        skeleton.insert("spine", Mat4::IDENTITY);
        skeleton.insert("tail", Mat4::IDENTITY);
        let mut nodes = scene().nodes;
        nodes.push(SceneNode::new("tail", Some(2)));
        // "tail" sits under "spine" in the source but has no node in the
        // graph scene, which was built before it was added.
        let mut graph = NodeGraph::build(&scene(), &HashMap::new());
        skeleton.derive_parents(&nodes);

        let joints = graph.resolve_joints(&skeleton);
        assert_eq!(vec![2, 6], joints);
        assert_eq!(vec![3, 4, 6], children_of(&graph.nodes[2]));
    }

    #[test]
    fn skeleton_root_is_the_common_ancestor() {
        let graph = NodeGraph::build(&scene(), &HashMap::new());

        assert_eq!(2, graph.skeleton_root(&[3, 4]));
        assert_eq!(2, graph.skeleton_root(&[2, 3, 4]));
        assert_eq!(0, graph.skeleton_root(&[3, 5]));
        assert_eq!(3, graph.skeleton_root(&[3]));
    }

    #[test]
    fn disconnected_joints_fall_back_to_the_scene_root() {
        let mut skeleton = Skeleton::default();
        skeleton.insert("left", Mat4::IDENTITY);
        skeleton.insert("right", Mat4::IDENTITY);

        let mut graph = NodeGraph::build(&scene(), &HashMap::new());
        let joints = graph.resolve_joints(&skeleton);

        // Both joints are synthesized roots with no shared path.
        assert_eq!(0, graph.skeleton_root(&joints));
    }

    #[test]
    fn hoisting_moves_skinned_nodes_to_the_top() {
        let mut scene = Scene::default();
        scene.nodes.push(SceneNode::new("root", None));
        scene.nodes.push(SceneNode::new("body", Some(0)));
        scene.nodes[0].children = vec![1];
        scene.nodes[0].transform = Mat4::from_scale_rotation_translation(
            Vec3::splat(2.),
            Quat::IDENTITY,
            Vec3::new(1., 0., 0.),
        );
        scene.nodes[1].transform = Mat4::from_translation(Vec3::new(3., 0., 0.));
        scene.nodes[1].meshes = vec![0];

        let mesh_map = HashMap::from([(0, 0)]);
        let mut graph = NodeGraph::build(&scene, &mesh_map);
        graph.assign_skin(0, &HashSet::from([0]));
        graph.hoist_skinned();

        assert_eq!(vec![0, 1], graph.roots);
        assert!(graph.nodes[0].children.is_none());
        assert_eq!(Some([7., 0., 0.]), graph.nodes[1].translation);
        assert_eq!(Some([2., 2., 2.]), graph.nodes[1].scale);
    }

    #[test]
    fn hoisting_keeps_root_level_nodes_in_place() {
        let mut scene = Scene::default();
        scene.nodes.push(SceneNode::new("body", None));
        scene.nodes[0].meshes = vec![0];
        scene.nodes[0].transform = Mat4::from_translation(Vec3::new(3., 0., 0.));

        let mesh_map = HashMap::from([(0, 0)]);
        let mut graph = NodeGraph::build(&scene, &mesh_map);
        graph.assign_skin(0, &HashSet::from([0]));
        graph.hoist_skinned();

        assert_eq!(vec![0], graph.roots);
        assert_eq!(Some([3., 0., 0.]), graph.nodes[0].translation);
    }
}
