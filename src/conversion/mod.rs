use anyhow::Result;

pub use self::{
    asset::Asset,
    scene::{
        Animation, Bone, Channel, Material, Mesh, QuatKey, Scene, SceneNode, Skeleton, VectorKey,
        Vertex,
    },
    transform::Trs,
};

mod asset;
mod scene;
mod transform;

/// Defines a type that can import asset files into a scene.
#[allow(unused_variables)]
pub trait Importer {
    /// Imports an asset file into a scene.
    fn import(&self, asset: &Asset, scene: &mut Scene) -> Result<()>;
    /// Postprocesses a scene after all its assets are imported. It's usually used to
    /// derive data that needs the whole scene in place, such as the parent of each
    /// bone in the node hierarchy.
    fn postprocess(&self, scene: &mut Scene) {}
    /// Returns the file extensions supported by the importer. These extensions are used to
    /// select the appropriate importer given an asset file.
    ///
    /// The extension should not include the period (e.g "zip", not ".zip").
    fn extensions(&self) -> &[&str];
}

/// Defines a type that can export a scene into asset files.
#[allow(unused_variables)]
pub trait Exporter {
    /// Exports a scene into one or more asset files.
    fn export(&self, scene: &Scene) -> Result<Vec<Asset>>;
    /// Preprocesses a scene before it's exported. It's usually used to
    /// transform the scene geometry into the coordinate system of the output format.
    fn preprocess(&self, scene: &mut Scene) {}
}
