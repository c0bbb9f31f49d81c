use crate::conversion::Importer;

#[cfg(feature = "assimp")]
pub mod assimp;
pub mod gltf;

/// Returns all the importers available in this build.
pub fn importers() -> Vec<Box<dyn Importer>> {
    let mut importers: Vec<Box<dyn Importer>> = vec![Box::new(gltf::GltfImporter::default())];
    #[cfg(feature = "assimp")]
    importers.push(Box::new(assimp::AssimpImporter::default()));

    importers
}
