pub use self::{exporter::GltfExporter, importer::GltfImporter};

mod buffer;
mod exporter;
mod graph;
mod importer;
