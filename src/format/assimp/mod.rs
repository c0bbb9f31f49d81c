pub use self::importer::AssimpImporter;

mod importer;
