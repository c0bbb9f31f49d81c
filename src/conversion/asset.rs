use std::path::{Path, PathBuf};

/// An in-memory file produced or consumed by a conversion.
pub struct Asset {
    pub bytes: Vec<u8>,
    path: PathBuf,
}

impl Asset {
    pub fn new(bytes: Vec<u8>, path: impl Into<PathBuf>) -> Self {
        Self {
            bytes,
            path: path.into(),
        }
    }

    /// Get a reference to the asset's path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The file name of the asset without its extension.
    pub fn name(&self) -> &str {
        self.path
            .file_stem()
            .unwrap_or_default()
            .to_str()
            .unwrap_or_default()
    }
}
