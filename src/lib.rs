//! Converts rigged 3D models into glTF 2.0 documents.

pub mod conversion;
pub mod format;
