//! Local filesystem access: tree walking, metadata, relative paths.

pub mod metadata;
pub mod paths;
pub mod walker;
