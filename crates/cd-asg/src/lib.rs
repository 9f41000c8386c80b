pub mod gateway;
pub mod paths;

pub use gateway::{ArtifactStore, DeletePrefixReport, ObjectMeta, S3ArtifactStore};
