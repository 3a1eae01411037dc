// Parser module for pipeline definitions
// YAML loading, schema models, and validation

pub mod error;
pub mod loader;
pub mod models;

pub use error::ConfigError;
pub use loader::PipelineLoader;
pub use models::{AllowFailure, ArtifactPolicy, ArtifactWhen, Job, Pipeline};
