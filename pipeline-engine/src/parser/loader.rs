// Pipeline Definition Loader
// Reads a YAML document and produces a validated Pipeline

use crate::parser::error::ConfigError;
use crate::parser::models::Pipeline;

use std::fs;
use std::path::Path;

/// Loads pipeline definitions from YAML.
pub struct PipelineLoader;

impl PipelineLoader {
    /// Load and validate a pipeline definition from a file.
    pub fn parse_file(path: impl AsRef<Path>) -> Result<Pipeline, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::parse_str(&text)
    }

    /// Parse and validate a pipeline definition from YAML text.
    pub fn parse_str(text: &str) -> Result<Pipeline, ConfigError> {
        let pipeline: Pipeline = serde_yaml::from_str(text)?;
        pipeline.validate()?;
        Ok(pipeline)
    }
}
