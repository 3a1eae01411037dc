// Configuration error taxonomy
// Fatal declaration problems, surfaced before any job starts

use thiserror::Error;

/// Errors raised while loading, validating, or resolving a pipeline
/// definition. Any of these aborts the run before a single job executes.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("duplicate job name '{0}'")]
    DuplicateJob(String),

    #[error("job '{job}' needs unknown job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },

    #[error("job '{job}' references undeclared stage '{stage}'")]
    UnknownStage { job: String, stage: String },

    #[error("job '{job}' needs '{dependency}', which runs in a later stage")]
    DependencyOrder { job: String, dependency: String },

    #[error("job '{job}' needs '{dependency}', which is optional and not part of this run")]
    DependencyNotInRun { job: String, dependency: String },

    #[error("circular dependency detected: {0}")]
    CycleDetected(String),

    #[error("job '{0}' declares an artifact policy with no paths")]
    MissingArtifactPath(String),

    #[error("job '{job}' is missing required field '{field}'")]
    MissingField { job: String, field: String },

    #[error("failed to read pipeline definition: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid pipeline document: {0}")]
    Yaml(#[from] serde_yaml::Error),
}
