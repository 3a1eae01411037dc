// Pipeline Definition Data Models
// Types representing the declarative job/stage schema

use crate::parser::error::ConfigError;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Root pipeline definition.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Pipeline {
    /// Pipeline name
    pub name: Option<String>,

    /// Ordered stage labels. When omitted, stages are ordered by first
    /// appearance in the job list.
    #[serde(default)]
    pub stages: Vec<String>,

    /// Pipeline-level variables, merged under each job's own variables.
    #[serde(default)]
    pub variables: HashMap<String, String>,

    /// Job declarations, keyed by job name in the document.
    #[serde(default, deserialize_with = "deserialize_jobs")]
    pub jobs: Vec<Job>,
}

/// A single job declaration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Job {
    /// Job name (the mapping key in the document).
    #[serde(skip)]
    pub name: String,

    /// Stage this job belongs to.
    #[serde(default = "default_stage")]
    pub stage: String,

    /// Container image reference; forwarded to the execution adapter,
    /// never interpreted by the engine.
    pub image: Option<String>,

    /// Script lines. Accepts a single string or a list.
    #[serde(default, deserialize_with = "deserialize_script")]
    pub script: Vec<String>,

    /// Job-level variables, layered over pipeline variables.
    #[serde(default)]
    pub variables: HashMap<String, String>,

    /// Explicit prerequisites. Absent keeps the implicit stage barrier;
    /// an explicitly empty list removes all prerequisites.
    #[serde(default)]
    pub needs: Option<Vec<String>>,

    /// Failure-tolerance policy.
    #[serde(default)]
    pub allow_failure: AllowFailure,

    /// Excluded from the run unless explicitly requested.
    #[serde(default)]
    pub optional: bool,

    /// Artifact retention declaration.
    pub artifacts: Option<ArtifactPolicy>,

    /// Minimum clone depth hint; informational only.
    pub fetch_depth: Option<u32>,
}

fn default_stage() -> String {
    "test".to_string()
}

/// Failure-tolerance policy: a plain flag, or a set of tolerated exit
/// codes for the conditional form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AllowFailure {
    Flag(bool),
    ExitCodes { exit_codes: Vec<i32> },
}

impl Default for AllowFailure {
    fn default() -> Self {
        AllowFailure::Flag(false)
    }
}

impl AllowFailure {
    /// Whether a failure with the given exit code is tolerated. A process
    /// killed before exiting reports no code and only matches the plain
    /// `true` form.
    pub fn permits(&self, exit_code: Option<i32>) -> bool {
        match self {
            AllowFailure::Flag(flag) => *flag,
            AllowFailure::ExitCodes { exit_codes } => {
                exit_code.map_or(false, |code| exit_codes.contains(&code))
            }
        }
    }
}

/// Artifact retention declaration for a job.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ArtifactPolicy {
    #[serde(default)]
    pub paths: Vec<String>,

    /// Retention hint, e.g. "2 days"; not interpreted by the engine.
    pub expire_in: Option<String>,

    #[serde(default)]
    pub when: ArtifactWhen,
}

/// Condition under which a job's artifacts are collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactWhen {
    #[default]
    OnSuccess,
    OnFailure,
    Always,
}

impl ArtifactWhen {
    pub fn applies(&self, success: bool) -> bool {
        match self {
            ArtifactWhen::OnSuccess => success,
            ArtifactWhen::OnFailure => !success,
            ArtifactWhen::Always => true,
        }
    }
}

impl Pipeline {
    /// Stage labels in execution order.
    pub fn stage_order(&self) -> Vec<String> {
        if !self.stages.is_empty() {
            return self.stages.clone();
        }

        let mut order = Vec::new();
        for job in &self.jobs {
            if !order.contains(&job.stage) {
                order.push(job.stage.clone());
            }
        }
        order
    }

    /// Validate the declaration set before graph construction.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for job in &self.jobs {
            if !seen.insert(job.name.as_str()) {
                return Err(ConfigError::DuplicateJob(job.name.clone()));
            }
        }

        let order = self.stage_order();
        let rank: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, stage)| (stage.as_str(), i))
            .collect();
        let by_name: HashMap<&str, &Job> =
            self.jobs.iter().map(|j| (j.name.as_str(), j)).collect();

        for job in &self.jobs {
            if job.script.is_empty() {
                return Err(ConfigError::MissingField {
                    job: job.name.clone(),
                    field: "script".to_string(),
                });
            }

            let Some(job_rank) = rank.get(job.stage.as_str()) else {
                return Err(ConfigError::UnknownStage {
                    job: job.name.clone(),
                    stage: job.stage.clone(),
                });
            };

            if let Some(needs) = &job.needs {
                for dep in needs {
                    let Some(target) = by_name.get(dep.as_str()) else {
                        return Err(ConfigError::UnknownDependency {
                            job: job.name.clone(),
                            dependency: dep.clone(),
                        });
                    };
                    let target_rank = rank.get(target.stage.as_str()).copied().unwrap_or(0);
                    if target_rank > *job_rank {
                        return Err(ConfigError::DependencyOrder {
                            job: job.name.clone(),
                            dependency: dep.clone(),
                        });
                    }
                }
            }

            if let Some(artifacts) = &job.artifacts {
                if artifacts.paths.is_empty() {
                    return Err(ConfigError::MissingArtifactPath(job.name.clone()));
                }
            }
        }

        Ok(())
    }
}

/// Tolerant form for fields that accept a single entry or a list.
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

fn deserialize_script<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(line) => vec![line],
        OneOrMany::Many(lines) => lines,
    })
}

fn deserialize_jobs<'de, D>(deserializer: D) -> Result<Vec<Job>, D::Error>
where
    D: Deserializer<'de>,
{
    struct JobsVisitor;

    impl<'de> Visitor<'de> for JobsVisitor {
        type Value = Vec<Job>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a mapping of job name to job definition")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut jobs = Vec::new();
            while let Some((name, mut job)) = map.next_entry::<String, Job>()? {
                job.name = name;
                jobs.push(job);
            }
            Ok(jobs)
        }
    }

    deserializer.deserialize_map(JobsVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(name: &str, stage: &str) -> Job {
        Job {
            name: name.to_string(),
            stage: stage.to_string(),
            script: vec!["true".to_string()],
            ..Default::default()
        }
    }

    fn pipeline(stages: &[&str], jobs: Vec<Job>) -> Pipeline {
        Pipeline {
            stages: stages.iter().map(|s| s.to_string()).collect(),
            jobs,
            ..Default::default()
        }
    }

    #[test]
    fn duplicate_job_names_are_rejected() {
        let p = pipeline(&["build"], vec![job("lint", "build"), job("lint", "build")]);
        assert!(matches!(p.validate(), Err(ConfigError::DuplicateJob(name)) if name == "lint"));
    }

    #[test]
    fn unknown_needs_target_is_rejected() {
        let mut dependent = job("tests", "build");
        dependent.needs = Some(vec!["missing".to_string()]);
        let p = pipeline(&["build"], vec![job("lint", "build"), dependent]);
        assert!(matches!(
            p.validate(),
            Err(ConfigError::UnknownDependency { job, dependency })
                if job == "tests" && dependency == "missing"
        ));
    }

    #[test]
    fn needs_into_a_later_stage_is_rejected() {
        let mut early = job("lint", "build");
        early.needs = Some(vec!["tests".to_string()]);
        let p = pipeline(&["build", "test"], vec![early, job("tests", "test")]);
        assert!(matches!(
            p.validate(),
            Err(ConfigError::DependencyOrder { job, .. }) if job == "lint"
        ));
    }

    #[test]
    fn needs_within_the_same_stage_is_accepted() {
        let mut second = job("package", "build");
        second.needs = Some(vec!["compile".to_string()]);
        let p = pipeline(&["build"], vec![job("compile", "build"), second]);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn undeclared_stage_is_rejected() {
        let p = pipeline(&["build"], vec![job("tests", "deploy")]);
        assert!(matches!(
            p.validate(),
            Err(ConfigError::UnknownStage { stage, .. }) if stage == "deploy"
        ));
    }

    #[test]
    fn artifact_policy_requires_paths() {
        let mut with_artifacts = job("build", "build");
        with_artifacts.artifacts = Some(ArtifactPolicy::default());
        let p = pipeline(&["build"], vec![with_artifacts]);
        assert!(matches!(
            p.validate(),
            Err(ConfigError::MissingArtifactPath(name)) if name == "build"
        ));
    }

    #[test]
    fn empty_script_is_rejected() {
        let mut no_script = job("lint", "build");
        no_script.script.clear();
        let p = pipeline(&["build"], vec![no_script]);
        assert!(matches!(
            p.validate(),
            Err(ConfigError::MissingField { field, .. }) if field == "script"
        ));
    }

    #[test]
    fn stage_order_falls_back_to_job_declaration_order() {
        let p = pipeline(
            &[],
            vec![job("a", "build"), job("b", "test"), job("c", "build")],
        );
        assert_eq!(p.stage_order(), vec!["build", "test"]);
    }

    #[test]
    fn declared_stage_order_wins() {
        let p = pipeline(&["test", "build"], vec![job("a", "build"), job("b", "test")]);
        assert_eq!(p.stage_order(), vec!["test", "build"]);
    }

    #[test]
    fn allow_failure_defaults_to_never() {
        assert!(!AllowFailure::default().permits(Some(1)));
        assert!(!AllowFailure::default().permits(None));
    }

    #[test]
    fn allow_failure_flag_permits_any_failure() {
        let policy = AllowFailure::Flag(true);
        assert!(policy.permits(Some(1)));
        assert!(policy.permits(Some(137)));
        assert!(policy.permits(None));
    }

    #[test]
    fn allow_failure_exit_codes_match_exactly() {
        let policy = AllowFailure::ExitCodes {
            exit_codes: vec![2, 3],
        };
        assert!(policy.permits(Some(2)));
        assert!(policy.permits(Some(3)));
        assert!(!policy.permits(Some(1)));
        assert!(!policy.permits(None));
    }

    #[test]
    fn artifact_when_conditions() {
        assert!(ArtifactWhen::OnSuccess.applies(true));
        assert!(!ArtifactWhen::OnSuccess.applies(false));
        assert!(ArtifactWhen::OnFailure.applies(false));
        assert!(!ArtifactWhen::OnFailure.applies(true));
        assert!(ArtifactWhen::Always.applies(true));
        assert!(ArtifactWhen::Always.applies(false));
    }
}
