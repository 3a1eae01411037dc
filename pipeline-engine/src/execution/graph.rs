// Pipeline Graph Builder
// Resolves job declarations and stage barriers into a prerequisite DAG

use crate::parser::error::ConfigError;
use crate::parser::models::{Job, Pipeline};

use std::collections::{HashMap, HashSet};

/// Selection of optional jobs for a run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Include every optional job.
    pub include_optional: bool,
    /// Include specific optional jobs by name.
    pub include: Vec<String>,
}

impl RunOptions {
    fn includes(&self, job: &Job) -> bool {
        !job.optional || self.include_optional || self.include.iter().any(|n| n == &job.name)
    }
}

/// A resolved node: one included job plus its direct prerequisites.
#[derive(Debug, Clone)]
pub struct GraphNode {
    pub job: Job,
    pub prereqs: Vec<String>,
}

/// The resolved prerequisite DAG for one pipeline run. Immutable after
/// construction; owned by the scheduler for the duration of the run.
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    name: String,
    nodes: Vec<GraphNode>,
    indices: HashMap<String, usize>,
    variables: HashMap<String, String>,
}

impl PipelineGraph {
    /// Build the graph for one run. Validates the declarations, drops
    /// optional jobs not selected by `options`, resolves implicit stage
    /// barriers into ordinary prerequisite edges, and rejects cycles.
    pub fn from_pipeline(pipeline: &Pipeline, options: &RunOptions) -> Result<Self, ConfigError> {
        pipeline.validate()?;

        let order = pipeline.stage_order();
        let rank: HashMap<&str, usize> = order
            .iter()
            .enumerate()
            .map(|(i, stage)| (stage.as_str(), i))
            .collect();

        let included: Vec<&Job> = pipeline
            .jobs
            .iter()
            .filter(|job| options.includes(job))
            .collect();
        let included_names: HashSet<&str> = included.iter().map(|j| j.name.as_str()).collect();

        let mut nodes = Vec::with_capacity(included.len());
        let mut indices = HashMap::new();

        for (i, job) in included.iter().enumerate() {
            let prereqs = match &job.needs {
                Some(needs) => {
                    for dep in needs {
                        if !included_names.contains(dep.as_str()) {
                            // validate() guarantees the target exists, so it
                            // was dropped as an unselected optional job
                            return Err(ConfigError::DependencyNotInRun {
                                job: job.name.clone(),
                                dependency: dep.clone(),
                            });
                        }
                    }
                    needs.clone()
                }
                None => {
                    // implicit barrier: every non-optional job in a
                    // strictly earlier stage
                    let job_rank = rank.get(job.stage.as_str()).copied().unwrap_or(0);
                    included
                        .iter()
                        .filter(|p| {
                            !p.optional
                                && rank.get(p.stage.as_str()).copied().unwrap_or(0) < job_rank
                        })
                        .map(|p| p.name.clone())
                        .collect()
                }
            };

            indices.insert(job.name.clone(), i);
            nodes.push(GraphNode {
                job: (*job).clone(),
                prereqs,
            });
        }

        let graph = Self {
            name: pipeline
                .name
                .clone()
                .unwrap_or_else(|| "pipeline".to_string()),
            nodes,
            indices,
            variables: pipeline.variables.clone(),
        };

        graph.detect_cycles()?;

        Ok(graph)
    }

    /// Detect cycles with a DFS recursion-stack marker.
    fn detect_cycles(&self) -> Result<(), ConfigError> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();

        for node in &self.nodes {
            if !visited.contains(node.job.name.as_str()) {
                if let Some(cycle) = self.dfs_cycle(node, &mut visited, &mut rec_stack) {
                    return Err(ConfigError::CycleDetected(cycle.join(" -> ")));
                }
            }
        }

        Ok(())
    }

    fn dfs_cycle(
        &self,
        node: &GraphNode,
        visited: &mut HashSet<String>,
        rec_stack: &mut HashSet<String>,
    ) -> Option<Vec<String>> {
        let name = node.job.name.clone();
        visited.insert(name.clone());
        rec_stack.insert(name.clone());

        for dep in &node.prereqs {
            if !visited.contains(dep) {
                if let Some(idx) = self.indices.get(dep) {
                    if let Some(mut cycle) = self.dfs_cycle(&self.nodes[*idx], visited, rec_stack) {
                        cycle.insert(0, name.clone());
                        return Some(cycle);
                    }
                }
            } else if rec_stack.contains(dep) {
                return Some(vec![name.clone(), dep.clone()]);
            }
        }

        rec_stack.remove(&name);
        None
    }

    pub fn pipeline_name(&self) -> &str {
        &self.name
    }

    /// Get a node by job name.
    pub fn get(&self, name: &str) -> Option<&GraphNode> {
        self.indices.get(name).map(|&idx| &self.nodes[idx])
    }

    /// Included jobs in declaration order.
    pub fn jobs(&self) -> impl Iterator<Item = &GraphNode> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Environment for one job: pipeline variables, then job variables,
    /// then the engine's built-ins.
    pub fn job_env(&self, job: &Job) -> HashMap<String, String> {
        let mut env = self.variables.clone();
        env.extend(job.variables.clone());
        env.insert("PIPELINE_NAME".to_string(), self.name.clone());
        env.insert("JOB_NAME".to_string(), job.name.clone());
        env.insert("JOB_STAGE".to_string(), job.stage.clone());
        if let Some(depth) = job.fetch_depth {
            env.insert("FETCH_DEPTH".to_string(), depth.to_string());
        }
        env
    }
}
