//! Dependency validation and topological ordering.
//!
//! Depth-first traversal with a `visited` set and a `visiting` set. Reaching
//! a node that is still in `visiting` means the walk came back around, so
//! the graph has a cycle. The order is stable for a given stage list: roots
//! are visited in insertion order, dependencies in declared order.

use crate::error::PipelineError;
use crate::stage::ProcessingStage;
use std::collections::{HashMap, HashSet};

/// Check that stage ids are unique and every dependency id names an
/// existing stage.
pub fn validate_dependencies(stages: &[ProcessingStage]) -> Result<(), PipelineError> {
    let mut ids = HashSet::with_capacity(stages.len());
    for stage in stages {
        if !ids.insert(stage.id.as_str()) {
            return Err(PipelineError::DuplicateStage {
                stage_id: stage.id.clone(),
            });
        }
    }
    for stage in stages {
        for dep in &stage.dependencies {
            if !ids.contains(dep.as_str()) {
                return Err(PipelineError::StageNotFound {
                    stage_id: stage.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Return stage indices ordered so every dependency precedes its dependents.
pub fn topological_order(stages: &[ProcessingStage]) -> Result<Vec<usize>, PipelineError> {
    let index: HashMap<&str, usize> = stages
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut visited = HashSet::with_capacity(stages.len());
    let mut visiting = HashSet::new();
    let mut order = Vec::with_capacity(stages.len());

    for i in 0..stages.len() {
        visit(i, stages, &index, &mut visited, &mut visiting, &mut order)?;
    }
    Ok(order)
}

fn visit(
    i: usize,
    stages: &[ProcessingStage],
    index: &HashMap<&str, usize>,
    visited: &mut HashSet<usize>,
    visiting: &mut HashSet<usize>,
    order: &mut Vec<usize>,
) -> Result<(), PipelineError> {
    if visited.contains(&i) {
        return Ok(());
    }
    if !visiting.insert(i) {
        return Err(PipelineError::CircularDependency {
            stage_id: stages[i].id.clone(),
        });
    }

    for dep in &stages[i].dependencies {
        let &d = index
            .get(dep.as_str())
            .ok_or_else(|| PipelineError::StageNotFound {
                stage_id: stages[i].id.clone(),
                dependency: dep.clone(),
            })?;
        visit(d, stages, index, visited, visiting, order)?;
    }

    visiting.remove(&i);
    visited.insert(i);
    order.push(i);
    Ok(())
}
