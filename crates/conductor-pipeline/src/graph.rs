//! Dependency graph helpers for DAG pipelines.

use std::collections::HashMap;

use conductor_types::Pipeline;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Topological order of stage indices: every stage comes after its
/// dependencies, ties keep declaration order.
///
/// Returns the offending cycle path (`a -> b -> a`) when the dependency graph
/// is not acyclic. Dependencies on unknown stages are ignored here; the
/// validation rules report them.
pub fn topological_order(pipeline: &Pipeline) -> std::result::Result<Vec<usize>, Vec<String>> {
    let index: HashMap<&str, usize> = pipeline
        .stages
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut marks: HashMap<usize, Mark> = HashMap::new();
    let mut order = Vec::with_capacity(pipeline.stages.len());
    let mut path = Vec::new();

    for start in 0..pipeline.stages.len() {
        visit(pipeline, &index, start, &mut marks, &mut path, &mut order)?;
    }
    Ok(order)
}

fn visit(
    pipeline: &Pipeline,
    index: &HashMap<&str, usize>,
    node: usize,
    marks: &mut HashMap<usize, Mark>,
    path: &mut Vec<usize>,
    order: &mut Vec<usize>,
) -> std::result::Result<(), Vec<String>> {
    match marks.get(&node) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            let from = path.iter().position(|&n| n == node).unwrap_or(0);
            let mut cycle: Vec<String> = path[from..]
                .iter()
                .map(|&n| pipeline.stages[n].id.clone())
                .collect();
            cycle.push(pipeline.stages[node].id.clone());
            return Err(cycle);
        }
        None => {}
    }

    marks.insert(node, Mark::Visiting);
    path.push(node);
    for dep in &pipeline.stages[node].dependencies {
        if let Some(&dep_index) = index.get(dep.as_str()) {
            visit(pipeline, index, dep_index, marks, path, order)?;
        }
    }
    path.pop();
    marks.insert(node, Mark::Done);
    order.push(node);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_types::{ExecutionMode, PipelineStage};

    fn ids(pipeline: &Pipeline, order: Vec<usize>) -> Vec<&str> {
        order.into_iter().map(|i| pipeline.stages[i].id.as_str()).collect()
    }

    #[test]
    fn dependencies_come_first() {
        let pipeline = Pipeline::new(
            "diamond",
            ExecutionMode::Dag,
            vec![
                PipelineStage::new("report", "a").with_dependencies(["lint", "test"]),
                PipelineStage::new("test", "a").with_dependencies(["build"]),
                PipelineStage::new("lint", "a").with_dependencies(["build"]),
                PipelineStage::new("build", "a"),
            ],
        );
        let order = topological_order(&pipeline).unwrap();
        assert_eq!(ids(&pipeline, order), vec!["build", "lint", "test", "report"]);
    }

    #[test]
    fn independent_stages_keep_declaration_order() {
        let pipeline = Pipeline::new(
            "flat",
            ExecutionMode::Dag,
            vec![
                PipelineStage::new("c", "a"),
                PipelineStage::new("a", "a"),
                PipelineStage::new("b", "a"),
            ],
        );
        let order = topological_order(&pipeline).unwrap();
        assert_eq!(ids(&pipeline, order), vec!["c", "a", "b"]);
    }

    #[test]
    fn cycle_is_reported_with_path() {
        let pipeline = Pipeline::new(
            "loop",
            ExecutionMode::Dag,
            vec![
                PipelineStage::new("a", "x").with_dependencies(["c"]),
                PipelineStage::new("b", "x").with_dependencies(["a"]),
                PipelineStage::new("c", "x").with_dependencies(["b"]),
            ],
        );
        let cycle = topological_order(&pipeline).unwrap_err();
        assert_eq!(cycle, vec!["a", "c", "b", "a"]);
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let pipeline = Pipeline::new(
            "self",
            ExecutionMode::Dag,
            vec![PipelineStage::new("a", "x").with_dependencies(["a"])],
        );
        assert_eq!(topological_order(&pipeline).unwrap_err(), vec!["a", "a"]);
    }
}
