use std::collections::{BTreeMap, HashMap, HashSet};

use phaseflow_core::error::{PhaseflowError, Result};
use phaseflow_core::types::Stage;

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    InProgress,
    Done,
}

/// Depth-first search for a back edge.
///
/// `graph` maps each node to the nodes it depends on. Returns the first cycle
/// found as a path that starts and ends at the same node. Edges to nodes that
/// are not keys of `graph` are ignored.
pub fn find_cycle(graph: &BTreeMap<&str, Vec<&str>>) -> Option<Vec<String>> {
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut path: Vec<&str> = Vec::new();

    for node in graph.keys() {
        if let Some(cycle) = visit(*node, graph, &mut marks, &mut path) {
            return Some(cycle);
        }
    }
    None
}

fn visit<'a>(
    node: &'a str,
    graph: &BTreeMap<&'a str, Vec<&'a str>>,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
) -> Option<Vec<String>> {
    match marks.get(node) {
        Some(Mark::Done) => return None,
        Some(Mark::InProgress) => {
            let start = path.iter().position(|n| *n == node).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
            cycle.push(node.to_string());
            return Some(cycle);
        }
        None => {}
    }

    marks.insert(node, Mark::InProgress);
    path.push(node);

    if let Some(deps) = graph.get(node) {
        for dep in deps {
            if let Some(cycle) = visit(*dep, graph, marks, path) {
                return Some(cycle);
            }
        }
    }

    path.pop();
    marks.insert(node, Mark::Done);
    None
}

/// Reject duplicate stage names, dependencies on unknown stages, and cycles.
pub fn validate_stage_graph(stages: &[Stage]) -> Result<()> {
    let mut names = HashSet::new();
    for stage in stages {
        if !names.insert(stage.name.as_str()) {
            return Err(PhaseflowError::config(format!(
                "duplicate stage name '{}'",
                stage.name
            )));
        }
    }

    for stage in stages {
        if let Some(missing) = stage
            .dependencies
            .iter()
            .find(|d| !names.contains(d.as_str()))
        {
            return Err(PhaseflowError::config(format!(
                "stage '{}' depends on unknown stage '{}'",
                stage.name, missing
            )));
        }
    }

    let graph: BTreeMap<&str, Vec<&str>> = stages
        .iter()
        .map(|s| {
            (
                s.name.as_str(),
                s.dependencies.iter().map(String::as_str).collect(),
            )
        })
        .collect();

    if let Some(cycle) = find_cycle(&graph) {
        return Err(PhaseflowError::config(format!(
            "stage dependency cycle: {}",
            cycle.join(" -> ")
        )));
    }

    Ok(())
}

/// Partition stages into waves. Every stage's dependencies lie in strictly
/// earlier waves; stages keep their declared order within a wave.
///
/// A pass that places nothing while stages remain is a configuration error.
pub fn group_stages(stages: &[Stage]) -> Result<Vec<Vec<&Stage>>> {
    let mut placed: HashSet<&str> = HashSet::new();
    let mut remaining: Vec<&Stage> = stages.iter().collect();
    let mut waves = Vec::new();

    while !remaining.is_empty() {
        let (ready, blocked): (Vec<&Stage>, Vec<&Stage>) = remaining
            .into_iter()
            .partition(|s| s.dependencies.iter().all(|d| placed.contains(d.as_str())));

        if ready.is_empty() {
            let stuck: Vec<&str> = blocked.iter().map(|s| s.name.as_str()).collect();
            return Err(PhaseflowError::config(format!(
                "stages cannot be ordered (cycle or unknown dependency): {}",
                stuck.join(", ")
            )));
        }

        placed.extend(ready.iter().map(|s| s.name.as_str()));
        waves.push(ready);
        remaining = blocked;
    }

    Ok(waves)
}
