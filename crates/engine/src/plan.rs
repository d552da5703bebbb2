//! Dependency planning
//!
//! Builds the case graph from `depends_on`, rejects unknown targets and
//! cycles, applies tag and module filters and produces a stable
//! topological execution order.

use kwrun_common::{Case, Error, Result, RunConfig};
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use tracing::{debug, info};

/// Case selection derived from the run configuration
#[derive(Debug, Clone, Default)]
pub struct PlanFilter {
    /// Keep cases carrying any of these tags (empty = all)
    pub tags: BTreeSet<String>,

    /// Keep suites whose module is listed (empty = all)
    pub modules: BTreeSet<String>,
}

impl PlanFilter {
    pub fn from_config(config: &RunConfig) -> Self {
        Self {
            tags: config.case_tags.clone(),
            modules: config.case_modules.clone(),
        }
    }

    pub fn admits_module(&self, module: Option<&str>) -> bool {
        self.modules.is_empty() || module.is_some_and(|m| self.modules.contains(m))
    }

    fn admits_case(&self, case: &Case) -> bool {
        self.tags.is_empty() || !self.tags.is_disjoint(&case.tags)
    }
}

/// Cases in execution order with their prerequisite edges
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub cases: Vec<Case>,

    /// `deps[i]` holds the positions in `cases` that case `i` depends on
    pub deps: Vec<Vec<usize>>,

    /// Cases dropped by the filter
    pub excluded: Vec<String>,
}

/// Serializable view of a plan, one row per case
#[derive(Debug, Clone, Serialize)]
pub struct PlanEntry {
    pub position: usize,
    pub name: String,
    pub capability: String,
    pub depends_on: Vec<String>,
    pub tags: Vec<String>,
}

impl Plan {
    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.cases.iter().map(|c| c.name.as_str()).collect()
    }

    /// `dependents()[i]` holds the positions of the cases that directly depend on case `i`
    pub fn dependents(&self) -> Vec<Vec<usize>> {
        let mut out = vec![Vec::new(); self.cases.len()];
        for (idx, deps) in self.deps.iter().enumerate() {
            for &dep in deps {
                out[dep].push(idx);
            }
        }
        out
    }

    pub fn entries(&self) -> Vec<PlanEntry> {
        self.cases
            .iter()
            .enumerate()
            .map(|(position, case)| PlanEntry {
                position,
                name: case.name.clone(),
                capability: case.action.capability().to_string(),
                depends_on: case.depends_on.clone(),
                tags: case.tags.iter().cloned().collect(),
            })
            .collect()
    }
}

/// Validate the dependency graph and order the selected cases
pub fn plan(cases: Vec<Case>, module: Option<&str>, filter: &PlanFilter) -> Result<Plan> {
    let graph = CaseGraph::build(&cases)?;
    graph.detect_cycles()?;

    if !filter.admits_module(module) {
        debug!("Module {:?} excluded by filter", module);
        return Ok(Plan {
            excluded: cases.into_iter().map(|c| c.name).collect(),
            ..Plan::default()
        });
    }

    // selected cases pull in every transitive prerequisite
    let mut selected = vec![false; cases.len()];
    let mut stack: Vec<usize> = (0..cases.len())
        .filter(|&i| filter.admits_case(&cases[i]))
        .collect();
    while let Some(idx) = stack.pop() {
        if !selected[idx] {
            selected[idx] = true;
            stack.extend(graph.edges[idx].iter().copied());
        }
    }

    let order = graph.topological_order(&selected);

    let mut position = HashMap::new();
    for (pos, &idx) in order.iter().enumerate() {
        position.insert(idx, pos);
    }
    let deps = order
        .iter()
        .map(|&idx| graph.edges[idx].iter().map(|d| position[d]).collect())
        .collect();

    let mut slots: Vec<Option<Case>> = cases.into_iter().map(Some).collect();
    let excluded = slots
        .iter()
        .enumerate()
        .filter(|(i, _)| !selected[*i])
        .filter_map(|(_, c)| c.as_ref().map(|c| c.name.clone()))
        .collect();
    let ordered = order.iter().filter_map(|&idx| slots[idx].take()).collect();

    let plan = Plan {
        cases: ordered,
        deps,
        excluded,
    };
    info!(
        "Planned {} case(s), {} excluded by filter",
        plan.len(),
        plan.excluded.len()
    );
    Ok(plan)
}

/// Prerequisite edges by declaration index
struct CaseGraph<'a> {
    names: Vec<&'a str>,
    edges: Vec<Vec<usize>>,
}

impl<'a> CaseGraph<'a> {
    fn build(cases: &'a [Case]) -> Result<Self> {
        let mut index = HashMap::new();
        for (i, case) in cases.iter().enumerate() {
            if index.insert(case.name.as_str(), i).is_some() {
                return Err(Error::DuplicateCase(case.name.clone()));
            }
        }

        let mut edges = Vec::with_capacity(cases.len());
        for case in cases {
            let mut deps = Vec::new();
            for dep in &case.depends_on {
                let target = index.get(dep.as_str()).ok_or_else(|| Error::UnknownDependency {
                    case: case.name.clone(),
                    dependency: dep.clone(),
                })?;
                if !deps.contains(target) {
                    deps.push(*target);
                }
            }
            edges.push(deps);
        }

        Ok(Self {
            names: cases.iter().map(|c| c.name.as_str()).collect(),
            edges,
        })
    }

    fn detect_cycles(&self) -> Result<()> {
        let mut visited = HashSet::new();
        let mut rec_stack = HashSet::new();
        let mut path = Vec::new();

        for node in 0..self.names.len() {
            if !visited.contains(&node) {
                self.dfs_cycle(node, &mut visited, &mut rec_stack, &mut path)?;
            }
        }
        Ok(())
    }

    fn dfs_cycle(
        &self,
        node: usize,
        visited: &mut HashSet<usize>,
        rec_stack: &mut HashSet<usize>,
        path: &mut Vec<usize>,
    ) -> Result<()> {
        visited.insert(node);
        rec_stack.insert(node);
        path.push(node);

        for &next in &self.edges[node] {
            if !visited.contains(&next) {
                self.dfs_cycle(next, visited, rec_stack, path)?;
            } else if rec_stack.contains(&next) {
                let start = path.iter().position(|&n| n == next).unwrap_or(0);
                let mut cycle: Vec<String> =
                    path[start..].iter().map(|&n| self.names[n].to_string()).collect();
                cycle.push(self.names[next].to_string());
                return Err(Error::CyclicDependency { cycle });
            }
        }

        path.pop();
        rec_stack.remove(&node);
        Ok(())
    }

    /// Kahn's algorithm over the selected nodes, smallest declaration index first
    fn topological_order(&self, selected: &[bool]) -> Vec<usize> {
        let mut pending = vec![0usize; self.names.len()];
        let mut dependents = vec![Vec::new(); self.names.len()];
        for (idx, deps) in self.edges.iter().enumerate() {
            if !selected[idx] {
                continue;
            }
            pending[idx] = deps.len();
            for &dep in deps {
                dependents[dep].push(idx);
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = (0..self.names.len())
            .filter(|&i| selected[i] && pending[i] == 0)
            .map(Reverse)
            .collect();

        let mut order = Vec::new();
        while let Some(Reverse(idx)) = ready.pop() {
            order.push(idx);
            for &dependent in &dependents[idx] {
                pending[dependent] -= 1;
                if pending[dependent] == 0 {
                    ready.push(Reverse(dependent));
                }
            }
        }
        order
    }
}
