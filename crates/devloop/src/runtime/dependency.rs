//! Dependency graph construction, cycle detection and leveled ordering

use crate::config::Manifest;
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// A service or resource in the dependency graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyNode {
    /// Node name
    pub name: String,
    /// Startup level; 0 for resources and dependency-free services
    pub level: usize,
    /// Resources are dependency leaves and are never started
    pub is_resource: bool,
    /// Direct dependencies in declaration order
    pub dependencies: Vec<String>,
}

/// Dependency graph over services and resources.
///
/// Nodes live in an arena addressed by index; `edges[i]` mirrors
/// `nodes[i].dependencies`. Read-only once built.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<DependencyNode>,
    index_map: HashMap<String, usize>,
    edges: Vec<Vec<usize>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl DependencyGraph {
    /// Build the graph for every service and resource in a manifest
    pub fn build(manifest: &Manifest) -> Result<Self, DependencyError> {
        Self::from_declarations(
            manifest
                .services
                .iter()
                .map(|(name, svc)| (name.clone(), svc.uses.clone())),
            manifest.resources.keys().cloned(),
        )
    }

    /// Build the graph from `(service, uses)` pairs and resource names
    pub fn from_declarations<S, R>(services: S, resources: R) -> Result<Self, DependencyError>
    where
        S: IntoIterator<Item = (String, Vec<String>)>,
        R: IntoIterator<Item = String>,
    {
        let mut nodes = Vec::new();
        let mut index_map = HashMap::new();

        let declared = services
            .into_iter()
            .map(|(name, uses)| (name, uses, false))
            .chain(resources.into_iter().map(|name| (name, Vec::new(), true)));

        for (name, dependencies, is_resource) in declared {
            if index_map.contains_key(&name) {
                return Err(DependencyError::DuplicateName(name));
            }
            index_map.insert(name.clone(), nodes.len());
            nodes.push(DependencyNode {
                name,
                level: 0,
                is_resource,
                dependencies,
            });
        }

        let mut edges = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let targets = node
                .dependencies
                .iter()
                .map(|dep| {
                    index_map
                        .get(dep)
                        .copied()
                        .ok_or_else(|| DependencyError::UnknownDependency {
                            service: node.name.clone(),
                            dependency: dep.clone(),
                        })
                })
                .collect::<Result<Vec<_>, _>>()?;
            edges.push(targets);
        }

        let mut graph = Self {
            nodes,
            index_map,
            edges,
        };
        graph.detect_cycles()?;
        graph.compute_levels();

        log::debug!(
            "Dependency graph built: {} nodes, {} levels",
            graph.nodes.len(),
            graph.levels().len()
        );
        Ok(graph)
    }

    /// Depth-first search with three-color marking. Roots are visited in
    /// name order so the reported cycle is stable.
    fn detect_cycles(&self) -> Result<(), DependencyError> {
        let mut marks = vec![Mark::Unvisited; self.nodes.len()];
        let mut path = Vec::new();

        let mut roots: Vec<usize> = (0..self.nodes.len()).collect();
        roots.sort_by(|a, b| self.nodes[*a].name.cmp(&self.nodes[*b].name));

        for root in roots {
            if marks[root] == Mark::Unvisited {
                self.visit(root, &mut marks, &mut path)?;
            }
        }
        Ok(())
    }

    fn visit(
        &self,
        idx: usize,
        marks: &mut [Mark],
        path: &mut Vec<usize>,
    ) -> Result<(), DependencyError> {
        marks[idx] = Mark::InProgress;
        path.push(idx);

        for &dep in &self.edges[idx] {
            match marks[dep] {
                Mark::InProgress => {
                    let start = path.iter().position(|&i| i == dep).unwrap_or(0);
                    let mut cycle: Vec<String> = path[start..]
                        .iter()
                        .map(|&i| self.nodes[i].name.clone())
                        .collect();
                    cycle.push(self.nodes[dep].name.clone());
                    return Err(DependencyError::CyclicDependency {
                        node: self.nodes[dep].name.clone(),
                        path: cycle,
                    });
                }
                Mark::Unvisited => self.visit(dep, marks, path)?,
                Mark::Done => {}
            }
        }

        path.pop();
        marks[idx] = Mark::Done;
        Ok(())
    }

    /// level = 1 + max(level of dependencies). Requires an acyclic graph.
    fn compute_levels(&mut self) {
        let mut memo: Vec<Option<usize>> = vec![None; self.nodes.len()];
        for idx in 0..self.nodes.len() {
            let level = self.level_of(idx, &mut memo);
            self.nodes[idx].level = level;
        }
    }

    fn level_of(&self, idx: usize, memo: &mut [Option<usize>]) -> usize {
        if let Some(level) = memo[idx] {
            return level;
        }
        let level = if self.nodes[idx].is_resource || self.edges[idx].is_empty() {
            0
        } else {
            self.edges[idx]
                .iter()
                .map(|&dep| self.level_of(dep, memo))
                .max()
                .map_or(0, |max| max + 1)
        };
        memo[idx] = Some(level);
        level
    }

    /// Services grouped into startup levels.
    ///
    /// Every member of a level depends only on members of earlier levels.
    /// Resources are excluded, so resource-only levels never appear. Names
    /// within a level are sorted.
    pub fn levels(&self) -> Vec<Vec<String>> {
        let mut grouped: BTreeMap<usize, Vec<String>> = BTreeMap::new();
        for node in self.nodes.iter().filter(|n| !n.is_resource) {
            grouped.entry(node.level).or_default().push(node.name.clone());
        }
        grouped
            .into_values()
            .map(|mut level| {
                level.sort();
                level
            })
            .collect()
    }

    /// Levels in the order services should be stopped
    pub fn shutdown_order(&self) -> Vec<Vec<String>> {
        let mut levels = self.levels();
        levels.reverse();
        levels
    }

    /// Direct dependencies of `name`, sorted. Empty for unknown names.
    pub fn dependencies(&self, name: &str) -> Vec<&str> {
        let Some(&idx) = self.index_map.get(name) else {
            return Vec::new();
        };
        let mut deps: Vec<&str> = self.edges[idx]
            .iter()
            .map(|&i| self.nodes[i].name.as_str())
            .collect();
        deps.sort_unstable();
        deps.dedup();
        deps
    }

    /// Names that directly depend on `name`, sorted. Empty for unknown names.
    pub fn dependents(&self, name: &str) -> Vec<&str> {
        let Some(&target) = self.index_map.get(name) else {
            return Vec::new();
        };
        let mut dependents: Vec<&str> = self
            .edges
            .iter()
            .enumerate()
            .filter(|(_, targets)| targets.contains(&target))
            .map(|(i, _)| self.nodes[i].name.as_str())
            .collect();
        dependents.sort_unstable();
        dependents
    }

    /// Subgraph containing `roots` and everything they transitively depend
    /// on. Levels are carried over from this graph.
    pub fn filter<I, S>(&self, roots: I) -> Result<Self, DependencyError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut keep = BTreeSet::new();
        let mut stack = Vec::new();
        for root in roots {
            let root = root.as_ref();
            let idx = self
                .index_map
                .get(root)
                .copied()
                .ok_or_else(|| DependencyError::UnknownService(root.to_string()))?;
            stack.push(idx);
        }

        while let Some(idx) = stack.pop() {
            if keep.insert(idx) {
                stack.extend(self.edges[idx].iter().copied());
            }
        }

        let remap: HashMap<usize, usize> = keep
            .iter()
            .enumerate()
            .map(|(new, &old)| (old, new))
            .collect();

        let nodes: Vec<DependencyNode> = keep.iter().map(|&i| self.nodes[i].clone()).collect();
        let edges = keep
            .iter()
            .map(|&i| self.edges[i].iter().map(|old| remap[old]).collect())
            .collect();
        let index_map = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.name.clone(), i))
            .collect();

        Ok(Self {
            nodes,
            index_map,
            edges,
        })
    }

    pub fn node(&self, name: &str) -> Option<&DependencyNode> {
        self.index_map.get(name).map(|&i| &self.nodes[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_map.contains_key(name)
    }

    /// All nodes in declaration order
    pub fn nodes(&self) -> impl Iterator<Item = &DependencyNode> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Errors that can occur when building or querying the dependency graph
#[derive(Debug, thiserror::Error)]
pub enum DependencyError {
    #[error("Service '{service}' depends on unknown service or resource '{dependency}'")]
    UnknownDependency { service: String, dependency: String },

    #[error("Unknown service '{0}'")]
    UnknownService(String),

    #[error("Name '{0}' is declared more than once")]
    DuplicateName(String),

    #[error("Cyclic dependency detected at '{node}': {}", .path.join(" -> "))]
    CyclicDependency { node: String, path: Vec<String> },
}
