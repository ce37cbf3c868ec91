//! Dependency graph, topological ordering and publish planning.
//!
//! Nodes are item types (and, within a type, individual items). An edge
//! `A → B` means "B depends on A": A must be published before B, and B must
//! be unpublished before A.
//!
//! Ordering uses Kahn's algorithm with a sorted ready set, so independent
//! nodes always come out in lexical order and the same input always yields
//! the same plan. Leftover nodes after Kahn mean a cycle; a DFS over them
//! recovers the cycle path for the error.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;

use tracing::debug;

use crate::error::{DeployError, DeployResult};
use crate::item::{Item, ItemType};
use crate::registry::PublisherRegistry;

/// Directed dependency graph over ordered node ids.
#[derive(Debug, Clone)]
pub struct DependencyGraph<N: Ord + Clone> {
    /// `dependency → {dependent, ...}`
    downstream: BTreeMap<N, BTreeSet<N>>,
    /// `dependent → {dependency, ...}`
    upstream: BTreeMap<N, BTreeSet<N>>,
}

impl<N: Ord + Clone> Default for DependencyGraph<N> {
    fn default() -> Self {
        DependencyGraph {
            downstream: BTreeMap::new(),
            upstream: BTreeMap::new(),
        }
    }
}

impl<N: Ord + Clone + Display> DependencyGraph<N> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a node. Idempotent.
    pub fn add_node(&mut self, node: N) {
        self.downstream.entry(node.clone()).or_default();
        self.upstream.entry(node).or_default();
    }

    pub fn contains(&self, node: &N) -> bool {
        self.downstream.contains_key(node)
    }

    pub fn len(&self) -> usize {
        self.downstream.len()
    }

    pub fn is_empty(&self) -> bool {
        self.downstream.is_empty()
    }

    /// Add an edge: `dependent` depends on `dependency`. Missing nodes are
    /// registered. Cycles are reported by the ordering methods, not here.
    pub fn add_dependency(&mut self, dependency: N, dependent: N) {
        self.add_node(dependency.clone());
        self.add_node(dependent.clone());
        self.downstream
            .entry(dependency.clone())
            .or_default()
            .insert(dependent.clone());
        self.upstream.entry(dependent).or_default().insert(dependency);
    }

    /// Direct dependencies of `node`.
    pub fn dependencies_of(&self, node: &N) -> impl Iterator<Item = &N> {
        self.upstream.get(node).into_iter().flatten()
    }

    /// Nodes in dependency order (dependencies first).
    pub fn topological_order(&self) -> DeployResult<Vec<N>> {
        Ok(self.levels()?.into_iter().flatten().collect())
    }

    /// Kahn waves: every node in wave `k` depends only on nodes in earlier
    /// waves, so the nodes of one wave can be processed concurrently.
    ///
    /// Nodes inside a wave are in lexical order.
    pub fn levels(&self) -> DeployResult<Vec<Vec<N>>> {
        let mut in_degree: BTreeMap<&N, usize> = self
            .upstream
            .iter()
            .map(|(node, deps)| (node, deps.len()))
            .collect();

        let mut ready: BTreeSet<&N> = in_degree
            .iter()
            .filter(|(_, &deg)| deg == 0)
            .map(|(&node, _)| node)
            .collect();

        let mut levels = Vec::new();
        let mut placed = 0usize;

        while !ready.is_empty() {
            let wave: Vec<&N> = std::mem::take(&mut ready).into_iter().collect();
            for node in &wave {
                for dependent in self.downstream.get(*node).into_iter().flatten() {
                    if let Some(deg) = in_degree.get_mut(dependent) {
                        *deg -= 1;
                        if *deg == 0 {
                            ready.insert(dependent);
                        }
                    }
                }
            }
            placed += wave.len();
            levels.push(wave.into_iter().cloned().collect());
        }

        if placed != self.downstream.len() {
            let leftover: BTreeSet<&N> = in_degree
                .iter()
                .filter(|(_, &deg)| deg > 0)
                .map(|(&node, _)| node)
                .collect();
            return Err(DeployError::DependencyCycle {
                nodes: self.cycle_within(&leftover),
            });
        }

        Ok(levels)
    }

    /// Find one cycle among `leftover` nodes; falls back to listing them all.
    fn cycle_within<'a>(&'a self, leftover: &BTreeSet<&'a N>) -> Vec<String> {
        let mut visited = BTreeSet::new();
        for &start in leftover {
            let mut path = Vec::new();
            if let Some(cycle) = self.dfs_cycle(start, leftover, &mut visited, &mut path) {
                return cycle.into_iter().map(|node| node.to_string()).collect();
            }
        }
        leftover.iter().map(|node| node.to_string()).collect()
    }

    fn dfs_cycle<'a>(
        &'a self,
        node: &'a N,
        leftover: &BTreeSet<&N>,
        visited: &mut BTreeSet<&'a N>,
        path: &mut Vec<&'a N>,
    ) -> Option<Vec<&'a N>> {
        if let Some(pos) = path.iter().position(|seen| *seen == node) {
            let mut cycle = path[pos..].to_vec();
            cycle.push(node);
            return Some(cycle);
        }
        if !visited.insert(node) {
            return None;
        }
        path.push(node);
        for dependent in self.downstream.get(node).into_iter().flatten() {
            if leftover.contains(dependent) {
                if let Some(cycle) = self.dfs_cycle(dependent, leftover, visited, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        None
    }
}

/// Static "type X depends on type Y" table.
#[derive(Debug, Clone, Default)]
pub struct TypeDependencies {
    /// `dependent → {dependency, ...}`
    edges: BTreeMap<ItemType, BTreeSet<ItemType>>,
}

impl TypeDependencies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that `dependent` items are published after `dependency` items.
    pub fn add(&mut self, dependent: ItemType, dependency: ItemType) -> &mut Self {
        self.edges.entry(dependent).or_default().insert(dependency);
        self
    }

    pub fn dependencies_of(&self, item_type: &ItemType) -> impl Iterator<Item = &ItemType> {
        self.edges.get(item_type).into_iter().flatten()
    }

    fn graph(&self) -> DependencyGraph<ItemType> {
        let mut graph = DependencyGraph::new();
        for (dependent, dependencies) in &self.edges {
            graph.add_node(dependent.clone());
            for dependency in dependencies {
                graph.add_dependency(dependency.clone(), dependent.clone());
            }
        }
        graph
    }
}

/// One item type's slice of a publish plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub item_type: ItemType,
    /// Item names grouped into waves; each wave may run concurrently once
    /// the previous wave is done.
    pub waves: Vec<Vec<String>>,
}

impl Stage {
    pub fn item_names(&self) -> impl Iterator<Item = &str> {
        self.waves.iter().flatten().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.waves.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ordered stages for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishPlan {
    pub stages: Vec<Stage>,
}

impl PublishPlan {
    /// Same plan run backwards: later stages and later waves first.
    pub fn reversed(&self) -> PublishPlan {
        PublishPlan {
            stages: self
                .stages
                .iter()
                .rev()
                .map(|stage| Stage {
                    item_type: stage.item_type.clone(),
                    waves: stage.waves.iter().rev().cloned().collect(),
                })
                .collect(),
        }
    }

    pub fn item_count(&self) -> usize {
        self.stages.iter().map(Stage::len).sum()
    }

    pub fn types(&self) -> impl Iterator<Item = &ItemType> {
        self.stages.iter().map(|stage| &stage.item_type)
    }
}

/// Computes publish and unpublish order for a set of items.
#[derive(Debug, Clone, Default)]
pub struct DependencyResolver {
    type_dependencies: TypeDependencies,
}

impl DependencyResolver {
    pub fn new(type_dependencies: TypeDependencies) -> Self {
        DependencyResolver { type_dependencies }
    }

    pub fn type_dependencies(&self) -> &TypeDependencies {
        &self.type_dependencies
    }

    /// Order the given types, dependencies first.
    ///
    /// The full table is sorted before filtering so that transitive
    /// constraints through absent types still hold.
    pub fn resolve_types(&self, present: &BTreeSet<ItemType>) -> DeployResult<Vec<ItemType>> {
        let mut graph = self.type_dependencies.graph();
        for item_type in present {
            graph.add_node(item_type.clone());
        }
        let order = graph.topological_order()?;
        Ok(order
            .into_iter()
            .filter(|item_type| present.contains(item_type))
            .collect())
    }

    /// Build the full plan: type order plus item-level waves inside each
    /// type, using each publisher's reference discovery.
    pub fn plan(&self, items: &[Item], registry: &PublisherRegistry) -> DeployResult<PublishPlan> {
        let mut by_type: BTreeMap<ItemType, Vec<&Item>> = BTreeMap::new();
        for item in items {
            by_type.entry(item.item_type().clone()).or_default().push(item);
        }

        for (item_type, peers) in &by_type {
            let mut names = BTreeSet::new();
            for item in peers {
                if !names.insert(item.name()) {
                    return Err(DeployError::DuplicateItem {
                        item_type: item_type.to_string(),
                        name: item.name().to_string(),
                    });
                }
            }
            if !registry.contains(item_type) {
                return Err(DeployError::NoPublisher {
                    item_type: item_type.to_string(),
                });
            }
        }

        let present: BTreeSet<ItemType> = by_type.keys().cloned().collect();
        let order = self.resolve_types(&present)?;

        let mut stages = Vec::with_capacity(order.len());
        for item_type in order {
            let peers = by_type.remove(&item_type).unwrap_or_default();
            let waves = match registry.get(&item_type) {
                Some(publisher) => {
                    let names: BTreeSet<&str> = peers.iter().map(|item| item.name()).collect();
                    let mut graph = DependencyGraph::new();
                    for item in &peers {
                        graph.add_node(item.name().to_string());
                        for reference in publisher.discover_references(item, &peers) {
                            if reference != item.name() && names.contains(reference.as_str()) {
                                graph.add_dependency(reference, item.name().to_string());
                            }
                        }
                    }
                    graph.levels()?
                }
                None => vec![peers.iter().map(|item| item.name().to_string()).collect()],
            };
            debug!(
                item_type = %item_type,
                items = peers.len(),
                waves = waves.len(),
                "Planned stage"
            );
            stages.push(Stage { item_type, waves });
        }

        Ok(PublishPlan { stages })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(edges: &[(&str, &str)]) -> DependencyGraph<String> {
        let mut g = DependencyGraph::new();
        for (dependency, dependent) in edges {
            g.add_dependency(dependency.to_string(), dependent.to_string());
        }
        g
    }

    #[test]
    fn chain_orders_dependencies_first() {
        let g = graph(&[("c", "b"), ("b", "a")]);
        assert_eq!(g.topological_order().unwrap(), vec!["c", "b", "a"]);
    }

    #[test]
    fn independent_nodes_break_ties_lexically() {
        let mut g = graph(&[("root", "zeta"), ("root", "alpha")]);
        g.add_node("mid".to_string());
        assert_eq!(
            g.levels().unwrap(),
            vec![vec!["mid", "root"], vec!["alpha", "zeta"]]
        );
    }

    #[test]
    fn diamond_levels() {
        let g = graph(&[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")]);
        assert_eq!(
            g.levels().unwrap(),
            vec![vec!["a"], vec!["b", "c"], vec!["d"]]
        );
    }

    #[test]
    fn cycle_is_reported_with_its_path() {
        let g = graph(&[("a", "b"), ("b", "c"), ("c", "a"), ("root", "a")]);
        match g.topological_order() {
            Err(DeployError::DependencyCycle { nodes }) => {
                assert_eq!(nodes.first(), nodes.last());
                for node in ["a", "b", "c"] {
                    assert!(nodes.iter().any(|n| n == node), "{nodes:?}");
                }
                assert!(!nodes.iter().any(|n| n == "root"));
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let g = graph(&[("a", "a")]);
        assert!(matches!(
            g.topological_order(),
            Err(DeployError::DependencyCycle { .. })
        ));
    }

    #[test]
    fn resolve_types_keeps_transitive_order_through_absent_types() {
        let mut table = TypeDependencies::new();
        table
            .add(ItemType::new("B"), ItemType::new("Z"))
            .add(ItemType::new("Z"), ItemType::new("C"));
        let resolver = DependencyResolver::new(table);

        let present: BTreeSet<ItemType> = ["B", "C"].into_iter().map(ItemType::new).collect();
        let order = resolver.resolve_types(&present).unwrap();
        assert_eq!(order, vec![ItemType::new("C"), ItemType::new("B")]);
    }

    #[test]
    fn reversed_plan_flips_stages_and_waves() {
        let plan = PublishPlan {
            stages: vec![
                Stage {
                    item_type: ItemType::new("A"),
                    waves: vec![vec!["a1".into()], vec!["a2".into()]],
                },
                Stage {
                    item_type: ItemType::new("B"),
                    waves: vec![vec!["b1".into()]],
                },
            ],
        };
        let reversed = plan.reversed();
        let types: Vec<_> = reversed.types().map(ItemType::as_str).collect();
        assert_eq!(types, vec!["B", "A"]);
        assert_eq!(
            reversed.stages[1].waves,
            vec![vec!["a2".to_string()], vec!["a1".to_string()]]
        );
        assert_eq!(reversed.item_count(), 3);
    }
}
