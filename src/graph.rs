//! ConfigGraph (§4.3): the immutable, acyclic dependency graph built from a
//! project's fully-resolved modules.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::config::model::{DependencyRef, Module};
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Build,
    Service,
    Task,
    Test,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub kind: NodeKind,
    pub name: Arc<str>,
}

impl NodeId {
    pub fn new(kind: NodeKind, name: impl Into<Arc<str>>) -> Self {
        Self { kind, name: name.into() }
    }

    fn build(module: &str) -> Self {
        Self::new(NodeKind::Build, module)
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            NodeKind::Build => "build",
            NodeKind::Service => "service",
            NodeKind::Task => "task",
            NodeKind::Test => "test",
        };
        write!(f, "{kind}:{}", self.name)
    }
}

/// An in-memory typed graph of modules, services, tasks and tests and their
/// four dependency relations (§4.3). Immutable after construction — safe to
/// read concurrently (§5).
pub struct ConfigGraph {
    adjacency: HashMap<NodeId, Vec<NodeId>>,
    predecessors: HashMap<NodeId, Vec<NodeId>>,
    module_of: HashMap<NodeId, Arc<str>>,
    nodes: Vec<NodeId>,
}

impl ConfigGraph {
    /// Build the graph from a project's fully-resolved modules, validating
    /// name uniqueness, reference resolution and acyclicity.
    pub fn build(modules: &[Module]) -> Result<Self, ConfigError> {
        let mut service_names: HashMap<Arc<str>, Arc<str>> = HashMap::new();
        let mut task_names: HashMap<Arc<str>, Arc<str>> = HashMap::new();

        for module in modules {
            for service in &module.services {
                if service_names.insert(Arc::clone(&service.name), Arc::clone(&module.name)).is_some() {
                    return Err(ConfigError::DuplicateName(service.name.to_string()));
                }
            }
            for task in &module.tasks {
                if task_names.insert(Arc::clone(&task.name), Arc::clone(&module.name)).is_some() {
                    return Err(ConfigError::DuplicateName(task.name.to_string()));
                }
            }
        }

        for name in service_names.keys() {
            if task_names.contains_key(name) {
                return Err(ConfigError::ServiceTaskNameCollision(name.to_string()));
            }
        }

        let mut adjacency: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let mut predecessors: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
        let mut module_of: HashMap<NodeId, Arc<str>> = HashMap::new();
        let mut nodes: Vec<NodeId> = Vec::new();

        let mut add_node = |id: NodeId, module: &Arc<str>| {
            adjacency.entry(id.clone()).or_default();
            predecessors.entry(id.clone()).or_default();
            module_of.insert(id.clone(), Arc::clone(module));
            nodes.push(id);
        };

        for module in modules {
            add_node(NodeId::build(&module.name), &module.name);
        }
        for module in modules {
            for service in &module.services {
                add_node(NodeId::new(NodeKind::Service, Arc::clone(&service.name)), &module.name);
            }
            for task in &module.tasks {
                add_node(NodeId::new(NodeKind::Task, Arc::clone(&task.name)), &module.name);
            }
            for test in &module.tests {
                let key: Arc<str> = Arc::from(test.key(&module.name));
                add_node(NodeId::new(NodeKind::Test, key), &module.name);
            }
        }

        let mut edge = |from: NodeId, to: NodeId| {
            predecessors.entry(from.clone()).or_default().push(to.clone());
            adjacency.entry(to).or_default().push(from);
        };

        for module in modules {
            for dep in &module.build.dependencies {
                let dep_id = NodeId::build(&dep.name);
                if !module_of.contains_key(&dep_id) {
                    return Err(ConfigError::UnknownReference {
                        path: format!("modules.{}.build.dependencies.{}", module.name, dep.name),
                    });
                }
                edge(NodeId::build(&module.name), dep_id);
            }

            for service in &module.services {
                let node = NodeId::new(NodeKind::Service, Arc::clone(&service.name));
                edge(node.clone(), NodeId::build(&module.name));
                for dep in &service.dependencies {
                    resolve_and_edge(dep, &node, &service_names, &task_names, &mut edge)?;
                }
            }

            for task in &module.tasks {
                let node = NodeId::new(NodeKind::Task, Arc::clone(&task.name));
                edge(node.clone(), NodeId::build(&module.name));
                for dep in &task.dependencies {
                    resolve_and_edge(dep, &node, &service_names, &task_names, &mut edge)?;
                }
            }

            for test in &module.tests {
                let key: Arc<str> = Arc::from(test.key(&module.name));
                let node = NodeId::new(NodeKind::Test, key);
                edge(node.clone(), NodeId::build(&module.name));
                for dep in &test.dependencies {
                    resolve_and_edge(dep, &node, &service_names, &task_names, &mut edge)?;
                }
            }
        }

        let graph = ConfigGraph {
            adjacency,
            predecessors,
            module_of,
            nodes,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }

    fn check_acyclic(&self) -> Result<(), ConfigError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        let mut colors: HashMap<&NodeId, Color> = self.nodes.iter().map(|n| (n, Color::White)).collect();
        let mut path: Vec<&NodeId> = Vec::new();

        fn visit<'a>(
            node: &'a NodeId,
            predecessors: &'a HashMap<NodeId, Vec<NodeId>>,
            colors: &mut HashMap<&'a NodeId, Color>,
            path: &mut Vec<&'a NodeId>,
        ) -> Result<(), ConfigError> {
            match colors.get(node) {
                Some(Color::Black) => return Ok(()),
                Some(Color::Gray) => {
                    let start = path.iter().position(|n| *n == node).unwrap_or(0);
                    let cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
                    let mut rendered = cycle.join(" → ");
                    rendered.push_str(&format!(" → {node}"));
                    return Err(ConfigError::Cycle(rendered));
                }
                _ => {}
            }
            colors.insert(node, Color::Gray);
            path.push(node);
            if let Some(deps) = predecessors.get(node) {
                for dep in deps {
                    visit(dep, predecessors, colors, path)?;
                }
            }
            path.pop();
            colors.insert(node, Color::Black);
            Ok(())
        }

        for node in &self.nodes {
            visit(node, &self.predecessors, &mut colors, &mut path)?;
        }
        Ok(())
    }

    /// Direct or transitive dependencies of `node`.
    pub fn get_dependencies(&self, node: &NodeId, recursive: bool) -> Vec<NodeId> {
        if !recursive {
            return self.predecessors.get(node).cloned().unwrap_or_default();
        }
        self.transitive(node, &self.predecessors)
    }

    /// Direct or transitive dependants of `node`.
    pub fn get_dependants(&self, node: &NodeId, recursive: bool) -> Vec<NodeId> {
        if !recursive {
            return self.adjacency.get(node).cloned().unwrap_or_default();
        }
        self.transitive(node, &self.adjacency)
    }

    pub fn get_dependencies_for_many(&self, nodes: &[NodeId], recursive: bool) -> HashSet<NodeId> {
        nodes
            .iter()
            .flat_map(|n| self.get_dependencies(n, recursive))
            .collect()
    }

    pub fn get_dependants_for_many(&self, nodes: &[NodeId], recursive: bool) -> HashSet<NodeId> {
        nodes
            .iter()
            .flat_map(|n| self.get_dependants(n, recursive))
            .collect()
    }

    fn transitive(&self, start: &NodeId, edges: &HashMap<NodeId, Vec<NodeId>>) -> Vec<NodeId> {
        let mut seen: HashSet<NodeId> = HashSet::new();
        let mut stack = vec![start.clone()];
        let mut out = Vec::new();
        while let Some(current) = stack.pop() {
            if let Some(next) = edges.get(&current) {
                for n in next {
                    if seen.insert(n.clone()) {
                        out.push(n.clone());
                        stack.push(n.clone());
                    }
                }
            }
        }
        out
    }

    /// The unique set of modules touched by nodes of the given kinds.
    pub fn modules_for_relations(&self, kinds: &[NodeKind]) -> HashSet<Arc<str>> {
        self.nodes
            .iter()
            .filter(|n| kinds.contains(&n.kind))
            .filter_map(|n| self.module_of.get(n).cloned())
            .collect()
    }

    /// `modules ∪ transitive-dependant-modules` — used for watch-mode fan-out.
    pub fn with_dependant_modules(&self, modules: &HashSet<Arc<str>>) -> HashSet<Arc<str>> {
        let mut result = modules.clone();
        let build_nodes: Vec<NodeId> = modules.iter().map(|m| NodeId::build(m)).collect();
        for node in self.get_dependants_for_many(&build_nodes, true) {
            if let Some(module) = self.module_of.get(&node) {
                result.insert(Arc::clone(module));
            }
        }
        result
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

fn resolve_and_edge(
    dep: &DependencyRef,
    from: &NodeId,
    service_names: &HashMap<Arc<str>, Arc<str>>,
    task_names: &HashMap<Arc<str>, Arc<str>>,
    edge: &mut impl FnMut(NodeId, NodeId),
) -> Result<(), ConfigError> {
    let name = dep.name();
    let resolved = if service_names.contains_key(name) {
        NodeId::new(NodeKind::Service, name)
    } else if task_names.contains_key(name) {
        NodeId::new(NodeKind::Task, name)
    } else {
        return Err(ConfigError::UnknownReference {
            path: format!("{from}.dependencies.{name}"),
        });
    };
    edge(from.clone(), resolved);
    Ok(())
}
