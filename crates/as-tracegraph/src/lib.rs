//! Directed graph over operations. A node is an *ingress* exactly when it has
//! no real in-edges, modeling a pseudo-root without materialising a synthetic
//! root node.

use as_types::Operation;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;

pub type NodeId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceGraphError {
    AlreadyExists(Operation),
    NotFound(Operation),
}

impl fmt::Display for TraceGraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyExists(op) => write!(f, "operation {op} already present in trace graph"),
            Self::NotFound(op) => write!(f, "operation {op} not found in trace graph"),
        }
    }
}

impl Error for TraceGraphError {}

struct Node {
    op: Operation,
    in_real: HashSet<NodeId>,
    out: HashSet<NodeId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TraceNode {
    pub name: String,
    pub children: Vec<TraceNode>,
}

struct Inner {
    arena: Vec<Option<Node>>,
    free: Vec<NodeId>,
    index: HashMap<Operation, NodeId>,
}

impl Inner {
    fn new() -> Self {
        Self {
            arena: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
        }
    }

    fn node(&self, id: NodeId) -> &Node {
        self.arena[id].as_ref().expect("dangling trace graph node id")
    }

    fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.arena[id].as_mut().expect("dangling trace graph node id")
    }

    fn add(&mut self, op: Operation) -> Result<NodeId, TraceGraphError> {
        if self.index.contains_key(&op) {
            return Err(TraceGraphError::AlreadyExists(op));
        }
        let node = Node {
            op: op.clone(),
            in_real: HashSet::new(),
            out: HashSet::new(),
        };
        let id = if let Some(id) = self.free.pop() {
            self.arena[id] = Some(node);
            id
        } else {
            self.arena.push(Some(node));
            self.arena.len() - 1
        };
        self.index.insert(op, id);
        Ok(id)
    }

    fn remove(&mut self, op: &Operation) -> Result<(), TraceGraphError> {
        let id = self
            .index
            .remove(op)
            .ok_or_else(|| TraceGraphError::NotFound(op.clone()))?;
        let (in_real, out) = {
            let node = self.node(id);
            (node.in_real.clone(), node.out.clone())
        };
        for pred in in_real {
            self.node_mut(pred).out.remove(&id);
        }
        for succ in out {
            self.node_mut(succ).in_real.remove(&id);
        }
        self.arena[id] = None;
        self.free.push(id);
        Ok(())
    }

    fn lookup(&self, op: &Operation) -> Result<NodeId, TraceGraphError> {
        self.index.get(op).copied().ok_or_else(|| TraceGraphError::NotFound(op.clone()))
    }

    fn add_relation(&mut self, from: &Operation, to: &Operation) -> Result<(), TraceGraphError> {
        let from_id = self.lookup(from)?;
        let to_id = self.lookup(to)?;
        self.node_mut(from_id).out.insert(to_id);
        self.node_mut(to_id).in_real.insert(from_id);
        Ok(())
    }

    fn remove_relation(&mut self, from: &Operation, to: &Operation) -> Result<(), TraceGraphError> {
        let from_id = self.lookup(from)?;
        let to_id = self.lookup(to)?;
        self.node_mut(from_id).out.remove(&to_id);
        self.node_mut(to_id).in_real.remove(&from_id);
        Ok(())
    }

    fn is_ingress(&self, op: &Operation) -> Result<bool, TraceGraphError> {
        let id = self.lookup(op)?;
        Ok(self.node(id).in_real.is_empty())
    }

    fn get_ingresses(&self, op: &Operation) -> Result<Vec<Operation>, TraceGraphError> {
        let start = self.lookup(op)?;
        let mut visited = HashSet::new();
        let mut stack = vec![start];
        let mut ingresses = Vec::new();
        visited.insert(start);
        while let Some(id) = stack.pop() {
            let node = self.node(id);
            if node.in_real.is_empty() {
                ingresses.push(node.op.clone());
                continue;
            }
            for &pred in &node.in_real {
                if !visited.insert(pred) {
                    tracing::warn!(operation = %node.op, "cycle detected while walking trace graph in-edges");
                    continue;
                }
                stack.push(pred);
            }
        }
        Ok(ingresses)
    }

    fn forward_tree(&self, id: NodeId, visited: &mut HashSet<NodeId>) -> TraceNode {
        let node = self.node(id);
        let name = format!("{}:{}", node.op.service(), node.op.name());
        if !visited.insert(id) {
            return TraceNode { name, children: Vec::new() };
        }
        let children = node
            .out
            .iter()
            .map(|&child| self.forward_tree(child, visited))
            .collect();
        TraceNode { name, children }
    }

    fn dependencies(&self, op: &Operation) -> Result<Vec<TraceNode>, TraceGraphError> {
        let ingresses = self.get_ingresses(op)?;
        Ok(ingresses
            .iter()
            .map(|ing| {
                let id = self.index[ing];
                let mut visited = HashSet::new();
                self.forward_tree(id, &mut visited)
            })
            .collect())
    }

    fn services(&self) -> Vec<String> {
        let mut set: HashSet<&str> = HashSet::new();
        for slot in self.arena.iter().flatten() {
            set.insert(slot.op.service());
        }
        let mut v: Vec<String> = set.into_iter().map(str::to_string).collect();
        v.sort();
        v
    }

    fn operations(&self, service: &str) -> Vec<Operation> {
        let mut v: Vec<Operation> = self
            .arena
            .iter()
            .flatten()
            .filter(|n| n.op.service() == service)
            .map(|n| n.op.clone())
            .collect();
        v.sort();
        v
    }
}

/// Trace graph guarded by an RW lock: reads run concurrently, mutations are exclusive.
pub struct TraceGraph {
    inner: RwLock<Inner>,
}

impl Default for TraceGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceGraph {
    pub fn new() -> Self {
        Self { inner: RwLock::new(Inner::new()) }
    }

    pub fn add(&self, op: Operation) -> Result<(), TraceGraphError> {
        self.inner.write().add(op).map(|_| ())
    }

    pub fn remove(&self, op: &Operation) -> Result<(), TraceGraphError> {
        self.inner.write().remove(op)
    }

    pub fn add_relation(&self, from: &Operation, to: &Operation) -> Result<(), TraceGraphError> {
        self.inner.write().add_relation(from, to)
    }

    pub fn remove_relation(&self, from: &Operation, to: &Operation) -> Result<(), TraceGraphError> {
        self.inner.write().remove_relation(from, to)
    }

    pub fn contains(&self, op: &Operation) -> bool {
        self.inner.read().index.contains_key(op)
    }

    pub fn is_ingress(&self, op: &Operation) -> Result<bool, TraceGraphError> {
        self.inner.read().is_ingress(op)
    }

    pub fn get_ingresses(&self, op: &Operation) -> Result<Vec<Operation>, TraceGraphError> {
        self.inner.read().get_ingresses(op)
    }

    pub fn dependencies(&self, op: &Operation) -> Result<Vec<TraceNode>, TraceGraphError> {
        self.inner.read().dependencies(op)
    }

    pub fn services(&self) -> Vec<String> {
        self.inner.read().services()
    }

    pub fn operations(&self, service: &str) -> Vec<Operation> {
        self.inner.read().operations(service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(s: &str, n: &str) -> Operation {
        Operation::new(s, n).unwrap()
    }

    #[test]
    fn fresh_node_is_ingress() {
        let tg = TraceGraph::new();
        let a = op("web", "index");
        tg.add(a.clone()).unwrap();
        assert!(tg.is_ingress(&a).unwrap());
    }

    #[test]
    fn relation_reclassifies_callee_as_internal() {
        let tg = TraceGraph::new();
        let a = op("web", "a");
        let b = op("web", "b");
        tg.add(a.clone()).unwrap();
        tg.add(b.clone()).unwrap();
        tg.add_relation(&a, &b).unwrap();
        assert!(tg.is_ingress(&a).unwrap());
        assert!(!tg.is_ingress(&b).unwrap());
        assert_eq!(tg.get_ingresses(&b).unwrap(), vec![a.clone()]);

        tg.remove_relation(&a, &b).unwrap();
        assert!(tg.is_ingress(&b).unwrap());
    }

    #[test]
    fn add_remove_round_trips() {
        let tg = TraceGraph::new();
        let a = op("svc", "a");
        tg.add(a.clone()).unwrap();
        tg.remove(&a).unwrap();
        assert!(!tg.contains(&a));
        assert_eq!(tg.remove(&a), Err(TraceGraphError::NotFound(a)));
    }

    #[test]
    fn cyclic_graph_does_not_hang_get_ingresses() {
        let tg = TraceGraph::new();
        let a = op("svc", "a");
        let b = op("svc", "b");
        tg.add(a.clone()).unwrap();
        tg.add(b.clone()).unwrap();
        tg.add_relation(&a, &b).unwrap();
        tg.add_relation(&b, &a).unwrap();
        // both are internal now (each has a real in-edge), so no ingress is found.
        let ingresses = tg.get_ingresses(&b).unwrap();
        assert!(ingresses.is_empty());
    }

    #[test]
    fn dependencies_builds_forward_tree_from_ingress() {
        let tg = TraceGraph::new();
        let a = op("web", "a");
        let b = op("web", "b");
        let c = op("web", "c");
        for o in [&a, &b, &c] {
            tg.add(o.clone()).unwrap();
        }
        tg.add_relation(&a, &b).unwrap();
        tg.add_relation(&b, &c).unwrap();
        let deps = tg.dependencies(&c).unwrap();
        assert_eq!(deps.len(), 1);
        assert_eq!(deps[0].name, "web:a");
        assert_eq!(deps[0].children[0].name, "web:b");
        assert_eq!(deps[0].children[0].children[0].name, "web:c");
    }
}
