use crate::{*, error::*, pool::*, value::*};
use std::{cell::Cell, collections::HashMap};

pub type NodeId = Id;

// What the evaluator knows about the shape of the data: which names exist, where members are, how wide things are.
// The caching layer treats it as opaque and only memoizes the answers (see EvalCache).
pub trait ModelInfo {
    // A top-level name visible from `base` (e.g. a global, or a variable of the enclosing scope).
    fn resolve_symbol(&self, base: NodeId, name: &str) -> Result<NodeId>;
    // Field of the struct `base`.
    fn resolve_member(&self, base: NodeId, name: &str) -> Result<NodeId>;
    // Size of one value of this node, e.g. the element stride for arrays and lists.
    fn byte_width(&self, node: NodeId) -> Result<usize>;
    fn member_offset(&self, node: NodeId) -> Result<usize>;
    // Declared scalar type and bit width, if the node is a scalar.
    fn scalar_type(&self, node: NodeId) -> Result<Option<(ScalarKind, u32)>>;
}

#[derive(Default)]
pub struct ModelNode {
    pub name: String,
    pub parent: Option<NodeId>,
    pub children: Vec<NodeId>,

    pub size: usize,
    pub offset: usize, // from the start of the parent
    pub scalar: Option<(ScalarKind, u32)>,
    pub is_pointer: bool,
}

#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueryCounts {
    pub symbol: usize,
    pub member: usize,
    pub byte_width: usize,
    pub member_offset: usize,
}

// Simple arena-backed model for hosts that don't have their own. Counts queries, which is how tests check that the
// per-pass caches actually avoid asking twice.
pub struct ModelTree {
    nodes: Pool<ModelNode>,
    root: NodeId,
    queries: Cell<QueryCounts>,
}

impl ModelTree {
    pub fn new() -> Self {
        let mut nodes = Pool::new();
        let root = nodes.add(ModelNode {name: "<root>".to_string(), ..Default::default()}).0;
        Self {nodes, root, queries: Cell::new(QueryCounts::default())}
    }

    pub fn root(&self) -> NodeId { self.root }

    pub fn node(&self, id: NodeId) -> Result<&ModelNode> {
        match self.nodes.try_get(id) {
            Some(n) => Ok(n),
            None => err!(Internal, "stale model node id {:?}", id),
        }
    }

    pub fn add(&mut self, parent: NodeId, mut node: ModelNode) -> Result<NodeId> {
        self.node(parent)?;
        node.parent = Some(parent);
        let id = self.nodes.add(node).0;
        self.nodes.try_get_mut(parent).unwrap().children.push(id);
        Ok(id)
    }

    pub fn add_scalar(&mut self, parent: NodeId, name: &str, offset: usize, size: usize, kind: ScalarKind) -> Result<NodeId> {
        self.add(parent, ModelNode {name: name.to_string(), offset, size, scalar: Some((kind, (size * 8) as u32)), ..Default::default()})
    }

    pub fn add_struct(&mut self, parent: NodeId, name: &str, offset: usize, size: usize) -> Result<NodeId> {
        self.add(parent, ModelNode {name: name.to_string(), offset, size, ..Default::default()})
    }

    // Removes the node and its subtree. Ids of removed nodes never come back, so caches keyed by them can't alias new nodes.
    pub fn remove(&mut self, id: NodeId) -> Result<()> {
        if id == self.root {
            return err!(Usage, "can't remove model root");
        }
        let node = match self.nodes.remove(id) {
            Some(n) => n,
            None => return err!(Internal, "stale model node id {:?}", id),
        };
        if let Some(p) = node.parent.and_then(|p| self.nodes.try_get_mut(p)) {
            p.children.retain(|c| *c != id);
        }
        let mut stack = node.children;
        while let Some(c) = stack.pop() {
            if let Some(n) = self.nodes.remove(c) {
                stack.extend(n.children);
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize { self.nodes.len() }

    pub fn queries(&self) -> QueryCounts { self.queries.get() }

    fn count(&self, f: impl FnOnce(&mut QueryCounts)) {
        let mut q = self.queries.get();
        f(&mut q);
        self.queries.set(q);
    }

    fn find_child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        let p = self.nodes.try_get(parent)?;
        p.children.iter().copied().find(|c| self.nodes.try_get(*c).map_or(false, |n| n.name == name))
    }
}

impl ModelInfo for ModelTree {
    // Looks in `base`, then in its ancestors, like lexical scopes.
    fn resolve_symbol(&self, base: NodeId, name: &str) -> Result<NodeId> {
        self.count(|q| q.symbol += 1);
        let mut cur = Some(base);
        while let Some(id) = cur {
            if let Some(c) = self.find_child(id, name) {
                return Ok(c);
            }
            cur = self.node(id)?.parent;
        }
        err!(NoVariable, "no variable '{}'", name)
    }

    fn resolve_member(&self, base: NodeId, name: &str) -> Result<NodeId> {
        self.count(|q| q.member += 1);
        let node = self.node(base)?;
        if node.scalar.is_some() {
            return err!(TypeMismatch, "'{}' is not a struct", node.name);
        }
        match self.find_child(base, name) {
            Some(c) => Ok(c),
            None => err!(NoVariable, "no field '{}' in '{}'", name, node.name),
        }
    }

    fn byte_width(&self, node: NodeId) -> Result<usize> {
        self.count(|q| q.byte_width += 1);
        let n = self.node(node)?;
        Ok(if n.is_pointer { 8 } else { n.size })
    }

    fn member_offset(&self, node: NodeId) -> Result<usize> {
        self.count(|q| q.member_offset += 1);
        Ok(self.node(node)?.offset)
    }

    fn scalar_type(&self, node: NodeId) -> Result<Option<(ScalarKind, u32)>> {
        let n = self.node(node)?;
        Ok(if n.is_pointer { Some((ScalarKind::Unsigned, 64)) } else { n.scalar })
    }
}
