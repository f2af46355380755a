use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;

use parking_lot::RwLock;

use crate::commit::Node;
use crate::crypto::NodeId;
use crate::error::{RefConflict, StorageError};

/// Read access to nodes, either stored or about to be stored
pub trait NodeLookup {
    fn lookup(&self, id: &NodeId) -> Option<Arc<Node>>;

    /// Distance from the initial node along first parents
    fn lookup_depth(&self, id: &NodeId) -> Option<u64>;

    /// Does `node` equal `ancestor` or reach it through first parents?
    fn descends_from(&self, node: &NodeId, ancestor: &NodeId) -> bool {
        let Some(target_depth) = self.lookup_depth(ancestor) else {
            return false;
        };

        let mut current = *node;
        while current != *ancestor {
            match self.lookup_depth(&current) {
                Some(depth) if depth > target_depth => {}
                _ => return false,
            }

            let Some(parent) = self
                .lookup(&current)
                .and_then(|n| n.get_parent_ids().first().copied())
            else {
                return false;
            };
            current = parent;
        }

        true
    }
}

/// The commit-graph storage this ledger runs on
///
/// Nodes are append-only and content-addressed. Refs are the only mutable part.
pub trait CommitGraph: Send + Sync {
    /// Stores a node; storing the same node twice is a no-op
    fn create_node(&self, node: Node) -> Result<NodeId, StorageError>;

    fn get_node(&self, id: &NodeId) -> Option<Arc<Node>>;

    /// Memoized depth of a stored node
    fn depth(&self, id: &NodeId) -> Option<u64>;

    /// Compare-and-swap on a ref; `new = None` deletes it
    fn update_ref(
        &self,
        name: &str,
        old: Option<NodeId>,
        new: Option<NodeId>,
    ) -> Result<(), RefConflict>;

    fn locate_ref(&self, name: &str) -> Option<NodeId>;

    /// Creates the ref `name` on `target` with a message attached, like an annotated git tag
    ///
    /// Fails if a ref of that name already exists.
    fn create_tag(&self, name: &str, target: NodeId, message: String) -> Result<(), RefConflict>;

    /// Message of a tag created through [`CommitGraph::create_tag`]
    fn get_tag_message(&self, name: &str) -> Option<String>;

    /// Names of all refs starting with `prefix`, sorted
    fn list_refs(&self, prefix: &str) -> Vec<String>;

    fn list_children(&self, id: &NodeId) -> Vec<NodeId>;

    fn has_node(&self, id: &NodeId) -> bool {
        self.get_node(id).is_some()
    }

    /// Refs pointing directly at `id`
    fn refs_at(&self, id: &NodeId) -> Vec<String> {
        self.list_refs("")
            .into_iter()
            .filter(|name| self.locate_ref(name).as_ref() == Some(id))
            .collect()
    }

    /// Ancestors of `id`, the direct parent first
    ///
    /// Fails on merge nodes.
    fn list_ancestors(&self, id: &NodeId, max: Option<usize>) -> Result<Vec<NodeId>, StorageError> {
        let mut result = vec![];
        let mut current = self.get_node(id).ok_or_else(|| StorageError::InvalidRepository {
            reason: format!("node {id} does not exist"),
        })?;

        while max.map_or(true, |max| result.len() < max) {
            let parent = match current.get_parent_ids() {
                [] => break,
                [parent] => *parent,
                _ => {
                    return Err(StorageError::InvalidRepository {
                        reason: format!("{} is a merge node", current.get_identifier()),
                    });
                }
            };

            result.push(parent);
            current = self
                .get_node(&parent)
                .ok_or(StorageError::MissingParent {
                    node: *current.get_identifier(),
                    parent,
                })?;
        }

        Ok(result)
    }

    /// Is `ancestor` reachable from `descendant` (or equal to it)?
    fn is_ancestor(&self, ancestor: &NodeId, descendant: &NodeId) -> bool {
        self.descends_from(descendant, ancestor)
    }

    /// Closest common ancestor of both nodes along first parents
    fn find_merge_base(&self, first: &NodeId, second: &NodeId) -> Option<NodeId> {
        let mut a = *first;
        let mut b = *second;

        loop {
            if a == b {
                return Some(a);
            }

            let depth_a = self.depth(&a)?;
            let depth_b = self.depth(&b)?;

            if depth_a >= depth_b {
                a = *self.get_node(&a)?.get_parent_ids().first()?;
            } else {
                b = *self.get_node(&b)?.get_parent_ids().first()?;
            }
        }
    }

    /// The parentless node every other node descends from
    fn initial_node(&self, from: &NodeId) -> Option<NodeId> {
        let mut current = self.get_node(from)?;
        while let Some(parent) = current.get_parent_ids().first() {
            current = self.get_node(parent)?;
        }
        Some(*current.get_identifier())
    }
}

impl<G: CommitGraph + ?Sized> NodeLookup for G {
    fn lookup(&self, id: &NodeId) -> Option<Arc<Node>> {
        self.get_node(id)
    }

    fn lookup_depth(&self, id: &NodeId) -> Option<u64> {
        self.depth(id)
    }
}

struct StoredNode {
    node: Arc<Node>,
    depth: u64,
}

/// An in-memory commit graph
///
/// Nodes live in a concurrent arena keyed by digest. The ref table sits behind
/// a lock so compare-and-swap updates are atomic.
#[derive(Default)]
pub struct MemoryGraph {
    nodes: DashMap<NodeId, StoredNode>,
    children: DashMap<NodeId, HashSet<NodeId>>,
    refs: RwLock<BTreeMap<String, NodeId>>,
    /// Only written while holding the `refs` lock
    tag_messages: DashMap<String, String>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }
}

impl CommitGraph for MemoryGraph {
    fn create_node(&self, node: Node) -> Result<NodeId, StorageError> {
        let identifier = *node.get_identifier();

        if self.nodes.contains_key(&identifier) {
            log::trace!("Node {identifier:?} already exists");
            return Ok(identifier);
        }

        let mut depth = 0;
        for (idx, parent) in node.get_parent_ids().iter().enumerate() {
            let Some(stored) = self.nodes.get(parent) else {
                return Err(StorageError::MissingParent {
                    node: identifier,
                    parent: *parent,
                });
            };

            if idx == 0 {
                depth = stored.depth + 1;
            }
        }

        for parent in node.get_parent_ids() {
            self.children.entry(*parent).or_default().insert(identifier);
        }

        self.nodes.entry(identifier).or_insert(StoredNode {
            node: Arc::new(node),
            depth,
        });

        Ok(identifier)
    }

    fn get_node(&self, id: &NodeId) -> Option<Arc<Node>> {
        self.nodes.get(id).map(|entry| entry.node.clone())
    }

    fn depth(&self, id: &NodeId) -> Option<u64> {
        self.nodes.get(id).map(|entry| entry.depth)
    }

    fn update_ref(
        &self,
        name: &str,
        old: Option<NodeId>,
        new: Option<NodeId>,
    ) -> Result<(), RefConflict> {
        let mut refs = self.refs.write();
        let found = refs.get(name).copied();

        if found != old {
            return Err(RefConflict {
                name: name.to_string(),
                expected: old,
                found,
            });
        }

        match new {
            Some(target) => {
                refs.insert(name.to_string(), target);
            }
            None => {
                refs.remove(name);
                self.tag_messages.remove(name);
            }
        }

        Ok(())
    }

    fn locate_ref(&self, name: &str) -> Option<NodeId> {
        self.refs.read().get(name).copied()
    }

    fn create_tag(&self, name: &str, target: NodeId, message: String) -> Result<(), RefConflict> {
        let mut refs = self.refs.write();

        if let Some(found) = refs.get(name) {
            return Err(RefConflict {
                name: name.to_string(),
                expected: None,
                found: Some(*found),
            });
        }

        refs.insert(name.to_string(), target);
        self.tag_messages.insert(name.to_string(), message);

        Ok(())
    }

    fn get_tag_message(&self, name: &str) -> Option<String> {
        self.tag_messages.get(name).map(|entry| entry.clone())
    }

    fn list_refs(&self, prefix: &str) -> Vec<String> {
        self.refs
            .read()
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect()
    }

    fn list_children(&self, id: &NodeId) -> Vec<NodeId> {
        let mut children: Vec<NodeId> = self
            .children
            .get(id)
            .map(|entry| entry.iter().copied().collect())
            .unwrap_or_default();
        children.sort();
        children
    }

    fn refs_at(&self, id: &NodeId) -> Vec<String> {
        self.refs
            .read()
            .iter()
            .filter(|(_, target)| *target == id)
            .map(|(name, _)| name.clone())
            .collect()
    }
}

/// Nodes of a pending push layered over the stored graph
///
/// Lets a proposed chain be validated before anything is persisted.
pub struct Overlay<'a, L: NodeLookup + ?Sized> {
    base: &'a L,
    pending: HashMap<NodeId, (Arc<Node>, u64)>,
    order: Vec<NodeId>,
}

impl<'a, L: NodeLookup + ?Sized> Overlay<'a, L> {
    /// Layers `chain` (parents before children) over `base`
    ///
    /// Returns the first node whose parent is found in neither.
    pub fn new(base: &'a L, chain: Vec<Node>) -> Result<Self, (NodeId, NodeId)> {
        let mut overlay = Self {
            base,
            pending: HashMap::new(),
            order: vec![],
        };

        for node in chain {
            let identifier = *node.get_identifier();
            let mut depth = 0;

            for (idx, parent) in node.get_parent_ids().iter().enumerate() {
                let Some(parent_depth) = overlay.lookup_depth(parent) else {
                    return Err((identifier, *parent));
                };
                if idx == 0 {
                    depth = parent_depth + 1;
                }
            }

            if overlay.pending.contains_key(&identifier) || base.lookup(&identifier).is_some() {
                continue;
            }

            overlay
                .pending
                .insert(identifier, (Arc::new(node), depth));
            overlay.order.push(identifier);
        }

        Ok(overlay)
    }

    /// Nodes not yet stored, parents first
    pub fn new_nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.order
            .iter()
            .filter_map(|id| self.pending.get(id).map(|(node, _)| node))
    }

    pub fn is_pending(&self, id: &NodeId) -> bool {
        self.pending.contains_key(id)
    }
}

impl<L: NodeLookup + ?Sized> NodeLookup for Overlay<'_, L> {
    fn lookup(&self, id: &NodeId) -> Option<Arc<Node>> {
        match self.pending.get(id) {
            Some((node, _)) => Some(node.clone()),
            None => self.base.lookup(id),
        }
    }

    fn lookup_depth(&self, id: &NodeId) -> Option<u64> {
        match self.pending.get(id) {
            Some((_, depth)) => Some(*depth),
            None => self.base.lookup_depth(id),
        }
    }
}
