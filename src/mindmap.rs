//! Mind-map tree, arena-backed.
//!
//! Nodes live in a single vector and are addressed by stable ids, so
//! expanding one branch never moves or clones the rest of the tree. The map
//! is memory-resident for the session; nothing is persisted.

use crate::genai::RawNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u32);

#[derive(Debug, Clone)]
pub struct Node {
    pub label: String,
    pub description: Option<String>,
    pub children: Vec<NodeId>,
    pub expanded: bool,
    pub loading: bool,
    parent: Option<NodeId>,
}

pub struct MindMap {
    nodes: Vec<Node>,
    root: NodeId,
}

impl MindMap {
    pub fn new(root_label: impl Into<String>) -> Self {
        let root = Node {
            label: root_label.into(),
            description: None,
            children: Vec::new(),
            expanded: true,
            loading: false,
            parent: None,
        };
        Self {
            nodes: vec![root],
            root: NodeId(0),
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn get(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0 as usize)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Graft generated children (and their pre-generated grandchildren)
    /// under `parent`. Returns the ids of the direct children added.
    pub fn insert_children(&mut self, parent: NodeId, raw: &[RawNode]) -> Vec<NodeId> {
        let mut added = Vec::with_capacity(raw.len());
        for node in raw {
            let id = self.push(parent, node);
            added.push(id);
        }
        if let Some(node) = self.nodes.get_mut(parent.0 as usize) {
            node.expanded = true;
            node.loading = false;
        }
        added
    }

    fn push(&mut self, parent: NodeId, raw: &RawNode) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            label: raw.label.clone(),
            description: raw.description.clone(),
            children: Vec::new(),
            expanded: false,
            loading: false,
            parent: Some(parent),
        });
        self.nodes[parent.0 as usize].children.push(id);

        for child in raw.children.as_deref().unwrap_or_default() {
            self.push(id, child);
        }
        id
    }

    pub fn toggle_expanded(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.get_mut(id.0 as usize) {
            node.expanded = !node.expanded;
        }
    }

    pub fn set_loading(&mut self, id: NodeId, loading: bool) {
        if let Some(node) = self.nodes.get_mut(id.0 as usize) {
            node.loading = loading;
        }
    }

    /// Labels from the root down to (and including) `id`; the context
    /// string handed to the expansion prompt.
    pub fn path(&self, id: NodeId) -> Vec<&str> {
        let mut labels = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let node = &self.nodes[current.0 as usize];
            labels.push(node.label.as_str());
            cursor = node.parent;
        }
        labels.reverse();
        labels
    }
}
