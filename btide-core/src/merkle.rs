//! Merkle verification tree over a manifest's chunk hashes.
//!
//! Shape is fixed by recursive midpoint split: for leaves `[start, end]`,
//! `mid = (start + end) / 2`, left covers `[start, mid]`, right `[mid + 1, end]`.
//! Internal hashes are SHA-256 of the children's hex strings concatenated, so
//! any change to the split rule changes every ancestor hash.

use std::collections::VecDeque;

use crate::integrity;
use crate::manifest::{Chunk, Manifest};

/// A node of the tree. Leaves map 1:1 to chunks, left to right.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleNode {
    hash: String,
    expected: Option<String>,
    kind: NodeKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    Leaf {
        chunk: usize,
    },
    Internal {
        left: Box<MerkleNode>,
        right: Box<MerkleNode>,
    },
}

impl MerkleNode {
    fn leaf(chunk: usize, c: &Chunk) -> Self {
        Self {
            hash: c.hash.clone(),
            expected: None,
            kind: NodeKind::Leaf { chunk },
        }
    }

    fn internal(left: MerkleNode, right: MerkleNode) -> Self {
        Self {
            hash: integrity::combine_hex(&left.hash, &right.hash),
            expected: None,
            kind: NodeKind::Internal {
                left: Box::new(left),
                right: Box::new(right),
            },
        }
    }

    /// Computed hash of this node.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    /// Expected hash from the manifest's `hashes:` section, if one was attached.
    pub fn expected_hash(&self) -> Option<&str> {
        self.expected.as_deref()
    }

    pub fn kind(&self) -> &NodeKind {
        &self.kind
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.kind, NodeKind::Leaf { .. })
    }

    /// Chunk index for a leaf; `None` for internal nodes.
    pub fn chunk_index(&self) -> Option<usize> {
        match self.kind {
            NodeKind::Leaf { chunk } => Some(chunk),
            NodeKind::Internal { .. } => None,
        }
    }

    pub fn children(&self) -> Option<(&MerkleNode, &MerkleNode)> {
        match &self.kind {
            NodeKind::Leaf { .. } => None,
            NodeKind::Internal { left, right } => Some((left, right)),
        }
    }

    /// Leaves under this node (or the node itself), in chunk order.
    pub fn leaves(&self) -> Leaves<'_> {
        Leaves { stack: vec![self] }
    }

    /// Hashes of the leaves under this node, in chunk order. Lazy; call again to restart.
    pub fn leaf_hashes(&self) -> impl Iterator<Item = &str> + Clone {
        self.leaves().map(MerkleNode::hash)
    }

    fn find(&self, hash: &str) -> Option<&MerkleNode> {
        if self.hash == hash {
            return Some(self);
        }
        let (left, right) = self.children()?;
        left.find(hash).or_else(|| right.find(hash))
    }

    fn collect_in_order<'a>(&'a self, out: &mut Vec<&'a MerkleNode>) {
        match &self.kind {
            NodeKind::Leaf { .. } => out.push(self),
            NodeKind::Internal { left, right } => {
                left.collect_in_order(out);
                out.push(self);
                right.collect_in_order(out);
            }
        }
    }
}

/// Depth-first leaf iterator with an explicit stack.
#[derive(Debug, Clone)]
pub struct Leaves<'a> {
    stack: Vec<&'a MerkleNode>,
}

impl<'a> Iterator for Leaves<'a> {
    type Item = &'a MerkleNode;

    fn next(&mut self) -> Option<&'a MerkleNode> {
        while let Some(node) = self.stack.pop() {
            match &node.kind {
                NodeKind::Leaf { .. } => return Some(node),
                NodeKind::Internal { left, right } => {
                    self.stack.push(right);
                    self.stack.push(left);
                }
            }
        }
        None
    }
}

/// Tree built from an ordered, non-empty chunk sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    root: MerkleNode,
    leaf_count: usize,
}

impl MerkleTree {
    /// Build from chunks in file order. `None` if there are no chunks.
    pub fn build(chunks: &[Chunk]) -> Option<Self> {
        if chunks.is_empty() {
            return None;
        }
        Some(Self {
            root: build_range(chunks, 0, chunks.len() - 1),
            leaf_count: chunks.len(),
        })
    }

    /// Build the tree for a manifest and attach its `hashes:` list as expected
    /// internal hashes when the count lines up.
    pub fn from_manifest(manifest: &Manifest) -> Self {
        let root = build_range(manifest.chunks(), 0, manifest.chunks().len() - 1);
        let mut tree = Self {
            root,
            leaf_count: manifest.chunks().len(),
        };
        if !manifest.hashes().is_empty() && !tree.attach_expected(manifest.hashes()) {
            tracing::warn!(
                ident = manifest.ident(),
                declared = manifest.hashes().len(),
                internal = tree.internal_count(),
                "internal hash list does not match tree shape; ignoring it"
            );
        }
        tree
    }

    pub fn root(&self) -> &MerkleNode {
        &self.root
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_count
    }

    /// Number of internal nodes (always `leaf_count - 1`).
    pub fn internal_count(&self) -> usize {
        self.leaf_count - 1
    }

    /// First node (pre-order) whose computed hash equals `hash`.
    pub fn find_node(&self, hash: &str) -> Option<&MerkleNode> {
        self.root.find(hash)
    }

    /// First leaf whose hash equals `hash`.
    pub fn find_leaf(&self, hash: &str) -> Option<&MerkleNode> {
        self.root.leaves().find(|n| n.hash == hash)
    }

    /// Every node, in order: left subtree, node, right subtree.
    pub fn nodes_in_order(&self) -> Vec<&MerkleNode> {
        let mut out = Vec::with_capacity(2 * self.leaf_count - 1);
        self.root.collect_in_order(&mut out);
        out
    }

    /// Attach expected hashes to internal nodes in level order (root first).
    /// Returns `false` and attaches nothing if the count does not match.
    pub fn attach_expected(&mut self, hashes: &[String]) -> bool {
        if hashes.len() != self.internal_count() {
            return false;
        }
        let mut expected = hashes.iter();
        let mut queue: VecDeque<&mut MerkleNode> = VecDeque::from([&mut self.root]);
        while let Some(node) = queue.pop_front() {
            if let NodeKind::Internal { left, right } = &mut node.kind {
                node.expected = expected.next().cloned();
                queue.push_back(left);
                queue.push_back(right);
            }
        }
        true
    }

    /// Nodes whose attached expected hash differs from the computed one.
    pub fn mismatched_nodes(&self) -> Vec<&MerkleNode> {
        self.nodes_in_order()
            .into_iter()
            .filter(|n| n.expected.as_ref().is_some_and(|e| *e != n.hash))
            .collect()
    }
}

fn build_range(chunks: &[Chunk], start: usize, end: usize) -> MerkleNode {
    if start == end {
        return MerkleNode::leaf(start, &chunks[start]);
    }
    let mid = (start + end) / 2;
    let left = build_range(chunks, start, mid);
    let right = build_range(chunks, mid + 1, end);
    MerkleNode::internal(left, right)
}
