use crate::dist::IntegerDistribution;
use crate::model::Species;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const ROOT_ID: &str = "ROOT";

/// One infected individual as recorded in the transmission tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeNode {
    pub id: String,
    /// `None` only for the synthetic root.
    pub species: Option<Species>,
    pub unit_id: String,
    pub snps: BTreeSet<u32>,
    pub infection_date: Option<i32>,
    pub detection_date: Option<i32>,
}

impl TreeNode {
    pub fn root() -> Self {
        Self {
            id: ROOT_ID.to_string(),
            species: None,
            unit_id: String::new(),
            snps: BTreeSet::new(),
            infection_date: None,
            detection_date: None,
        }
    }

    pub fn is_root(&self) -> bool {
        self.species.is_none()
    }

    /// Size of the symmetric difference of the two SNP sets.
    pub fn snp_distance(&self, other: &TreeNode) -> u32 {
        self.snps.symmetric_difference(&other.snps).count() as u32
    }
}

/// Who-infected-whom forest hanging from a synthetic root.
///
/// Nodes live in an arena; removed nodes keep their slot so indices stay
/// valid, and their children are handed to the nearest surviving ancestor.
#[derive(Debug, Clone)]
pub struct TransmissionTree {
    nodes: Vec<TreeNode>,
    parents: Vec<Option<usize>>,
    children: Vec<Vec<usize>>,
    removed: Vec<bool>,
    index: BTreeMap<String, usize>,
}

/// Flat node and edge listing of a tree, ready for export.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TreeReport {
    pub nodes: Vec<TreeNode>,
    pub edges: Vec<(String, String)>,
}

impl Default for TransmissionTree {
    fn default() -> Self {
        Self::new()
    }
}

impl TransmissionTree {
    pub fn new() -> Self {
        let root = TreeNode::root();
        Self {
            index: BTreeMap::from([(root.id.clone(), 0)]),
            nodes: vec![root],
            parents: vec![None],
            children: vec![Vec::new()],
            removed: vec![false],
        }
    }

    /// Number of surviving nodes, root included.
    pub fn len(&self) -> usize {
        self.removed.iter().filter(|&&r| !r).count()
    }

    #[cfg(test)]
    pub fn node(&self, id: &str) -> Option<&TreeNode> {
        self.index
            .get(id)
            .filter(|&&idx| !self.removed[idx])
            .map(|&idx| &self.nodes[idx])
    }

    #[cfg(test)]
    pub fn parent_of(&self, id: &str) -> Option<&TreeNode> {
        let &idx = self.index.get(id)?;
        if self.removed[idx] {
            return None;
        }
        self.parents[idx].map(|p| &self.nodes[p])
    }

    /// Surviving nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &TreeNode> {
        self.nodes
            .iter()
            .zip(&self.removed)
            .filter(|&(_, &removed)| !removed)
            .map(|(node, _)| node)
    }

    pub fn add_child(&mut self, parent_id: &str, node: TreeNode) -> Result<()> {
        let &parent = self
            .index
            .get(parent_id)
            .filter(|&&idx| !self.removed[idx])
            .with_context(|| format!("no tree node for infector {parent_id}"))?;
        if self.index.contains_key(&node.id) {
            bail!("tree already holds a node for {}", node.id);
        }

        let idx = self.nodes.len();
        self.index.insert(node.id.clone(), idx);
        self.nodes.push(node);
        self.parents.push(Some(parent));
        self.children.push(Vec::new());
        self.removed.push(false);
        self.children[parent].push(idx);
        Ok(())
    }

    pub fn set_detection_date(&mut self, id: &str, date: i32) -> Result<()> {
        let &idx = self
            .index
            .get(id)
            .with_context(|| format!("no tree node for {id}"))?;
        self.nodes[idx].detection_date = Some(date);
        Ok(())
    }

    fn remove(&mut self, idx: usize) {
        let parent = self.parents[idx];
        let children = std::mem::take(&mut self.children[idx]);
        for &child in &children {
            self.parents[child] = parent;
        }
        if let Some(parent) = parent {
            self.children[parent].retain(|&c| c != idx);
            self.children[parent].extend(children);
        }
        self.parents[idx] = None;
        self.removed[idx] = true;
    }

    /// Copy of the tree keeping the root and every node `keep` accepts.
    ///
    /// `keep` is asked once per non-root node, in insertion order.
    pub fn pruned<F: FnMut(&TreeNode) -> bool>(&self, mut keep: F) -> TransmissionTree {
        let mut observed = self.clone();
        for idx in 1..observed.nodes.len() {
            if observed.removed[idx] || observed.nodes[idx].is_root() {
                continue;
            }
            if !keep(&observed.nodes[idx]) {
                observed.remove(idx);
            }
        }
        observed
    }

    pub fn edges(&self) -> Vec<(String, String)> {
        let mut edges = Vec::new();
        for (idx, children) in self.children.iter().enumerate() {
            if self.removed[idx] {
                continue;
            }
            for &child in children {
                edges.push((self.nodes[idx].id.clone(), self.nodes[child].id.clone()));
            }
        }
        edges
    }

    /// Distribution of SNP distances over all unordered pairs of surviving nodes.
    pub fn pairwise_distances(&self) -> IntegerDistribution {
        let nodes: Vec<&TreeNode> = self.nodes().collect();
        let mut dist = IntegerDistribution::new();
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                dist.add_count(a.snp_distance(b), 1);
            }
        }
        dist
    }

    pub fn report(&self) -> TreeReport {
        TreeReport {
            nodes: self.nodes().cloned().collect(),
            edges: self.edges(),
        }
    }
}
