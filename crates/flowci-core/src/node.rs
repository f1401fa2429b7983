use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::types::EnvMap;

/// Separator between segments of a node path (`flow/step`).
pub const PATH_SEPARATOR: char = '/';

/// The root segment of a hierarchical node path.
pub fn root_path(path: &str) -> &str {
    let trimmed = path.trim_matches(PATH_SEPARATOR);
    trimmed.split(PATH_SEPARATOR).next().unwrap_or(trimmed)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Container; runs by running its first runnable child.
    Flow,
    /// Executable leaf carrying a shell script.
    #[default]
    Step,
}

/// Declarative pipeline node as handed over by the pipeline service.
///
/// Snapshotted per job, so a running job never sees later edits to the
/// pipeline definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    #[serde(default)]
    pub kind: NodeKind,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub envs: EnvMap,
    #[serde(default)]
    pub allow_failure: bool,
    #[serde(default)]
    pub children: Vec<NodeSpec>,
}

impl NodeSpec {
    pub fn flow(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Flow,
            script: None,
            envs: EnvMap::new(),
            allow_failure: false,
            children: vec![],
        }
    }

    pub fn step(name: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Step,
            script: Some(script.into()),
            envs: EnvMap::new(),
            allow_failure: false,
            children: vec![],
        }
    }

    pub fn with_child(mut self, child: NodeSpec) -> Self {
        self.children.push(child);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.insert(key.into(), value.into());
        self
    }
}

pub type NodeIdx = usize;

/// A node placed in a [`NodeTree`], with its resolved path and links.
#[derive(Debug, Clone)]
pub struct Node {
    pub path: String,
    pub name: String,
    pub kind: NodeKind,
    pub script: Option<String>,
    pub envs: EnvMap,
    pub allow_failure: bool,
    pub parent: Option<NodeIdx>,
    pub children: Vec<NodeIdx>,
    /// Position among the parent's children.
    pub position: usize,
}

impl Node {
    pub fn is_runnable(&self) -> bool {
        self.kind == NodeKind::Step
    }

    /// Flows never tolerate failure; only steps carry the flag.
    pub fn allows_failure(&self) -> bool {
        self.is_runnable() && self.allow_failure
    }
}

/// Arena of nodes in pre-order, addressable by path.
#[derive(Debug, Clone)]
pub struct NodeTree {
    nodes: Vec<Node>,
    index: HashMap<String, NodeIdx>,
    spec: NodeSpec,
}

impl NodeTree {
    /// Build and validate a tree from its root spec.
    pub fn build(spec: NodeSpec) -> Result<Self> {
        if spec.kind != NodeKind::Flow {
            return Err(FlowError::IllegalParameter(format!(
                "Root node '{}' must be a flow",
                spec.name
            )));
        }

        let mut nodes: Vec<Node> = Vec::new();
        let mut index = HashMap::new();
        let mut stack: Vec<(&NodeSpec, Option<NodeIdx>, usize)> = vec![(&spec, None, 0)];

        while let Some((node_spec, parent, position)) = stack.pop() {
            validate_spec(node_spec)?;

            let path = match parent {
                Some(p) => format!("{}{}{}", nodes[p].path, PATH_SEPARATOR, node_spec.name),
                None => node_spec.name.clone(),
            };
            let idx = nodes.len();
            if index.insert(path.clone(), idx).is_some() {
                return Err(FlowError::IllegalParameter(format!(
                    "Duplicate node path: {}",
                    path
                )));
            }
            if let Some(p) = parent {
                nodes[p].children.push(idx);
            }
            nodes.push(Node {
                path,
                name: node_spec.name.clone(),
                kind: node_spec.kind,
                script: node_spec.script.clone(),
                envs: node_spec.envs.clone(),
                allow_failure: node_spec.allow_failure,
                parent,
                children: Vec::with_capacity(node_spec.children.len()),
                position,
            });

            // Reverse so the first child is popped (and numbered) first.
            for (pos, child) in node_spec.children.iter().enumerate().rev() {
                stack.push((child, Some(idx), pos));
            }
        }

        Ok(Self { nodes, index, spec })
    }

    pub fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    pub fn root(&self) -> NodeIdx {
        0
    }

    pub fn node(&self, idx: NodeIdx) -> &Node {
        &self.nodes[idx]
    }

    pub fn find(&self, path: &str) -> Option<NodeIdx> {
        self.index.get(path.trim_matches(PATH_SEPARATOR)).copied()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in pre-order (root first).
    pub fn iter(&self) -> impl Iterator<Item = (NodeIdx, &Node)> {
        self.nodes.iter().enumerate()
    }

    pub fn parent(&self, idx: NodeIdx) -> Option<NodeIdx> {
        self.nodes[idx].parent
    }

    pub fn prev(&self, idx: NodeIdx) -> Option<NodeIdx> {
        let node = &self.nodes[idx];
        let parent = node.parent?;
        node.position
            .checked_sub(1)
            .map(|pos| self.nodes[parent].children[pos])
    }

    pub fn next(&self, idx: NodeIdx) -> Option<NodeIdx> {
        let node = &self.nodes[idx];
        let parent = node.parent?;
        self.nodes[parent].children.get(node.position + 1).copied()
    }

    pub fn first_child(&self, idx: NodeIdx) -> Option<NodeIdx> {
        self.nodes[idx].children.first().copied()
    }

    /// Pre-order successor: first child, else next sibling of the nearest
    /// ancestor (or self) that has one.
    pub fn next_in_order(&self, idx: NodeIdx) -> Option<NodeIdx> {
        if let Some(child) = self.first_child(idx) {
            return Some(child);
        }
        let mut current = idx;
        loop {
            if let Some(sibling) = self.next(current) {
                return Some(sibling);
            }
            current = self.parent(current)?;
        }
    }

    /// Walk forward from `start` until a runnable node is found.
    pub fn first_runnable(&self, start: Option<NodeIdx>) -> Option<NodeIdx> {
        let mut current = start;
        while let Some(idx) = current {
            if self.nodes[idx].is_runnable() {
                return Some(idx);
            }
            current = self.next_in_order(idx);
        }
        None
    }

    /// Envs of a node with its ancestors' envs folded in underneath.
    /// Nearer nodes take precedence over farther ancestors.
    pub fn merged_envs(&self, idx: NodeIdx) -> EnvMap {
        let mut envs = self.nodes[idx].envs.clone();
        let mut current = self.nodes[idx].parent;
        while let Some(ancestor) = current {
            for (key, value) in &self.nodes[ancestor].envs {
                envs.entry(key.clone()).or_insert_with(|| value.clone());
            }
            current = self.nodes[ancestor].parent;
        }
        envs
    }
}

fn validate_spec(spec: &NodeSpec) -> Result<()> {
    if spec.name.is_empty() || spec.name.contains(PATH_SEPARATOR) {
        return Err(FlowError::IllegalParameter(format!(
            "Invalid node name: '{}'",
            spec.name
        )));
    }
    if spec.kind == NodeKind::Step && !spec.children.is_empty() {
        return Err(FlowError::IllegalParameter(format!(
            "Step '{}' cannot have children",
            spec.name
        )));
    }
    if spec.kind == NodeKind::Flow && spec.children.is_empty() {
        return Err(FlowError::IllegalParameter(format!(
            "Flow '{}' has no nodes",
            spec.name
        )));
    }
    let mut seen = HashSet::new();
    for child in &spec.children {
        if !seen.insert(child.name.as_str()) {
            return Err(FlowError::IllegalParameter(format!(
                "Duplicate child '{}' under '{}'",
                child.name, spec.name
            )));
        }
    }
    Ok(())
}
