//! # Schema Tree
//!
//! The live telemetry tree rooted at the `slate` namespace.
//!
//! The tree's shape is fixed when a schema is installed after a (re)connect.
//! From then on only leaf values change, through [`SchemaTree::apply_update`].

use indexmap::IndexMap;
use serde_json::{Map, Value};
use tracing::debug;

use super::node::{encode_children, is_scalar, Leaf, SchemaNode, ROOT, VALUE_KEY};
use crate::error::{GatewayError, Result};

/// Root namespace of the telemetry schema
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaTree {
    root: IndexMap<String, SchemaNode>,
}

/// Outcome of merging one update into the tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// Leaves whose value was written
    pub changed: usize,
    /// Update paths absent from the schema
    pub unknown: Vec<String>,
    /// Paths where the update had the wrong shape for the schema node
    pub rejected: Vec<String>,
}

/// Split a dot path and strip the leading `slate` segment.
fn segments(path: &str) -> Result<Vec<&str>> {
    let mut parts = path.split('.');
    match parts.next() {
        Some(ROOT) => Ok(parts.collect()),
        _ => Err(GatewayError::UnknownPath(path.to_string())),
    }
}

impl SchemaTree {
    /// Decode the root namespace from a JSON object.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Schema`] when the value is not an object,
    /// describes a leaf at the root, or contains a malformed node.
    pub fn from_json(value: &Value) -> Result<Self> {
        match SchemaNode::from_json(value, ROOT)? {
            SchemaNode::Namespace(root) => Ok(Self { root }),
            SchemaNode::Leaf(_) => Err(GatewayError::Schema("root must be a namespace".to_string())),
        }
    }

    /// Decode one schema line received from the remote unit.
    pub fn from_line(line: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(line.trim())?;
        Self::from_json(&value)
    }

    pub fn to_json(&self) -> Value {
        encode_children(&self.root)
    }

    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    /// Look up the node at a `slate.`-prefixed dot path.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UnknownPath`] at the first segment that does not
    /// exist, or when the path does not start at `slate`.
    pub fn get(&self, path: &str) -> Result<&SchemaNode> {
        let unknown = || GatewayError::UnknownPath(path.to_string());
        let mut node: Option<&SchemaNode> = None;

        for segment in segments(path)? {
            let children = match node {
                None => &self.root,
                Some(SchemaNode::Namespace(children)) => children,
                Some(SchemaNode::Leaf(_)) => return Err(unknown()),
            };
            match children.get(segment) {
                Some(child) => node = Some(child),
                None => {
                    debug!("Key {} not found in {}", segment, path);
                    return Err(unknown());
                }
            }
        }

        // `slate` alone names the root, which is not a node of its own
        node.ok_or_else(unknown)
    }

    /// Current value of the leaf at `path`.
    pub fn get_value(&self, path: &str) -> Result<&Value> {
        match self.get(path)? {
            SchemaNode::Leaf(leaf) => Ok(&leaf.value),
            SchemaNode::Namespace(_) => Err(GatewayError::UnknownPath(path.to_string())),
        }
    }

    /// Depth-first iterator over `(path, leaf)` in sibling insertion order.
    pub fn leaves(&self) -> Leaves<'_> {
        Leaves {
            stack: vec![(ROOT.to_string(), self.root.iter())],
        }
    }

    /// Lazily map every leaf and its path through `f`.
    pub fn flatten<'a, T, F>(&'a self, mut f: F) -> impl Iterator<Item = T> + 'a
    where
        F: FnMut(&Leaf, &str) -> T + 'a,
        T: 'a,
    {
        self.leaves().map(move |(path, leaf)| f(leaf, &path))
    }

    pub fn leaf_paths(&self) -> impl Iterator<Item = String> + '_ {
        self.leaves().map(|(path, _)| path)
    }

    /// Rebuild the tree, replacing every leaf with `f(leaf, path)`.
    pub fn transform<F>(&self, mut f: F) -> SchemaTree
    where
        F: FnMut(&Leaf, &str) -> Leaf,
    {
        fn rebuild<F>(children: &IndexMap<String, SchemaNode>, path: &str, f: &mut F) -> IndexMap<String, SchemaNode>
        where
            F: FnMut(&Leaf, &str) -> Leaf,
        {
            children
                .iter()
                .map(|(name, node)| {
                    let child_path = format!("{}.{}", path, name);
                    let rebuilt = match node {
                        SchemaNode::Leaf(leaf) => SchemaNode::Leaf(f(leaf, &child_path)),
                        SchemaNode::Namespace(grandchildren) => {
                            SchemaNode::Namespace(rebuild(grandchildren, &child_path, f))
                        }
                    };
                    (name.clone(), rebuilt)
                })
                .collect()
        }

        SchemaTree {
            root: rebuild(&self.root, ROOT, &mut f),
        }
    }

    /// Merge a (partial) telemetry update into the tree.
    ///
    /// Only paths that already exist are written. A leaf accepts either a bare
    /// scalar or an object carrying the scalar under `valu`.
    pub fn apply_update(&mut self, update: &Value) -> UpdateReport {
        let mut report = UpdateReport::default();
        match update {
            Value::Object(fields) => merge_children(&mut self.root, fields, ROOT, &mut report),
            _ => report.rejected.push(ROOT.to_string()),
        }

        if !report.unknown.is_empty() {
            debug!("Ignoring update keys missing from schema: {:?}", report.unknown);
        }
        if !report.rejected.is_empty() {
            debug!("Ignoring malformed update at: {:?}", report.rejected);
        }
        report
    }

    /// Nested view of the tree holding only leaf values.
    pub fn values(&self) -> Value {
        fn values_of(children: &IndexMap<String, SchemaNode>) -> Value {
            Value::Object(
                children
                    .iter()
                    .map(|(name, node)| {
                        let value = match node {
                            SchemaNode::Leaf(leaf) => leaf.value.clone(),
                            SchemaNode::Namespace(grandchildren) => values_of(grandchildren),
                        };
                        (name.clone(), value)
                    })
                    .collect(),
            )
        }

        values_of(&self.root)
    }
}

fn merge_children(
    children: &mut IndexMap<String, SchemaNode>,
    fields: &Map<String, Value>,
    path: &str,
    report: &mut UpdateReport,
) {
    for (name, update) in fields {
        let child_path = format!("{}.{}", path, name);
        match children.get_mut(name) {
            Some(node) => merge_node(node, update, child_path, report),
            None => report.unknown.push(child_path),
        }
    }
}

fn merge_node(node: &mut SchemaNode, update: &Value, path: String, report: &mut UpdateReport) {
    match node {
        SchemaNode::Leaf(leaf) => {
            let value = match update {
                Value::Object(fields) => fields.get(VALUE_KEY).unwrap_or(update),
                other => other,
            };
            if is_scalar(value) {
                leaf.value = value.clone();
                report.changed += 1;
            } else {
                report.rejected.push(path);
            }
        }
        SchemaNode::Namespace(children) => match update {
            Value::Object(fields) => merge_children(children, fields, &path, report),
            _ => report.rejected.push(path),
        },
    }
}

/// Iterator returned by [`SchemaTree::leaves`]
pub struct Leaves<'a> {
    stack: Vec<(String, indexmap::map::Iter<'a, String, SchemaNode>)>,
}

impl<'a> Iterator for Leaves<'a> {
    type Item = (String, &'a Leaf);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (prefix, siblings) = self.stack.last_mut()?;
            let Some((name, node)) = siblings.next() else {
                self.stack.pop();
                continue;
            };

            let path = format!("{}.{}", prefix, name);
            match node {
                SchemaNode::Leaf(leaf) => return Some((path, leaf)),
                SchemaNode::Namespace(children) => self.stack.push((path, children.iter())),
            }
        }
    }
}
