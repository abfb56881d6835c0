/// The recursive document tree at the heart of the reconciliation kernel.
///
/// A [`Document`] is a tree in which every node carries an optional scalar
/// (textual) value and a mapping from edge labels to child sub-trees. JSON
/// objects embed as internal nodes with no scalar; JSON scalars embed as
/// leaves whose scalar is the textual rendering; arrays are unsupported and
/// rejected with [`RetconError::Document`]. Equality is structural, and the
/// empty document is the identity of the right-biased [`Document::overlay`].
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::error::{RetconError, RetconResult};

/// A finite sequence of edge labels identifying a node. The empty path
/// denotes the root.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocumentPath(pub Vec<String>);

impl DocumentPath {
    /// The path denoting the root.
    pub fn root() -> Self {
        DocumentPath(Vec::new())
    }

    /// Build a path from edge labels.
    pub fn new(labels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        DocumentPath(labels.into_iter().map(Into::into).collect())
    }

    /// True if this is the root path.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// The first label and the remaining path, if any.
    fn split_first(&self) -> Option<(&str, DocumentPath)> {
        self.0
            .split_first()
            .map(|(head, tail)| (head.as_str(), DocumentPath(tail.to_vec())))
    }

    /// Append one label, returning a new path.
    pub fn child(&self, label: impl Into<String>) -> DocumentPath {
        let mut labels = self.0.clone();
        labels.push(label.into());
        DocumentPath(labels)
    }
}

impl std::fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0.is_empty() {
            write!(f, "/")
        } else {
            for label in &self.0 {
                write!(f, "/{}", label)?;
            }
            Ok(())
        }
    }
}

/// A recursive, labelled-tree document value.
///
/// Children are kept in a `BTreeMap` so that iteration order (and therefore
/// hashing and serialization) is always the edge label's ascending
/// lexical order, per the canonical-representation requirement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    scalar: Option<String>,
    children: BTreeMap<String, Document>,
}

impl Document {
    /// The empty document: no scalar, no children. Identity of `overlay`.
    pub fn empty() -> Self {
        Document::default()
    }

    /// True if this node has neither a scalar nor children.
    pub fn is_empty(&self) -> bool {
        self.scalar.is_none() && self.children.is_empty()
    }

    /// A leaf document carrying just a scalar.
    pub fn scalar(value: impl Into<String>) -> Self {
        Document {
            scalar: Some(value.into()),
            children: BTreeMap::new(),
        }
    }

    /// Build a document from a JSON value. Objects become internal nodes;
    /// scalars become leaves (`true`/`false` render as `TRUE`/`FALSE`,
    /// `null` renders as no scalar); arrays are rejected.
    pub fn from_json(value: &JsonValue) -> RetconResult<Self> {
        match value {
            JsonValue::Null => Ok(Document::empty()),
            JsonValue::Bool(b) => Ok(Document::scalar(if *b { "TRUE" } else { "FALSE" })),
            JsonValue::Number(n) => Ok(Document::scalar(n.to_string())),
            JsonValue::String(s) => Ok(Document::scalar(s.clone())),
            JsonValue::Array(_) => Err(RetconError::Document(
                "arrays are not a supported document shape".to_string(),
            )),
            JsonValue::Object(map) => {
                let mut children = BTreeMap::new();
                for (label, child_value) in map {
                    if label.is_empty() {
                        return Err(RetconError::Document(
                            "edge labels must not be empty".to_string(),
                        ));
                    }
                    children.insert(label.clone(), Document::from_json(child_value)?);
                }
                Ok(Document {
                    scalar: None,
                    children,
                })
            }
        }
    }

    /// Render this document back to JSON.
    ///
    /// This is a lossy boundary when a node carries both a scalar and
    /// children: the internal representation allows it, but JSON objects
    /// cannot carry a bare value alongside their fields, so the scalar is
    /// dropped. `warn` is called with a path-describing message whenever
    /// this happens so the caller (normally the kernel's trace sink) can
    /// surface it; the internal representation remains the source of
    /// truth, so this loss is acceptable on the JSON boundary only.
    pub fn to_json(&self, mut warn: impl FnMut(&str)) -> JsonValue {
        self.to_json_at(&DocumentPath::root(), &mut warn)
    }

    fn to_json_at(&self, path: &DocumentPath, warn: &mut impl FnMut(&str)) -> JsonValue {
        if self.children.is_empty() {
            return match &self.scalar {
                Some(s) => scalar_to_json(s),
                None => JsonValue::Null,
            };
        }
        if self.scalar.is_some() {
            warn(&format!(
                "document node at {} has both a scalar and children; scalar dropped on JSON export",
                path
            ));
        }
        let mut map = Map::new();
        for (label, child) in &self.children {
            map.insert(label.clone(), child.to_json_at(&path.child(label.clone()), warn));
        }
        JsonValue::Object(map)
    }

    /// Read the scalar at `path`, if any node exists there with one.
    pub fn get(&self, path: &DocumentPath) -> Option<&str> {
        self.node_at(path)?.scalar.as_deref()
    }

    /// Find the sub-tree at `path`, if it exists (even if it carries no
    /// scalar of its own).
    pub fn node_at(&self, path: &DocumentPath) -> Option<&Document> {
        match path.split_first() {
            None => Some(self),
            Some((label, rest)) => self.children.get(label)?.node_at(&rest),
        }
    }

    /// Set the scalar at `path`, creating intermediate internal nodes as
    /// needed. Overwrites any existing scalar there.
    pub fn set(&mut self, path: &DocumentPath, value: impl Into<String>) {
        match path.split_first() {
            None => self.scalar = Some(value.into()),
            Some((label, rest)) => {
                self.children
                    .entry(label.to_string())
                    .or_default()
                    .set(&rest, value);
            }
        }
    }

    /// Remove the scalar at `path`. A no-op if nothing is there. After
    /// removal, any internal node left with neither scalar nor children is
    /// pruned back up the tree.
    pub fn unset(&mut self, path: &DocumentPath) {
        self.unset_inner(path);
    }

    /// Returns true if the child at this step became empty and should be
    /// pruned by the caller.
    fn unset_inner(&mut self, path: &DocumentPath) -> bool {
        match path.split_first() {
            None => {
                self.scalar = None;
            }
            Some((label, rest)) => {
                let mut prune = false;
                if let Some(child) = self.children.get_mut(label) {
                    prune = child.unset_inner(&rest);
                }
                if prune {
                    self.children.remove(label);
                }
            }
        }
        self.is_empty()
    }

    /// Enumerate every `(path, scalar)` pair in this document, in lexical
    /// path order (the `BTreeMap` ordering already guarantees this at each
    /// level).
    pub fn paths(&self) -> Vec<(DocumentPath, String)> {
        let mut out = Vec::new();
        self.collect_paths(&DocumentPath::root(), &mut out);
        out
    }

    fn collect_paths(&self, prefix: &DocumentPath, out: &mut Vec<(DocumentPath, String)>) {
        if let Some(scalar) = &self.scalar {
            out.push((prefix.clone(), scalar.clone()));
        }
        for (label, child) in &self.children {
            child.collect_paths(&prefix.child(label.clone()), out);
        }
    }

    /// Right-biased pointwise union of two documents: children are merged
    /// recursively, and `b`'s scalar wins whenever it is present.
    pub fn overlay(a: &Document, b: &Document) -> Document {
        let scalar = b.scalar.clone().or_else(|| a.scalar.clone());
        let mut children = a.children.clone();
        for (label, b_child) in &b.children {
            children
                .entry(label.clone())
                .and_modify(|a_child| *a_child = Document::overlay(a_child, b_child))
                .or_insert_with(|| b_child.clone());
        }
        Document { scalar, children }
    }
}

/// Render a scalar's textual form back to JSON. `TRUE`/`FALSE` are the two
/// sentinel renderings `from_json` produces for booleans; everything else
/// round-trips as a JSON string, since the tree no longer distinguishes a
/// number's original formatting (leading zeros, exponents) from a string
/// that happens to look numeric.
fn scalar_to_json(s: &str) -> JsonValue {
    match s {
        "TRUE" => JsonValue::Bool(true),
        "FALSE" => JsonValue::Bool(false),
        _ => JsonValue::String(s.to_string()),
    }
}
