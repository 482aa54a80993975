//! The hierarchical store and its path handling
//!
//! One global tree per service. Node names are path segments; children keep
//! insertion order and are scanned linearly, which is what directory
//! listings expose. All access happens under the engine's tree lock.

use log::error;

use crate::error::{Error, Result};
use xs_wire::ABS_PATH_MAX;

/// A single tree entry
#[derive(Debug)]
pub struct Node {
    name: String,
    value: Option<Vec<u8>>,
    children: Vec<Node>,
}

impl Node {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value: None,
            children: Vec::new(),
        }
    }

    /// Segment naming this node under its parent; empty for the root
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value bytes, if the node has ever been written with one
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }

    /// Child names in insertion order
    pub fn child_names(&self) -> impl Iterator<Item = &str> {
        self.children.iter().map(|c| c.name.as_str())
    }
}

/// The global hierarchical store
#[derive(Debug)]
pub struct Tree {
    root: Node,
}

impl Tree {
    /// An empty store: just the nameless root
    pub fn new() -> Self {
        Self {
            root: Node::new(""),
        }
    }

    /// Walk to the node at `path`, if present
    ///
    /// The root path `/` resolves to the root node.
    pub fn lookup(&self, path: &str) -> Option<&Node> {
        let mut node = &self.root;
        for segment in segments(path) {
            node = node.children.iter().find(|c| c.name == segment)?;
        }
        Some(node)
    }

    /// Set the value at `path`, creating missing intermediates valueless
    ///
    /// `None` ensures the node exists without touching whatever value it
    /// already holds, which is also the MKDIR behavior.
    pub fn write(&mut self, path: &str, value: Option<&[u8]>) {
        let mut node = &mut self.root;
        for segment in segments(path) {
            let idx = match node.children.iter().position(|c| c.name == segment) {
                Some(idx) => idx,
                None => {
                    node.children.push(Node::new(segment));
                    node.children.len() - 1
                }
            };
            node = &mut node.children[idx];
        }

        if let Some(value) = value {
            node.value = Some(value.to_vec());
        }
    }

    /// Unlink the node at `path` and free its whole subtree
    pub fn remove(&mut self, path: &str) -> Result<()> {
        let mut parents: Vec<&str> = segments(path).collect();
        let last = parents.pop().ok_or(Error::Invalid)?;

        let mut node = &mut self.root;
        for segment in parents {
            node = node
                .children
                .iter_mut()
                .find(|c| c.name == segment)
                .ok_or(Error::NotFound)?;
        }

        let idx = node
            .children
            .iter()
            .position(|c| c.name == last)
            .ok_or(Error::NotFound)?;
        node.children.remove(idx);

        Ok(())
    }
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Normalize a request path payload against the caller's domain
///
/// The payload runs to its first nul (or its end). Relative paths are
/// rewritten under `/local/domain/<domid>/`; the total pre-rewrite length is
/// bounded by [`ABS_PATH_MAX`] counting the terminating nul.
pub fn construct_path(payload: &[u8], domid: u16) -> Result<String> {
    let raw = match payload.iter().position(|&b| b == 0) {
        Some(idx) => &payload[..idx],
        None => payload,
    };

    if raw.len() + 1 > ABS_PATH_MAX {
        error!(
            "invalid path len (path len = {}, max = {})",
            raw.len() + 1,
            ABS_PATH_MAX
        );
        return Err(Error::PathTooLong);
    }

    let raw = core::str::from_utf8(raw).map_err(|_| Error::Invalid)?;

    if raw.starts_with('/') {
        Ok(raw.to_string())
    } else {
        Ok(format!("/local/domain/{}/{}", domid, raw))
    }
}

/// The `/local/domain/<domid>/` prefix owned by a domain
pub fn local_prefix(domid: u16) -> String {
    format!("/local/domain/{}/", domid)
}
