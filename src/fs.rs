//! Local mirror of the encrypted filesystem.
//!
//! Nodes live in a handle-indexed store; parent/child links are held as
//! handles rather than references, so the graph has no ownership cycles.
//! The builder that unwraps node keys lives on the client (it needs the
//! master key); this module owns the data model and the lookup surface.

use std::collections::HashMap;

use crate::error::Error;

/// Filesystem node kinds, matching the wire `t` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Folder,
    Root,
    Inbox,
    Trash,
}

impl NodeKind {
    pub(crate) fn from_wire(t: i32) -> Option<Self> {
        match t {
            0 => Some(NodeKind::File),
            1 => Some(NodeKind::Folder),
            2 => Some(NodeKind::Root),
            3 => Some(NodeKind::Inbox),
            4 => Some(NodeKind::Trash),
            _ => None,
        }
    }

    pub(crate) fn to_wire(self) -> i32 {
        match self {
            NodeKind::File => 0,
            NodeKind::Folder => 1,
            NodeKind::Root => 2,
            NodeKind::Inbox => 3,
            NodeKind::Trash => 4,
        }
    }
}

/// Content-crypto material carried by file nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMeta {
    /// Effective AES-128 content key.
    pub key: [u8; 16],
    /// CTR nonce prefix (first 64 bits meaningful).
    pub iv: [u8; 16],
    /// Expected folded content MAC.
    pub mac: [u8; 8],
    /// Unfolded 256-bit composite key, re-wrapped on rename.
    pub compkey: [u8; 32],
}

/// A vertex in the filesystem tree.
#[derive(Debug, Clone)]
pub struct Node {
    pub(crate) handle: String,
    pub(crate) name: String,
    pub(crate) kind: NodeKind,
    pub(crate) size: u64,
    pub(crate) ts: i64,
    pub(crate) parent: Option<String>,
    pub(crate) children: Vec<String>,
    /// Unwrapped node key: the folder key, or the effective content key
    /// for files. Empty for roots and unresolved stubs.
    pub(crate) key: Vec<u8>,
    pub(crate) meta: Option<NodeMeta>,
}

impl Node {
    /// Forward-declared parent placeholder, upgraded in place when the
    /// real manifest entry arrives.
    pub(crate) fn stub(handle: String) -> Self {
        Self {
            handle,
            name: String::new(),
            kind: NodeKind::Folder,
            size: 0,
            ts: 0,
            parent: None,
            children: Vec::new(),
            key: Vec::new(),
            meta: None,
        }
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Node timestamp (seconds since the epoch).
    pub fn timestamp(&self) -> i64 {
        self.ts
    }

    pub fn parent_handle(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn children(&self) -> &[String] {
        &self.children
    }

    pub fn is_dir(&self) -> bool {
        !matches!(self.kind, NodeKind::File)
    }

    pub fn meta(&self) -> Option<&NodeMeta> {
        self.meta.as_ref()
    }
}

/// Handle-indexed filesystem mirror.
#[derive(Debug, Default)]
pub struct FileSystem {
    pub(crate) nodes: HashMap<String, Node>,
    /// Wrapped share keys by holder handle, stored verbatim off the wire.
    pub(crate) skmap: HashMap<String, String>,
    pub(crate) sroots: Vec<String>,
    pub(crate) root: Option<String>,
    pub(crate) inbox: Option<String>,
    pub(crate) trash: Option<String>,
}

impl FileSystem {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Look up a node by handle.
    pub fn lookup(&self, handle: &str) -> Option<&Node> {
        self.nodes.get(handle)
    }

    pub fn root(&self) -> Option<&Node> {
        self.root.as_deref().and_then(|h| self.nodes.get(h))
    }

    pub fn inbox(&self) -> Option<&Node> {
        self.inbox.as_deref().and_then(|h| self.nodes.get(h))
    }

    pub fn trash(&self) -> Option<&Node> {
        self.trash.as_deref().and_then(|h| self.nodes.get(h))
    }

    /// Top-level folders shared into this account.
    pub fn shared_roots(&self) -> Vec<&Node> {
        self.sroots
            .iter()
            .filter_map(|h| self.nodes.get(h))
            .collect()
    }

    /// Walk `names` down from `root_handle`, matching children by display
    /// name. All components must resolve; the first missing one is named
    /// in the [`Error::NotFound`].
    pub fn path_lookup(&self, root_handle: &str, names: &[&str]) -> Result<Vec<String>, Error> {
        let root = self
            .nodes
            .get(root_handle)
            .ok_or_else(|| Error::BadArgs(format!("unknown root handle {}", root_handle)))?;

        let mut resolved = Vec::with_capacity(names.len());
        let mut children: &[String] = &root.children;
        for name in names {
            let hit = children
                .iter()
                .filter_map(|h| self.nodes.get(h))
                .find(|n| n.name == *name);
            match hit {
                Some(node) => {
                    resolved.push(node.handle.clone());
                    children = &node.children;
                }
                None => return Err(Error::NotFound((*name).to_string())),
            }
        }
        Ok(resolved)
    }

    /// Link `child` under `parent`, unlinking from a previous parent
    /// first. Idempotent for repeated manifest ingestion.
    pub(crate) fn link(&mut self, parent: &str, child: &str) {
        if let Some(node) = self.nodes.get(child) {
            if let Some(old) = node.parent.clone() {
                if old != parent {
                    self.unlink(&old, child);
                }
            }
        }
        if let Some(p) = self.nodes.get_mut(parent) {
            if !p.children.iter().any(|h| h == child) {
                p.children.push(child.to_string());
            }
        }
        if let Some(c) = self.nodes.get_mut(child) {
            c.parent = Some(parent.to_string());
        }
    }

    /// Remove `child` from `parent`'s children list.
    pub(crate) fn unlink(&mut self, parent: &str, child: &str) {
        if let Some(p) = self.nodes.get_mut(parent) {
            p.children.retain(|h| h != child);
        }
    }

    /// Drop a node from the index entirely, unlinking it from its parent.
    pub(crate) fn remove(&mut self, handle: &str) {
        let parent = self.nodes.get(handle).and_then(|n| n.parent.clone());
        if let Some(parent) = parent {
            self.unlink(&parent, handle);
        }
        self.nodes.remove(handle);
        self.sroots.retain(|h| h != handle);
    }
}
