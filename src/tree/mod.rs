//! The hierarchical in-memory namespace: directories and files, each
//! carrying its own [`LockNode`], guarded by a single coarse mutex.
//!
//! Modeled after the `State`/`Entry` split in `nfs-mamont`'s
//! `examples/shadow_fs/fs/state.rs` and `examples/in_memory/filesystem.rs`
//! (an id-indexed table there; here a direct `BTreeMap` child tree, since
//! the naming core never needs to resolve a bare numeric id back to a
//! path the way a filehandle-based NFS layer does).

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::error::TreeError;
use crate::lock::LockNode;
use crate::path::Path;
use crate::registry::ReplicaId;

/// A single file or directory entry in the namespace.
pub struct Node {
    pub lock: Arc<LockNode>,
    kind: NodeKind,
}

enum NodeKind {
    Directory { children: BTreeMap<String, Node> },
    File { owner: ReplicaId, replicas: Vec<ReplicaId>, access_count: u64 },
}

impl Node {
    fn directory() -> Node {
        Node { lock: LockNode::new(), kind: NodeKind::Directory { children: BTreeMap::new() } }
    }

    fn file(owner: ReplicaId) -> Node {
        Node {
            lock: LockNode::new(),
            kind: NodeKind::File { owner, replicas: vec![owner], access_count: 0 },
        }
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.kind, NodeKind::Directory { .. })
    }

    fn children(&self) -> Option<&BTreeMap<String, Node>> {
        match &self.kind {
            NodeKind::Directory { children } => Some(children),
            NodeKind::File { .. } => None,
        }
    }

    fn children_mut(&mut self) -> Option<&mut BTreeMap<String, Node>> {
        match &mut self.kind {
            NodeKind::Directory { children } => Some(children),
            NodeKind::File { .. } => None,
        }
    }

    /// Marks this node and, if a directory, every descendant as
    /// tombstoned, waking any queued lock waiters with `FileNotFound`.
    fn tombstone_subtree(&self) {
        self.lock.tombstone();
        if let NodeKind::Directory { children } = &self.kind {
            for child in children.values() {
                child.tombstone_subtree();
            }
        }
    }
}

/// A snapshot of a file's replication-relevant state, returned by
/// [`Tree::file_replicas`] and friends.
#[derive(Debug, Clone)]
pub struct FileState {
    pub owner: ReplicaId,
    pub replicas: Vec<ReplicaId>,
    pub access_count: u64,
}

/// The hierarchical namespace. Operations are synchronous and hold the
/// internal mutex only for the duration of a single traversal — never
/// across an `.await` point, so lock acquisition (which can suspend
/// arbitrarily long) always happens outside it.
pub struct Tree {
    root: Mutex<Node>,
}

impl Default for Tree {
    fn default() -> Self {
        Tree { root: Mutex::new(Node::directory()) }
    }
}

impl Tree {
    pub fn new() -> Self {
        Tree::default()
    }

    /// Whether `path` names an existing node.
    pub fn exists(&self, path: &Path) -> bool {
        let root = self.root.lock().unwrap();
        Self::find(&root, path).is_some()
    }

    /// Whether `path` names a directory. `Err(NotFound)` if it does not
    /// exist.
    pub fn is_directory(&self, path: &Path) -> Result<bool, TreeError> {
        let root = self.root.lock().unwrap();
        let node = Self::find(&root, path).ok_or(TreeError::NotFound)?;
        Ok(node.is_directory())
    }

    /// Names of the children of the directory at `path`, in unspecified
    /// order.
    pub fn list(&self, path: &Path) -> Result<Vec<String>, TreeError> {
        let root = self.root.lock().unwrap();
        let node = Self::find(&root, path).ok_or(TreeError::NotFound)?;
        let children = node.children().ok_or(TreeError::NotDirectory)?;
        Ok(children.keys().cloned().collect())
    }

    /// Creates an empty directory at `path`. The parent must already
    /// exist and be a directory.
    pub fn create_directory(&self, path: &Path) -> Result<bool, TreeError> {
        let mut root = self.root.lock().unwrap();
        Self::create(&mut root, path, |owner_unused: Option<ReplicaId>| {
            debug_assert!(owner_unused.is_none());
            Node::directory()
        })
    }

    /// Creates a file at `path`, owned and hosted by `owner`. The parent
    /// must already exist and be a directory.
    pub fn create_file(&self, path: &Path, owner: ReplicaId) -> Result<bool, TreeError> {
        let mut root = self.root.lock().unwrap();
        Self::create(&mut root, path, move |_| Node::file(owner))
    }

    fn create(
        root: &mut Node,
        path: &Path,
        make: impl FnOnce(Option<ReplicaId>) -> Node,
    ) -> Result<bool, TreeError> {
        let Some(name) = path.name() else {
            // Root always exists: "creating" it is always a conflict.
            return Ok(false);
        };
        let parent_path = path.parent().expect("non-root path has a parent");
        let parent = Self::find_mut(root, &parent_path).ok_or(TreeError::ParentMissing)?;
        let children = parent.children_mut().ok_or(TreeError::NotDirectory)?;
        if children.contains_key(name) {
            return Ok(false);
        }
        children.insert(name.to_string(), make(None));
        Ok(true)
    }

    /// Recursively collects every live file at or beneath `path`, paired
    /// with its replication state at the moment of the call. Used before
    /// a directory `delete` so the caller can cascade a storage `delete`
    /// command to every replica hosting a file in the removed subtree,
    /// not just a single top-level file.
    pub fn file_states_under(&self, path: &Path) -> Vec<(Path, FileState)> {
        let root = self.root.lock().unwrap();
        let Some(node) = Self::find(&root, path) else { return Vec::new() };
        let mut out = Vec::new();
        Self::collect_file_states(node, path, &mut out);
        out
    }

    fn collect_file_states(node: &Node, path: &Path, out: &mut Vec<(Path, FileState)>) {
        match &node.kind {
            NodeKind::File { owner, replicas, access_count } => out.push((
                path.clone(),
                FileState { owner: *owner, replicas: replicas.clone(), access_count: *access_count },
            )),
            NodeKind::Directory { children } => {
                for (name, child) in children {
                    Self::collect_file_states(child, &path.join(name), out);
                }
            }
        }
    }

    /// Total number of nodes in the tree, including root and both
    /// directories and files. A diagnostic used by telemetry/tests, not
    /// by any core operation.
    pub fn node_count(&self) -> usize {
        let root = self.root.lock().unwrap();
        1 + Self::count_descendants(&root)
    }

    fn count_descendants(node: &Node) -> usize {
        match &node.kind {
            NodeKind::File { .. } => 0,
            NodeKind::Directory { children } => {
                children.len() + children.values().map(Self::count_descendants).sum::<usize>()
            }
        }
    }

    /// Deletes the node at `path`, recursively if it is a directory.
    /// Root cannot be deleted.
    pub fn delete(&self, path: &Path) -> Result<(), TreeError> {
        if path.is_root() {
            return Err(TreeError::IsRoot);
        }
        let mut root = self.root.lock().unwrap();
        let name = path.name().expect("non-root path has a name");
        let parent_path = path.parent().expect("non-root path has a parent");
        let parent = Self::find_mut(&mut root, &parent_path).ok_or(TreeError::NotFound)?;
        let children = parent.children_mut().ok_or(TreeError::NotFound)?;
        let removed = children.remove(name).ok_or(TreeError::NotFound)?;
        removed.tombstone_subtree();
        Ok(())
    }

    /// Reconciles a newly registered replica's reported file set against
    /// the tree: existing files are rejected (the replica must delete its
    /// local copy), new files are materialized (creating intermediate
    /// directories as needed) and recorded as owned by `owner`.
    pub fn merge_registration(&self, owner: ReplicaId, paths: &[Path]) -> Vec<Path> {
        let mut root = self.root.lock().unwrap();
        let mut rejected = Vec::new();
        for path in paths {
            if path.is_root() {
                rejected.push(path.clone());
                continue;
            }
            match Self::find(&root, path) {
                Some(node) if !node.is_directory() => {
                    rejected.push(path.clone());
                    continue;
                }
                Some(_) => {
                    // A directory collision: reject too.
                    rejected.push(path.clone());
                    continue;
                }
                None => {}
            }
            if Self::materialize_parents(&mut root, path).is_err() {
                rejected.push(path.clone());
                continue;
            }
            let name = path.name().expect("checked non-root above");
            let parent_path = path.parent().expect("checked non-root above");
            let parent = Self::find_mut(&mut root, &parent_path).expect("just materialized");
            let children = match parent.children_mut() {
                Some(children) => children,
                None => {
                    rejected.push(path.clone());
                    continue;
                }
            };
            if children.contains_key(name) {
                rejected.push(path.clone());
                continue;
            }
            children.insert(name.to_string(), Node::file(owner));
        }
        rejected
    }

    /// Creates any missing directories along `path`'s ancestor chain.
    /// Fails if an ancestor exists but is a file.
    fn materialize_parents(root: &mut Node, path: &Path) -> Result<(), TreeError> {
        let mut current = root;
        for component in &path.components()[..path.components().len() - 1] {
            let children = current.children_mut().ok_or(TreeError::NotDirectory)?;
            current = children.entry(component.clone()).or_insert_with(Node::directory);
            if !current.is_directory() {
                return Err(TreeError::NotDirectory);
            }
        }
        Ok(())
    }

    /// Increments the access counter for the file at `path`, returning
    /// the new value. `None` if `path` is not a live file.
    pub fn increment_access_count(&self, path: &Path) -> Option<u64> {
        let mut root = self.root.lock().unwrap();
        let node = Self::find_mut(&mut root, path)?;
        match &mut node.kind {
            NodeKind::File { access_count, .. } => {
                *access_count += 1;
                Some(*access_count)
            }
            NodeKind::Directory { .. } => None,
        }
    }

    /// Resets the access counter for the file at `path` to zero.
    pub fn reset_access_count(&self, path: &Path) {
        let mut root = self.root.lock().unwrap();
        if let Some(Node { kind: NodeKind::File { access_count, .. }, .. }) =
            Self::find_mut(&mut root, path)
        {
            *access_count = 0;
        }
    }

    /// Current replication state of the file at `path`.
    pub fn file_state(&self, path: &Path) -> Option<FileState> {
        let root = self.root.lock().unwrap();
        let node = Self::find(&root, path)?;
        match &node.kind {
            NodeKind::File { owner, replicas, access_count } => Some(FileState {
                owner: *owner,
                replicas: replicas.clone(),
                access_count: *access_count,
            }),
            NodeKind::Directory { .. } => None,
        }
    }

    /// Adds `replica` to the hosting set of the file at `path`, if it is
    /// not already present.
    pub fn add_replica(&self, path: &Path, replica: ReplicaId) {
        let mut root = self.root.lock().unwrap();
        if let Some(Node { kind: NodeKind::File { replicas, .. }, .. }) =
            Self::find_mut(&mut root, path)
        {
            if !replicas.contains(&replica) {
                replicas.push(replica);
            }
        }
    }

    /// Removes `replica` from the hosting set of the file at `path`.
    pub fn remove_replica(&self, path: &Path, replica: ReplicaId) {
        let mut root = self.root.lock().unwrap();
        if let Some(Node { kind: NodeKind::File { replicas, .. }, .. }) =
            Self::find_mut(&mut root, path)
        {
            replicas.retain(|r| *r != replica);
        }
    }

    /// Resolves the chain of lock nodes needed to lock `path`: every
    /// strict ancestor (root-to-leaf order) plus the target itself.
    /// Fails fast with `NotFound` if `path` does not exist, before any
    /// queueing happens (§4.3.4).
    pub(crate) fn lock_chain(
        &self,
        path: &Path,
    ) -> Result<(Vec<Arc<LockNode>>, Arc<LockNode>), TreeError> {
        let root = self.root.lock().unwrap();
        let mut ancestors = Vec::with_capacity(path.components().len());
        let mut current = &*root;
        ancestors.push(current.lock.clone());
        for component in path.components() {
            let children = current.children().ok_or(TreeError::NotDirectory)?;
            current = children.get(component).ok_or(TreeError::NotFound)?;
            ancestors.push(current.lock.clone());
        }
        let target = ancestors.pop().expect("at least root was pushed");
        Ok((ancestors, target))
    }

    fn find<'a>(root: &'a Node, path: &Path) -> Option<&'a Node> {
        let mut current = root;
        for component in path.components() {
            current = current.children()?.get(component)?;
        }
        Some(current)
    }

    fn find_mut<'a>(root: &'a mut Node, path: &Path) -> Option<&'a mut Node> {
        let mut current = root;
        for component in path.components() {
            current = current.children_mut()?.get_mut(component)?;
        }
        Some(current)
    }
}
