//! Boundary to the host document tree.
//!
//! The engine never owns live nodes. It reads through [`HostTree`], holds
//! handles only as lookups, and commits new orders through the batch
//! insertion primitive.

use std::{
    fmt::Debug,
    hash::Hash,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// Read and commit access to a live, host-owned element tree.
pub trait HostTree {
    /// Handle to one element. Handles to detached elements stay valid but
    /// no longer match anything reachable from [`HostTree::root`].
    type Node: Copy + Eq + Hash + Debug;

    fn root(&self) -> Self::Node;

    /// Element children in document order.
    fn children(&self, node: Self::Node) -> Vec<Self::Node>;

    fn parent(&self, node: Self::Node) -> Option<Self::Node>;

    /// Lowercase element name.
    fn tag_name(&self, node: Self::Node) -> String;

    fn attribute(&self, node: Self::Node, name: &str) -> Option<String>;

    /// Text directly owned by the element, excluding descendants.
    fn own_text(&self, node: Self::Node) -> String;

    /// Removes `node` from its parent. No-op for detached nodes.
    fn detach(&mut self, node: Self::Node);

    /// Inserts `nodes` as one batch under `parent`, before `before` when it
    /// is a child of `parent`, otherwise at the end.
    fn insert_children(
        &mut self,
        parent: Self::Node,
        before: Option<Self::Node>,
        nodes: &[Self::Node],
    );

    /// Deep copy of `node`, not attached anywhere.
    fn clone_subtree(&mut self, node: Self::Node) -> Self::Node;

    /// Concatenated text of the element and all descendants.
    fn text_content(&self, node: Self::Node) -> String {
        let mut text = self.own_text(node);
        for child in self.children(node) {
            text.push_str(&self.text_content(child));
        }
        text
    }

    /// `true` when `node` is reachable from the root.
    fn is_connected(&self, node: Self::Node) -> bool {
        let root = self.root();
        let mut current = Some(node);
        while let Some(candidate) = current {
            if candidate == root {
                return true;
            }
            current = self.parent(candidate);
        }
        false
    }

    fn has_class(&self, node: Self::Node, class: &str) -> bool {
        self.attribute(node, "class")
            .map(|classes| classes.split_whitespace().any(|c| c == class))
            .unwrap_or(false)
    }
}

/// Tree handle shared between the host side and the engine.
pub type SharedTree<T> = Arc<Mutex<T>>;

pub fn shared<T: HostTree>(tree: T) -> SharedTree<T> {
    Arc::new(Mutex::new(tree))
}

/// Locks the shared tree. Host-side panics must not take the engine down,
/// so a poisoned lock is recovered.
pub fn lock_tree<T>(tree: &SharedTree<T>) -> MutexGuard<'_, T> {
    tree.lock().unwrap_or_else(PoisonError::into_inner)
}
