//! Helpers for rendering deterministic node paths.

use crate::tree::TreeNode;

/// Return the `/`-separated id path to `target_id`, rooted at `root`.
pub fn node_path(root: &TreeNode, target_id: &str) -> Option<String> {
    let mut path = Vec::new();
    if node_path_inner(root, target_id, &mut path) {
        return Some(path.join("/"));
    }
    None
}

fn node_path_inner<'a>(node: &'a TreeNode, target_id: &str, path: &mut Vec<&'a str>) -> bool {
    path.push(&node.id);
    if node.id == target_id {
        return true;
    }
    for child in &node.children {
        if node_path_inner(child, target_id, path) {
            return true;
        }
    }
    path.pop();
    false
}
