//! Semantic invariants of declarative trees not expressible via JSON Schema.

use std::collections::HashSet;

use crate::core::path::node_path;
use crate::tree::TreeNode;

/// Check semantic invariants not expressible in JSON Schema:
/// - No duplicate ids
/// - Ids are non-empty and contain no `/`
/// - Every dependency names an existing node
/// - No node depends on itself, an ancestor or a descendant
///
/// Dependency cycles between unrelated nodes are left to the command builder,
/// which reports them against the selected subset only.
pub fn validate_invariants(root: &TreeNode) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    collect_ids(root, &mut seen, &mut errors);

    let mut ancestors = Vec::new();
    validate_node(root, root, &seen, &mut ancestors, &mut errors);
    errors
}

fn collect_ids<'a>(node: &'a TreeNode, seen: &mut HashSet<&'a str>, errors: &mut Vec<String>) {
    if !seen.insert(node.id.as_str()) {
        errors.push(format!("duplicate id '{}'", node.id));
    }
    for child in &node.children {
        collect_ids(child, seen, errors);
    }
}

fn validate_node<'a>(
    root: &TreeNode,
    node: &'a TreeNode,
    ids: &HashSet<&str>,
    ancestors: &mut Vec<&'a str>,
    errors: &mut Vec<String>,
) {
    let path = node_path(root, &node.id).unwrap_or_else(|| node.id.clone());

    if node.id.trim().is_empty() {
        errors.push(format!("{}: id must not be empty", path));
    }
    if node.id.contains('/') {
        errors.push(format!("{}: id must not contain '/'", path));
    }

    for target in &node.dependencies {
        if !ids.contains(target.as_str()) {
            errors.push(format!("{}: unknown dependency '{}'", path, target));
        } else if *target == node.id {
            errors.push(format!("{}: depends on itself", path));
        } else if ancestors.contains(&target.as_str()) {
            errors.push(format!("{}: depends on ancestor '{}'", path, target));
        } else if is_descendant(node, target) {
            errors.push(format!("{}: depends on descendant '{}'", path, target));
        }
    }

    ancestors.push(&node.id);
    for child in &node.children {
        validate_node(root, child, ids, ancestors, errors);
    }
    ancestors.pop();
}

fn is_descendant(node: &TreeNode, id: &str) -> bool {
    node.children
        .iter()
        .any(|child| child.id == id || is_descendant(child, id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{case, group};

    #[test]
    fn valid_tree_has_no_errors() {
        let mut b = case("B");
        b.dependencies.push("A1".to_string());
        let root = group("root", vec![group("A", vec![case("A1")]), b]);
        assert!(validate_invariants(&root).is_empty());
    }

    #[test]
    fn reports_duplicates_and_unknown_dependencies() {
        let mut b = case("B");
        b.dependencies.push("ghost".to_string());
        let root = group("root", vec![case("A"), case("A"), b]);

        let errors = validate_invariants(&root);
        assert!(errors.iter().any(|e| e == "duplicate id 'A'"), "{errors:?}");
        assert!(
            errors.iter().any(|e| e == "root/B: unknown dependency 'ghost'"),
            "{errors:?}"
        );
    }

    #[test]
    fn reports_self_ancestor_and_descendant_dependencies() {
        let mut a1 = case("A1");
        a1.dependencies.push("A1".to_string());
        a1.dependencies.push("A".to_string());
        let mut a = group("A", vec![a1, case("A2")]);
        a.dependencies.push("A2".to_string());
        let root = group("root", vec![a]);

        let errors = validate_invariants(&root);
        assert!(errors.contains(&"root/A/A1: depends on itself".to_string()));
        assert!(errors.contains(&"root/A/A1: depends on ancestor 'A'".to_string()));
        assert!(errors.contains(&"root/A: depends on descendant 'A2'".to_string()));
    }
}
