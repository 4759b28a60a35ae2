//! Declarative test trees on disk.
//!
//! A tree file is checked twice before it is handed out: structurally against
//! the JSON schema, then semantically against the tree invariants (unique ids,
//! resolvable dependencies). Writes run the semantic check only, since the
//! serializer cannot produce a structurally invalid document.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow, ensure};
use jsonschema::validator_for;
use serde_json::Value;
use tracing::debug;

use crate::core::invariants::validate_invariants;
use crate::tree::TreeNode;

/// Load a test tree, rejecting files that break the schema or the invariants.
pub fn load_tree(schema_path: &Path, tree_path: &Path) -> Result<TreeNode> {
    let document = read_json(tree_path, "tree")?;
    let schema = read_json(schema_path, "schema")?;
    let violations = schema_violations(&schema, &document)
        .with_context(|| format!("compile schema {}", schema_path.display()))?;
    ensure!(
        violations.is_empty(),
        "tree {} failed schema validation: {}",
        tree_path.display(),
        violations.join("; ")
    );

    let tree: TreeNode = serde_json::from_value(document)
        .with_context(|| format!("deserialize tree {}", tree_path.display()))?;
    check_invariants(&tree).with_context(|| format!("tree {}", tree_path.display()))?;
    debug!(path = %tree_path.display(), root = %tree.id, "test tree loaded");
    Ok(tree)
}

/// Write a test tree to disk, pretty-printed with a trailing newline.
///
/// Children keep their declared order; execution order comes from `order`
/// and dependencies, not from the file.
pub fn write_tree(tree_path: &Path, tree: &TreeNode) -> Result<()> {
    check_invariants(tree).context("refusing to write invalid tree")?;
    let mut buf = serde_json::to_string_pretty(tree)?;
    buf.push('\n');
    fs::write(tree_path, buf).with_context(|| format!("write tree {}", tree_path.display()))
}

fn read_json(path: &Path, what: &str) -> Result<Value> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("read {what} {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parse {what} {}", path.display()))
}

/// Every schema violation of `document`, empty when it conforms.
fn schema_violations(schema: &Value, document: &Value) -> Result<Vec<String>> {
    let validator = validator_for(schema).map_err(|err| anyhow!("invalid schema: {err}"))?;
    Ok(validator
        .iter_errors(document)
        .map(|err| err.to_string())
        .collect())
}

fn check_invariants(tree: &TreeNode) -> Result<()> {
    let errors = validate_invariants(tree);
    ensure!(errors.is_empty(), "{}", errors.join("; "));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{case, group, write_schema};

    #[test]
    fn load_and_write_tree_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let schema_path = write_schema(temp.path());
        let tree_path = temp.path().join("tree.json");

        let mut b = case("B");
        b.dependencies.push("A".to_string());
        let tree = group("root", vec![case("A"), b]);
        write_tree(&tree_path, &tree).expect("write tree");

        let loaded = load_tree(&schema_path, &tree_path).expect("load tree");
        assert_eq!(loaded, tree);
    }

    #[test]
    fn schema_rejects_unknown_fields() {
        let temp = tempfile::tempdir().expect("tempdir");
        let schema_path = write_schema(temp.path());
        let tree_path = temp.path().join("tree.json");
        fs::write(&tree_path, r#"{ "id": "root", "timeout": 5 }"#).expect("write");

        let err = load_tree(&schema_path, &tree_path).unwrap_err();
        assert!(
            format!("{err:#}").contains("failed schema validation"),
            "{err:#}"
        );
    }

    #[test]
    fn invariants_reject_unknown_dependency() {
        let temp = tempfile::tempdir().expect("tempdir");
        let schema_path = write_schema(temp.path());
        let tree_path = temp.path().join("tree.json");
        fs::write(
            &tree_path,
            r#"{ "id": "root", "children": [{ "id": "A", "dependencies": ["ghost"] }] }"#,
        )
        .expect("write");

        let err = load_tree(&schema_path, &tree_path).unwrap_err();
        assert!(format!("{err:#}").contains("unknown dependency 'ghost'"), "{err:#}");
    }

    #[test]
    fn write_refuses_invalid_tree() {
        let temp = tempfile::tempdir().expect("tempdir");
        let tree = group("root", vec![case("A"), case("A")]);
        let err = write_tree(&temp.path().join("tree.json"), &tree).unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("refusing to write invalid tree"), "{message}");
        assert!(message.contains("duplicate id 'A'"), "{message}");
        assert!(!temp.path().join("tree.json").exists());
    }

    #[test]
    fn broken_schema_is_reported_as_such() {
        let temp = tempfile::tempdir().expect("tempdir");
        let schema_path = temp.path().join("schema.json");
        fs::write(&schema_path, r#"{ "type": 12 }"#).expect("write schema");
        let tree_path = temp.path().join("tree.json");
        write_tree(&tree_path, &case("root")).expect("write tree");

        let err = load_tree(&schema_path, &tree_path).unwrap_err();
        assert!(format!("{err:#}").contains("invalid schema"), "{err:#}");
    }
}
