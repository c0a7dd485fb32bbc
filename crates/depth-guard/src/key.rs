use std::{collections::BTreeSet, fmt};

use base64::{display::Base64Display, engine::general_purpose::URL_SAFE_NO_PAD};
use serde_json::{Map, Value};

use crate::selection::{FragmentTable, SelectionNode};

const NAMESPACE: &str = "depth";
const ANONYMOUS: &str = "anonymous";

/// How much of a request goes into its cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyOptions {
    /// Depth only depends on the shape of the operation. Without variable values, requests
    /// differing only by their variables share a key.
    pub hash_variable_values: bool,
}

impl Default for KeyOptions {
    fn default() -> Self {
        Self {
            hash_variable_values: true,
        }
    }
}

/// Fixed-length URL-safe key, stable across processes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives the cache key of a request from its operation name, its variables and the shape of
/// its selection graph, including the fragments it spreads.
pub fn derive_key(
    operation_name: Option<&str>,
    variables: &Map<String, Value>,
    root: &SelectionNode,
    fragments: &FragmentTable,
    options: KeyOptions,
) -> CacheKey {
    let mut hasher = blake3::Hasher::new();

    hasher.update(operation_name.unwrap_or(ANONYMOUS).as_bytes());
    // NULL bytes acting as separator, they cannot be part of a GraphQL name.
    hasher.update(&[0x00]);

    hasher.update(b"variables");
    hasher.update(&[0x00]);

    let mut names = variables.keys().collect::<Vec<_>>();
    names.sort_unstable();

    for name in names {
        hasher.update(name.as_bytes());
        hasher.update(&[0x00]);

        if options.hash_variable_values {
            hash_value(&mut hasher, &variables[name]);
        }
    }

    hasher.update(b"selection");
    hasher.update(&[0x00]);
    hash_node(&mut hasher, root);

    // Named fragments are hashed once, in name order, whatever the order of the document.
    let mut spread = BTreeSet::new();
    collect_spreads(root, fragments, &mut spread);

    for name in spread {
        if let Some(fragment) = fragments.get(name) {
            hasher.update(b"fragment");
            hasher.update(&[0x00]);
            hasher.update(name.as_bytes());
            hasher.update(&[0x00]);
            hash_node(&mut hasher, fragment);
        }
    }

    let hash = hasher.finalize();

    CacheKey(format!(
        "{NAMESPACE}.blake3.{}",
        Base64Display::new(hash.as_bytes(), &URL_SAFE_NO_PAD)
    ))
}

fn hash_node(hasher: &mut blake3::Hasher, node: &SelectionNode) {
    match node {
        SelectionNode::Field { name, selection } => {
            hasher.update(b"F");
            hasher.update(name.as_bytes());
            hash_selection(hasher, selection);
        }
        SelectionNode::FragmentSpread { name } => {
            hasher.update(b"S");
            hasher.update(name.as_bytes());
            hasher.update(&[0x00]);
        }
        SelectionNode::InlineFragment {
            type_condition,
            selection,
        } => {
            hasher.update(b"I");
            hasher.update(type_condition.as_deref().unwrap_or_default().as_bytes());
            hash_selection(hasher, selection);
        }
        SelectionNode::OperationRoot { selection } => {
            hasher.update(b"R");
            hash_selection(hasher, selection);
        }
    }
}

fn hash_selection(hasher: &mut blake3::Hasher, selection: &[SelectionNode]) {
    hasher.update(b"{");

    for node in selection {
        hash_node(hasher, node);
    }

    hasher.update(b"}");
}

/// Object members are hashed in key order, so that the same variables always hash the same.
fn hash_value(hasher: &mut blake3::Hasher, value: &Value) {
    match value {
        Value::Null => {
            hasher.update(b"n");
        }
        Value::Bool(value) => {
            hasher.update(if *value { b"t" } else { b"f" });
        }
        Value::Number(number) => {
            hasher.update(b"#");
            hasher.update(number.to_string().as_bytes());
            hasher.update(&[0x00]);
        }
        Value::String(value) => {
            hasher.update(b"s");
            hasher.update(&(value.len() as u64).to_le_bytes());
            hasher.update(value.as_bytes());
        }
        Value::Array(items) => {
            hasher.update(b"[");
            hasher.update(&(items.len() as u64).to_le_bytes());

            for item in items {
                hash_value(hasher, item);
            }
        }
        Value::Object(members) => {
            let mut members = members.iter().collect::<Vec<_>>();
            members.sort_unstable_by(|(a, _), (b, _)| a.cmp(b));

            hasher.update(b"{");
            hasher.update(&(members.len() as u64).to_le_bytes());

            for (name, value) in members {
                hasher.update(&(name.len() as u64).to_le_bytes());
                hasher.update(name.as_bytes());
                hash_value(hasher, value);
            }
        }
    }
}

fn collect_spreads<'a>(node: &'a SelectionNode, fragments: &'a FragmentTable, spread: &mut BTreeSet<&'a str>) {
    if let SelectionNode::FragmentSpread { name } = node {
        // The set doubles as a guard against fragment cycles.
        if spread.insert(name) {
            if let Some(fragment) = fragments.get(name) {
                collect_spreads(fragment, fragments, spread);
            }
        }

        return;
    }

    for child in node.selection() {
        collect_spreads(child, fragments, spread);
    }
}
