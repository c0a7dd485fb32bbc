//! Depth of a selection graph.
//!
//! A field opens a new level for its children, fragments (spread or inline) and the operation
//! root do not. Leaves and introspection fields contribute the depth they are found at, so a
//! single scalar field at the root of an operation has depth 0.

use crate::selection::{FragmentTable, SelectionNode};

/// Fields starting with this marker describe the schema itself and are not counted.
pub const INTROSPECTION_PREFIX: &str = "__";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("Fragment {0} not found")]
    UnresolvedFragment(String),
    #[error("Fragment {0} spreads itself")]
    FragmentCycle(String),
}

/// Computes the depth of `node`, resolving spreads through `fragments`.
pub fn analyze(node: &SelectionNode, fragments: &FragmentTable) -> Result<usize, AnalysisError> {
    let mut expanding = Vec::new();
    depth_of(node, fragments, 0, &mut expanding)
}

fn depth_of<'a>(
    node: &'a SelectionNode,
    fragments: &'a FragmentTable,
    depth: usize,
    expanding: &mut Vec<&'a str>,
) -> Result<usize, AnalysisError> {
    match node {
        SelectionNode::Field { name, selection } => {
            if name.starts_with(INTROSPECTION_PREFIX) || selection.is_empty() {
                return Ok(depth);
            }

            max_depth(selection, fragments, depth + 1, expanding)
        }
        SelectionNode::FragmentSpread { name } => {
            let fragment = fragments
                .get(name)
                .ok_or_else(|| AnalysisError::UnresolvedFragment(name.clone()))?;

            if expanding.contains(&name.as_str()) {
                return Err(AnalysisError::FragmentCycle(name.clone()));
            }

            expanding.push(name);
            let result = depth_of(fragment, fragments, depth, expanding);
            expanding.pop();

            result
        }
        SelectionNode::InlineFragment { selection, .. } | SelectionNode::OperationRoot { selection } => {
            max_depth(selection, fragments, depth, expanding)
        }
    }
}

fn max_depth<'a>(
    selection: &'a [SelectionNode],
    fragments: &'a FragmentTable,
    depth: usize,
    expanding: &mut Vec<&'a str>,
) -> Result<usize, AnalysisError> {
    // An empty selection is not valid GraphQL, it adds nothing.
    let mut max = depth;

    for child in selection {
        max = max.max(depth_of(child, fragments, depth, expanding)?);
    }

    Ok(max)
}
