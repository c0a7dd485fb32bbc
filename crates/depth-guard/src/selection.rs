use std::collections::{hash_map, HashMap};

use cynic_parser::executable::{ExecutableDefinition, Iter, OperationDefinition, Selection};

/// A node of an operation's selection graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SelectionNode {
    /// A field, a leaf when its selection is empty.
    Field { name: String, selection: Vec<SelectionNode> },
    /// Reference into the [`FragmentTable`].
    FragmentSpread { name: String },
    InlineFragment {
        type_condition: Option<String>,
        selection: Vec<SelectionNode>,
    },
    OperationRoot { selection: Vec<SelectionNode> },
}

impl SelectionNode {
    pub fn field(name: impl Into<String>, selection: impl IntoIterator<Item = SelectionNode>) -> Self {
        Self::Field {
            name: name.into(),
            selection: selection.into_iter().collect(),
        }
    }

    pub fn leaf(name: impl Into<String>) -> Self {
        Self::field(name, Vec::new())
    }

    pub fn spread(name: impl Into<String>) -> Self {
        Self::FragmentSpread { name: name.into() }
    }

    pub fn inline(type_condition: Option<&str>, selection: impl IntoIterator<Item = SelectionNode>) -> Self {
        Self::InlineFragment {
            type_condition: type_condition.map(str::to_string),
            selection: selection.into_iter().collect(),
        }
    }

    pub fn root(selection: impl IntoIterator<Item = SelectionNode>) -> Self {
        Self::OperationRoot {
            selection: selection.into_iter().collect(),
        }
    }

    /// Direct children, always empty for a spread.
    pub fn selection(&self) -> &[SelectionNode] {
        match self {
            Self::Field { selection, .. }
            | Self::InlineFragment { selection, .. }
            | Self::OperationRoot { selection } => selection,
            Self::FragmentSpread { .. } => &[],
        }
    }
}

/// Named fragments of a document. A fragment is stored as the inline fragment it stands for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FragmentTable(HashMap<String, SelectionNode>);

impl FragmentTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces any fragment previously registered with the same name.
    pub fn insert(
        &mut self,
        name: impl Into<String>,
        type_condition: impl Into<String>,
        selection: impl IntoIterator<Item = SelectionNode>,
    ) {
        let fragment = SelectionNode::InlineFragment {
            type_condition: Some(type_condition.into()),
            selection: selection.into_iter().collect(),
        };

        self.0.insert(name.into(), fragment);
    }

    pub fn get(&self, name: &str) -> Option<&SelectionNode> {
        self.0.get(name)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> hash_map::Iter<'_, String, SelectionNode> {
        self.0.iter()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum OperationError {
    #[error("{0}")]
    Syntax(String),
    #[error("The document does not contain any operation")]
    MissingOperation,
    #[error("Unknown operation named '{0}'")]
    UnknownOperation(String),
    #[error("Missing operation name, the document contains several operations")]
    AmbiguousOperation,
    #[error("Fragment '{0}' is defined more than once")]
    DuplicateFragment(String),
}

/// The operation of a request, with everything the depth analysis needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedOperation {
    pub name: Option<String>,
    pub root: SelectionNode,
    pub fragments: FragmentTable,
}

impl ParsedOperation {
    /// Parses `query` and selects the operation to execute: the one named `operation_name`, or
    /// the only operation of the document.
    pub fn parse(query: &str, operation_name: Option<&str>) -> Result<Self, OperationError> {
        let document =
            cynic_parser::parse_executable_document(query).map_err(|err| OperationError::Syntax(err.to_string()))?;

        let mut operations = Vec::new();
        let mut fragments = FragmentTable::new();

        for definition in document.definitions() {
            match definition {
                ExecutableDefinition::Operation(operation) => operations.push(operation),
                ExecutableDefinition::Fragment(fragment) => {
                    if fragments.get(fragment.name()).is_some() {
                        return Err(OperationError::DuplicateFragment(fragment.name().to_string()));
                    }

                    fragments.insert(
                        fragment.name(),
                        fragment.type_condition(),
                        convert_selection_set(fragment.selection_set()),
                    );
                }
            }
        }

        let operation = select_operation(operations, operation_name)?;

        Ok(Self {
            name: operation.name().map(str::to_string),
            root: SelectionNode::root(convert_selection_set(operation.selection_set())),
            fragments,
        })
    }
}

fn select_operation<'a>(
    operations: Vec<OperationDefinition<'a>>,
    operation_name: Option<&str>,
) -> Result<OperationDefinition<'a>, OperationError> {
    match operation_name {
        Some(name) => operations
            .into_iter()
            .find(|operation| operation.name() == Some(name))
            .ok_or_else(|| OperationError::UnknownOperation(name.to_string())),
        None => {
            let mut operations = operations.into_iter();

            match (operations.next(), operations.next()) {
                (Some(operation), None) => Ok(operation),
                (None, _) => Err(OperationError::MissingOperation),
                (Some(_), Some(_)) => Err(OperationError::AmbiguousOperation),
            }
        }
    }
}

fn convert_selection_set(selection_set: Iter<'_, Selection<'_>>) -> Vec<SelectionNode> {
    selection_set
        .map(|selection| match selection {
            Selection::Field(field) => SelectionNode::field(field.name(), convert_selection_set(field.selection_set())),
            Selection::InlineFragment(fragment) => {
                SelectionNode::inline(fragment.type_condition(), convert_selection_set(fragment.selection_set()))
            }
            Selection::FragmentSpread(spread) => SelectionNode::spread(spread.fragment_name()),
        })
        .collect()
}
