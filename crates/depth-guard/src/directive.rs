use std::{collections::HashMap, num::NonZeroUsize};

use cynic_parser::{
    type_system::{iter::Iter, Definition, FieldDefinition, TypeDefinition},
    ConstValue,
};

/// Definition to add to a schema declaring per-field depth limits.
pub const DEPTH_LIMIT_DIRECTIVE: &str = "directive @depthLimit(limit: Int!, message: String) on FIELD_DEFINITION";

const DIRECTIVE_NAME: &str = "depthLimit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthLimit {
    limit: NonZeroUsize,
    message: Option<String>,
}

impl DepthLimit {
    pub fn new(limit: NonZeroUsize) -> Self {
        Self { limit, message: None }
    }

    /// Replaces the default rejection message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn limit(&self) -> usize {
        self.limit.get()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DirectiveError {
    #[error("{0}")]
    Parse(String),
    #[error("@depthLimit on {type_name}.{field_name} is missing its limit")]
    MissingLimit { type_name: String, field_name: String },
    #[error("@depthLimit on {type_name}.{field_name} must have a positive integer limit")]
    InvalidLimit { type_name: String, field_name: String },
    #[error("@depthLimit on {type_name}.{field_name} must have a string message")]
    InvalidMessage { type_name: String, field_name: String },
}

/// Explicit depth limits, by parent type and field name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldLimits(HashMap<String, HashMap<String, DepthLimit>>);

impl FieldLimits {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads every `@depthLimit` applied to a field of an object or interface type, type
    /// extensions included.
    pub fn from_sdl(sdl: &str) -> Result<Self, DirectiveError> {
        let document =
            cynic_parser::parse_type_system_document(sdl).map_err(|err| DirectiveError::Parse(err.to_string()))?;

        let mut limits = Self::new();

        for definition in document.definitions() {
            let (Definition::Type(ty) | Definition::TypeExtension(ty)) = definition else {
                continue;
            };

            match ty {
                TypeDefinition::Object(object) => limits.ingest_fields(object.name(), object.fields())?,
                TypeDefinition::Interface(interface) => limits.ingest_fields(interface.name(), interface.fields())?,
                _ => (),
            }
        }

        Ok(limits)
    }

    fn ingest_fields(&mut self, type_name: &str, fields: Iter<'_, FieldDefinition<'_>>) -> Result<(), DirectiveError> {
        for field in fields {
            let Some(directive) = field.directives().find(|directive| directive.name() == DIRECTIVE_NAME) else {
                continue;
            };

            let mut limit = None;
            let mut message = None;

            for argument in directive.arguments() {
                match (argument.name(), argument.value()) {
                    ("limit", ConstValue::Int(value)) => {
                        let value = usize::try_from(value.as_i64())
                            .ok()
                            .and_then(NonZeroUsize::new)
                            .ok_or_else(|| DirectiveError::InvalidLimit {
                                type_name: type_name.to_string(),
                                field_name: field.name().to_string(),
                            })?;

                        limit = Some(value);
                    }
                    ("limit", _) => {
                        return Err(DirectiveError::InvalidLimit {
                            type_name: type_name.to_string(),
                            field_name: field.name().to_string(),
                        })
                    }
                    ("message", ConstValue::String(value)) => message = Some(value.as_str().to_string()),
                    ("message", ConstValue::Null(_)) => (),
                    ("message", _) => {
                        return Err(DirectiveError::InvalidMessage {
                            type_name: type_name.to_string(),
                            field_name: field.name().to_string(),
                        })
                    }
                    _ => (),
                }
            }

            let limit = limit.ok_or_else(|| DirectiveError::MissingLimit {
                type_name: type_name.to_string(),
                field_name: field.name().to_string(),
            })?;

            let mut depth_limit = DepthLimit::new(limit);

            if let Some(message) = message {
                depth_limit = depth_limit.with_message(message);
            }

            self.insert(type_name, field.name(), depth_limit);
        }

        Ok(())
    }

    pub fn insert(&mut self, type_name: impl Into<String>, field_name: impl Into<String>, limit: DepthLimit) {
        self.0
            .entry(type_name.into())
            .or_default()
            .insert(field_name.into(), limit);
    }

    pub fn get(&self, type_name: &str, field_name: &str) -> Option<&DepthLimit> {
        self.0.get(type_name).and_then(|fields| fields.get(field_name))
    }

    pub fn len(&self) -> usize {
        self.0.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    fn limit(limit: usize) -> DepthLimit {
        DepthLimit::new(NonZeroUsize::new(limit).unwrap())
    }

    #[test]
    fn reads_limits_and_messages() {
        let sdl = indoc! {r#"
            directive @depthLimit(limit: Int!, message: String) on FIELD_DEFINITION

            type Query {
              hello: String @depthLimit(limit: 3)
              userDetails: User @depthLimit(limit: 2, message: "Too deep, try fewer nested posts")
              me: User
            }

            type User {
              name: String
              posts: [Post!]!
            }

            interface Node {
              children: [Node!]! @depthLimit(limit: 4)
            }

            extend type Query {
              feed: [Post!]! @depthLimit(limit: 5)
            }
        "#};

        let limits = FieldLimits::from_sdl(sdl).unwrap();

        assert_eq!(4, limits.len());
        assert_eq!(Some(&limit(3)), limits.get("Query", "hello"));
        assert_eq!(
            Some(&limit(2).with_message("Too deep, try fewer nested posts")),
            limits.get("Query", "userDetails")
        );
        assert_eq!(Some(&limit(4)), limits.get("Node", "children"));
        assert_eq!(Some(&limit(5)), limits.get("Query", "feed"));
        assert_eq!(None, limits.get("Query", "me"));
        assert_eq!(None, limits.get("User", "hello"));
    }

    #[test]
    fn directive_definition_parses() {
        let sdl = format!("{DEPTH_LIMIT_DIRECTIVE}\ntype Query {{ a: Int @depthLimit(limit: 1) }}");

        assert_eq!(1, FieldLimits::from_sdl(&sdl).unwrap().len());
    }

    #[test]
    fn other_directives_are_ignored() {
        let sdl = r#"type Query { a: Int @deprecated(reason: "no") }"#;

        assert!(FieldLimits::from_sdl(sdl).unwrap().is_empty());
    }

    #[test]
    fn zero_limit() {
        let sdl = "type Query { a: Int @depthLimit(limit: 0) }";

        let error = FieldLimits::from_sdl(sdl).unwrap_err();

        insta::assert_snapshot!(error, @"@depthLimit on Query.a must have a positive integer limit");
    }

    #[test]
    fn negative_limit() {
        let sdl = "type Query { a: Int @depthLimit(limit: -2) }";

        assert!(matches!(
            FieldLimits::from_sdl(sdl),
            Err(DirectiveError::InvalidLimit { .. })
        ));
    }

    #[test]
    fn missing_limit() {
        let sdl = r#"type Query { a: Int @depthLimit(message: "nope") }"#;

        assert_eq!(
            Err(DirectiveError::MissingLimit {
                type_name: String::from("Query"),
                field_name: String::from("a"),
            }),
            FieldLimits::from_sdl(sdl)
        );
    }

    #[test]
    fn string_limit() {
        let sdl = r#"type Query { a: Int @depthLimit(limit: "3") }"#;

        assert!(matches!(
            FieldLimits::from_sdl(sdl),
            Err(DirectiveError::InvalidLimit { .. })
        ));
    }

    #[test]
    fn invalid_sdl() {
        assert!(matches!(
            FieldLimits::from_sdl("type Query {"),
            Err(DirectiveError::Parse(_))
        ));
    }
}
