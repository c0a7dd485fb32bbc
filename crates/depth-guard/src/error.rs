use serde::ser::SerializeMap;
use serde_json::{Map, Value};

use crate::{analyzer::AnalysisError, selection::OperationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, strum::Display, strum::AsRefStr, strum::EnumIter)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum ErrorCode {
    BadRequest,
    OperationParsingError,
    OperationValidationError,
    // Depth limits
    RateLimited,
    InternalServerError,
}

impl ErrorCode {
    pub fn status_code(self) -> http::StatusCode {
        match self {
            ErrorCode::BadRequest | ErrorCode::OperationParsingError | ErrorCode::OperationValidationError => {
                http::StatusCode::BAD_REQUEST
            }
            ErrorCode::RateLimited => http::StatusCode::TOO_MANY_REQUESTS,
            ErrorCode::InternalServerError => http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// A client-facing error, serialized in the shape of a GraphQL response error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct GraphqlError {
    pub message: String,
    pub code: ErrorCode,
    /// Additional extensions, `code` and `http` are always added when serializing.
    pub extensions: Map<String, Value>,
}

impl GraphqlError {
    pub fn new(message: impl Into<String>, code: ErrorCode) -> Self {
        Self {
            message: message.into(),
            code,
            extensions: Map::new(),
        }
    }

    #[must_use]
    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }

    pub fn status_code(&self) -> http::StatusCode {
        self.code.status_code()
    }
}

impl serde::Serialize for GraphqlError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut extensions = Map::with_capacity(self.extensions.len() + 2);
        extensions.insert(String::from("code"), Value::from(self.code.as_ref()));
        extensions.insert(
            String::from("http"),
            serde_json::json!({ "status": self.status_code().as_u16() }),
        );

        for (key, value) in &self.extensions {
            extensions.insert(key.clone(), value.clone());
        }

        let mut map = serializer.serialize_map(Some(2))?;
        map.serialize_entry("message", &self.message)?;
        map.serialize_entry("extensions", &extensions)?;
        map.end()
    }
}

impl From<OperationError> for GraphqlError {
    fn from(error: OperationError) -> Self {
        GraphqlError::new(error.to_string(), ErrorCode::OperationParsingError)
    }
}

impl From<AnalysisError> for GraphqlError {
    fn from(error: AnalysisError) -> Self {
        GraphqlError::new(error.to_string(), ErrorCode::OperationValidationError)
    }
}
