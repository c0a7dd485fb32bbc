//! Response depth limiting for GraphQL operations.
//!
//! Fields declare how deep the operation resolving them may be with `@depthLimit`, a global
//! limit covers every other field. The depth of an operation is computed once per request and
//! memoized in an [`runtime::cache::ExpiringCache`] across requests.

mod analyzer;
mod directive;
mod enforcer;
mod error;
mod key;
mod selection;

pub use analyzer::{analyze, AnalysisError, INTROSPECTION_PREFIX};
pub use directive::{DepthLimit, DirectiveError, FieldLimits, DEPTH_LIMIT_DIRECTIVE};
pub use enforcer::{DepthLimitViolation, DepthLimiter, RequestContext};
pub use error::{ErrorCode, GraphqlError};
pub use key::{derive_key, CacheKey, KeyOptions};
pub use selection::{FragmentTable, OperationError, ParsedOperation, SelectionNode};
