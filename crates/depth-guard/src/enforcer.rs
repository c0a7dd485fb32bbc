use std::{fmt, future::Future, num::NonZeroUsize, sync::Arc};

use depth_guard_config::Config;
use runtime::{cache::DepthCache, DEPTH_GUARD_TARGET};
use serde_json::{Map, Value};
use tokio::sync::OnceCell;

use crate::{
    analyzer::analyze,
    directive::FieldLimits,
    error::{ErrorCode, GraphqlError},
    key::{derive_key, KeyOptions},
    selection::ParsedOperation,
};

/// Everything the limiter knows about a request being resolved. Create one per request and
/// hand it to every field resolution of that request.
#[derive(Debug)]
pub struct RequestContext {
    operation: ParsedOperation,
    variables: Map<String, Value>,
    depth: OnceCell<usize>,
}

impl RequestContext {
    pub fn new(operation: ParsedOperation, variables: Map<String, Value>) -> Self {
        Self {
            operation,
            variables,
            depth: OnceCell::new(),
        }
    }

    pub fn parse(query: &str, operation_name: Option<&str>, variables: Map<String, Value>) -> Result<Self, GraphqlError> {
        let operation = ParsedOperation::parse(query, operation_name)?;
        Ok(Self::new(operation, variables))
    }

    pub fn operation(&self) -> &ParsedOperation {
        &self.operation
    }

    pub fn operation_name(&self) -> Option<&str> {
        self.operation.name.as_deref()
    }

    pub fn variables(&self) -> &Map<String, Value> {
        &self.variables
    }

    /// The depth, once a limited field of this request has been resolved.
    pub fn computed_depth(&self) -> Option<usize> {
        self.depth.get().copied()
    }
}

/// A rejected field, handed to the custom error handler.
#[derive(Debug, Clone, Copy)]
pub struct DepthLimitViolation<'a> {
    pub depth: usize,
    pub limit: usize,
    /// The field's custom message, or the default one.
    pub message: &'a str,
    pub is_global_limit: bool,
    pub parent_type: &'a str,
    pub field_name: &'a str,
    pub request: &'a RequestContext,
}

type ErrorHandler = Arc<dyn for<'a> Fn(DepthLimitViolation<'a>) -> GraphqlError + Send + Sync>;

/// Rejects requests deeper than the limit of the fields they resolve.
///
/// A field's own `@depthLimit` wins over the global limit, fields with neither are never
/// rejected. The depth of a request is computed at most once, on the first limited field, and
/// memoized in the configured cache across requests.
pub struct DepthLimiter {
    global_limit: Option<NonZeroUsize>,
    field_limits: FieldLimits,
    cache: Option<DepthCache>,
    key_options: KeyOptions,
    error_handler: Option<ErrorHandler>,
}

impl fmt::Debug for DepthLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DepthLimiter")
            .field("global_limit", &self.global_limit)
            .field("field_limits", &self.field_limits)
            .field("cache", &self.cache)
            .field("key_options", &self.key_options)
            .finish_non_exhaustive()
    }
}

struct ApplicableLimit<'a> {
    limit: usize,
    message: Option<&'a str>,
    is_global_limit: bool,
}

impl DepthLimiter {
    pub fn new(field_limits: FieldLimits) -> Self {
        Self {
            global_limit: None,
            field_limits,
            cache: None,
            key_options: KeyOptions::default(),
            error_handler: None,
        }
    }

    /// The cache is built separately, configured by `config.cache`.
    pub fn from_config(config: &Config, field_limits: FieldLimits, cache: Option<DepthCache>) -> Self {
        Self {
            global_limit: config.global_limit.map(NonZeroUsize::from),
            field_limits,
            cache,
            key_options: KeyOptions {
                hash_variable_values: config.cache.hash_variable_values,
            },
            error_handler: None,
        }
    }

    #[must_use]
    pub fn with_global_limit(mut self, limit: NonZeroUsize) -> Self {
        self.global_limit = Some(limit);
        self
    }

    #[must_use]
    pub fn with_cache(mut self, cache: DepthCache) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn with_key_options(mut self, key_options: KeyOptions) -> Self {
        self.key_options = key_options;
        self
    }

    /// Replaces the default error of rejected fields.
    #[must_use]
    pub fn with_error_handler(
        mut self,
        handler: impl for<'a> Fn(DepthLimitViolation<'a>) -> GraphqlError + Send + Sync + 'static,
    ) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    /// Whether resolving this field goes through a depth check at all.
    pub fn is_limited(&self, parent_type: &str, field_name: &str) -> bool {
        self.applicable_limit(parent_type, field_name).is_some()
    }

    /// Checks the depth of the request against the limit of the field, then resolves it.
    pub async fn resolve<T, F>(
        &self,
        request: &RequestContext,
        parent_type: &str,
        field_name: &str,
        resolver: F,
    ) -> Result<T, GraphqlError>
    where
        F: Future<Output = Result<T, GraphqlError>>,
    {
        self.check(request, parent_type, field_name).await?;
        resolver.await
    }

    pub async fn check(&self, request: &RequestContext, parent_type: &str, field_name: &str) -> Result<(), GraphqlError> {
        let Some(applicable) = self.applicable_limit(parent_type, field_name) else {
            return Ok(());
        };

        let depth = self.depth(request).await?;

        if depth <= applicable.limit {
            return Ok(());
        }

        let default_message;

        let message = match applicable.message {
            Some(message) => message,
            None => {
                default_message = if applicable.is_global_limit {
                    format!("Response depth exceeds global limit of {}", applicable.limit)
                } else {
                    format!("Response depth exceeds limit of {}", applicable.limit)
                };

                &default_message
            }
        };

        tracing::debug!(
            target: DEPTH_GUARD_TARGET,
            "rejecting {parent_type}.{field_name}: depth {depth} exceeds limit {}",
            applicable.limit
        );

        let violation = DepthLimitViolation {
            depth,
            limit: applicable.limit,
            message,
            is_global_limit: applicable.is_global_limit,
            parent_type,
            field_name,
            request,
        };

        Err(match &self.error_handler {
            Some(handler) => handler(violation),
            None => GraphqlError::new(message, ErrorCode::RateLimited),
        })
    }

    /// The depth of the request, computed or read from the cache on the first call.
    pub async fn depth(&self, request: &RequestContext) -> Result<usize, GraphqlError> {
        request
            .depth
            .get_or_try_init(|| self.compute_depth(request))
            .await
            .copied()
    }

    async fn compute_depth(&self, request: &RequestContext) -> Result<usize, GraphqlError> {
        let operation = &request.operation;

        let Some(cache) = &self.cache else {
            return Ok(analyze(&operation.root, &operation.fragments)?);
        };

        let key = derive_key(
            operation.name.as_deref(),
            &request.variables,
            &operation.root,
            &operation.fragments,
            self.key_options,
        );

        match cache.get(key.as_str()).await {
            Ok(Some(depth)) => {
                tracing::debug!(target: DEPTH_GUARD_TARGET, "depth cache hit for {key}: {depth}");
                return Ok(depth);
            }
            Ok(None) => tracing::debug!(target: DEPTH_GUARD_TARGET, "depth cache miss for {key}"),
            Err(error) => {
                tracing::warn!(target: DEPTH_GUARD_TARGET, "depth cache unavailable, computing the depth: {error}");
            }
        }

        let depth = analyze(&operation.root, &operation.fragments)?;
        tracing::debug!(target: DEPTH_GUARD_TARGET, "computed depth {depth} for {key}");

        if let Err(error) = cache.set(key.as_str(), depth).await {
            tracing::warn!(target: DEPTH_GUARD_TARGET, "could not store the computed depth: {error}");
        }

        Ok(depth)
    }

    fn applicable_limit(&self, parent_type: &str, field_name: &str) -> Option<ApplicableLimit<'_>> {
        if let Some(limit) = self.field_limits.get(parent_type, field_name) {
            return Some(ApplicableLimit {
                limit: limit.limit(),
                message: limit.message(),
                is_global_limit: false,
            });
        }

        self.global_limit.map(|limit| ApplicableLimit {
            limit: limit.get(),
            message: None,
            is_global_limit: true,
        })
    }
}
