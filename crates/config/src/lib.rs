mod depth_cache;

use std::num::NonZeroU16;

pub use depth_cache::*;

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
/// Configuration of the depth guard.
pub struct Config {
    /// Depth limit applied to every field without its own `@depthLimit`.
    /// Fields are unrestricted when neither is set.
    pub global_limit: Option<NonZeroU16>,
    /// Memoization of computed depths
    pub cache: DepthCacheConfig,
}

impl Config {
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }
}
