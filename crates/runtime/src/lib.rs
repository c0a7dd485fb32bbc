pub mod cache;

/// Tracing target shared by every depth-guard crate.
pub const DEPTH_GUARD_TARGET: &str = "depth_guard";
