//! Tool discovery cascade and cache.

pub mod cache;
pub mod discovery;

pub use cache::{CachedTools, DiscoveryMethod, ToolCache, DEFAULT_TTL, STATIC_TTL};
pub use discovery::{
    DiscoverOptions, Discovery, ToolManager, HTTP_PROBE_TIMEOUT, STDIO_PROBE_TIMEOUT,
};
