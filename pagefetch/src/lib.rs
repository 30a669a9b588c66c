//! Pagefetch - resource-fetch core for a text-mode web browser
//!
//! This library provides the pieces a browser front end builds on to get
//! bytes from the network into reusable, shareable cache entries:
//!
//! - [`cache`]: content cache with fragment reassembly, explicit lock
//!   counting, and LRU eviction
//! - [`pipeline`]: priority-scheduled download pipeline over a bounded
//!   per-host connection pool, with pluggable cache policy
//! - [`auth`]: HTTP authentication manager (RFC 2617 Digest, Basic fallback)
//! - [`transport`]: the seam between the pipeline and whatever moves bytes;
//!   includes an HTTP adapter built on reqwest
//!
//! Rendering, parsing, scripting bindings, and configuration loading are
//! collaborators that live elsewhere and talk to this crate through
//! [`cache::EntryLock`] and [`pipeline::Pipeline::fetch`].

pub mod auth;
pub mod cache;
pub mod error;
pub mod pipeline;
pub mod transport;
pub mod uri;

pub use cache::{CacheMode, CacheRegistry, EntryHandle, EntryLock, RegistryConfig};
pub use error::FetchError;
pub use pipeline::{
    FetchCallback, FetchHandle, FetchOutcome, Pipeline, PipelineConfig, Priority, TaskId,
    TaskState,
};
pub use uri::ResourceId;
