//! service-core: Shared infrastructure for the subscription workspace.
pub mod config;
pub mod error;
pub mod observability;

pub use tracing;
