//! HTTP handlers for the table endpoints.

pub mod endpoint;
pub use endpoint::*;
