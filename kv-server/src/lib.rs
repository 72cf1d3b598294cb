//! `tidekv-server`: the HTTP surface of the tidekv engine.
//!
//! Routing, path-encoded key parsing, SSE change/queue streams, config
//! loading, and the background sweepers live here; all storage semantics
//! live in the `tidekv` crate.

pub mod config;
pub mod error;
pub mod path;
pub mod routes;
pub mod sweep;
pub mod trace;
