//! Stateful, specification-driven HTTP mock server.
//!
//! An operator supplies an OpenAPI 3.0/3.1 document plus a declarative
//! scenarios file; the server matches each request against an operation,
//! runs the matching rules (side-effecting actions against per-session
//! state), renders a literal, templated, or schema-generated response, and
//! validates both directions against the specification.

pub mod config;
pub mod error;
pub mod pipeline;
pub mod rules;
pub mod schema;
pub mod server;
pub mod spec;
pub mod store;
pub mod template;

pub use config::SandboxConfig;
pub use pipeline::{Sandbox, SandboxRequest, SandboxResponse};
pub use server::SandboxServer;
