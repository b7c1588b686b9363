//! Agents: descriptors, invocation backends, and the registry
//!
//! An agent pairs an immutable [`AgentDescriptor`] with an [`AgentBackend`]
//! variant that performs its capabilities. The [`AgentRegistry`] is built once
//! at startup and shared read-only with the dispatcher.

pub mod backend;
pub mod descriptor;
pub mod registry;

pub use backend::{Agent, AgentBackend, SUMMARIZE};
pub use descriptor::AgentDescriptor;
pub use registry::AgentRegistry;
