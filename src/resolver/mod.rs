//! Dependency tracking: acyclic graph plus readiness decisions.

pub mod graph;
pub mod resolver;

pub use graph::DependencyGraph;
pub use resolver::{CompletionEffects, DependencyResolver};
