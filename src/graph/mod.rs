//! Task graph construction.
//!
//! A session classification maps to a fixed directed acyclic graph of
//! [`TaskNode`]s. Each node names its upstream dependencies (with the
//! upstream states each edge accepts) and the datasets it is expected to
//! produce.

pub mod builder;
pub mod dag;
pub mod node;
pub mod pattern;

pub use builder::{spike_sync_name, TaskGraphBuilder};
pub use dag::TaskGraph;
pub use node::{Dependency, DependencyPolicy, OutputSpec, ResourceClass, TaskNode, TaskStatus};
pub use pattern::OutputPattern;
