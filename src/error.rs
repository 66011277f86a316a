//! Error types for the orchestrator

use thiserror::Error;

use crate::catalog::CatalogError;
use crate::cluster::ClusterError;
use crate::graph::GraphError;
use crate::state::StateError;

/// Top-level error type, aggregating every subsystem's failures.
///
/// Most orchestrator operations report per-resource failures through
/// [`crate::orchestrator::RunReport`] rather than `Err`; this type
/// surfaces the failures that make a run impossible to start or finish
/// (an unbuildable plan, an unreadable state store, a broken catalog).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The dependency graph could not be turned into a plan
    #[error("dependency graph error: {0}")]
    Graph(#[from] GraphError),

    /// A catalog template failed to render
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// A cluster call failed
    #[error("cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// The state store could not be read or written
    #[error("state store error: {0}")]
    State(#[from] StateError),
}
