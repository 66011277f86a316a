//! Reef - dependency-ordered installer for Kubernetes manifest catalogs
//!
//! Reef turns a catalog of manifest templates plus a set of dependency
//! declarations into an executed installation: it renders each resource,
//! orders the set so nothing is applied before what it depends on, applies
//! through the cluster API with bounded retry, waits for the readiness each
//! dependent requires, and records everything in a durable state store so
//! re-runs are idempotent and interrupted runs resume where they left off.
//!
//! The canonical workload is CRD-heavy catalogs (Rook/Ceph and similar),
//! where a custom resource instance must not be applied until the CRD that
//! defines it is `Established`, but nothing in the engine is specific to
//! any schema: documents are opaque bytes keyed by `kind/namespace/name`.
//!
//! # Modules
//!
//! - [`graph`] - Resource identities, dependency edges, and topological planning
//! - [`catalog`] - Named manifest templates rendered with parameters
//! - [`cluster`] - The cluster API seam: apply, observe status, delete
//! - [`state`] - Durable per-resource reconciliation records
//! - [`orchestrator`] - The engine that drives plans against a cluster
//! - [`retry`] - Bounded exponential backoff for transient failures
//! - [`error`] - Top-level error aggregation
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use reef::catalog::TemplateCatalog;
//! use reef::graph::{build, DependencyEdge, Readiness, ResourceKey, ResourceSpec};
//! use reef::orchestrator::{Orchestrator, OrchestratorConfig};
//! use reef::state::MemoryStateStore;
//!
//! # async fn run(cluster: Arc<dyn reef::cluster::ClusterClient>) -> reef::Result<()> {
//! let mut catalog = TemplateCatalog::new()?;
//! catalog.add_template(
//!     "pool",
//!     "apiVersion: ceph.rook.io/v1\nkind: CephBlockPool\nmetadata:\n  name: ${params.name}\n  namespace: rook-ceph\n",
//! )?;
//!
//! let crd = ResourceKey::cluster_scoped("CustomResourceDefinition", "cephblockpools.ceph.rook.io");
//! let pool = ResourceKey::namespaced("CephBlockPool", "rook-ceph", "my-pool");
//! let plan = build(
//!     vec![
//!         ResourceSpec::new("pool-crd", crd.clone()),
//!         ResourceSpec::new("pool", pool.clone()).with_param("name", "my-pool"),
//!     ],
//!     vec![DependencyEdge::new(crd, pool, Readiness::Established)],
//! )?;
//!
//! let orchestrator = Orchestrator::new(OrchestratorConfig::install());
//! let report = orchestrator
//!     .run(&plan, Arc::new(catalog), cluster, Arc::new(MemoryStateStore::new()))
//!     .await;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]

pub mod catalog;
pub mod cluster;
pub mod error;
pub mod graph;
pub mod orchestrator;
pub mod retry;
pub mod state;

pub use error::Error;

/// Convenience result type for orchestrator operations
pub type Result<T> = std::result::Result<T, Error>;

use std::time::Duration;

/// Maximum concurrent apply workers unless overridden
pub const DEFAULT_APPLY_CONCURRENCY: usize = 4;

/// Default budget for readiness polling per resource
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(120);

/// Default interval between readiness polls
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);
