//! Dependency graph builder
//!
//! Derives a deterministic application order from declared relationships
//! between resources. A Custom Resource instance depends on its CRD being
//! Established; an operator Deployment depends on its RBAC objects. The
//! builder turns those declared edges into an [`InstallationPlan`] via a
//! topological sort, rejecting cycles and edges that reference unknown
//! resources before any cluster mutation is attempted.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity of a resource within a plan: kind + optional namespace + name.
///
/// Cluster-scoped resources (CRDs, ClusterRoles) have no namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    /// Kubernetes kind, e.g. `CustomResourceDefinition` or `CephBlockPool`
    pub kind: String,
    /// Namespace, or `None` for cluster-scoped resources
    pub namespace: Option<String>,
    /// Resource name
    pub name: String,
}

impl ResourceKey {
    /// Create a key for a cluster-scoped resource
    pub fn cluster_scoped(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            namespace: None,
            name: name.into(),
        }
    }

    /// Create a key for a namespaced resource
    pub fn namespaced(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// A manifest to render and apply: template name, parameters, and the
/// resource identity the rendering is expected to produce.
///
/// Immutable once built for a given apply attempt; specs are constructed
/// fresh each orchestration run from the catalog's current version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSpec {
    /// Name of the catalog template to render
    pub template: String,
    /// Template parameters, ordered for reproducible rendering
    pub params: BTreeMap<String, String>,
    /// Identity of the resource this spec produces
    pub key: ResourceKey,
}

impl ResourceSpec {
    /// Create a spec with no parameters
    pub fn new(template: impl Into<String>, key: ResourceKey) -> Self {
        Self {
            template: template.into(),
            params: BTreeMap::new(),
            key,
        }
    }

    /// Add a template parameter
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

/// Readiness a prerequisite must reach before a dependent may be applied.
///
/// Ordered by strength: `Exists < Established < Ready`. `Deleted` is a
/// removal requirement and only gates teardown ordering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Readiness {
    /// The resource has been accepted by the API server
    Exists,
    /// CRD readiness: the API server registered the schema and will
    /// accept instances of the kind
    Established,
    /// Workload readiness: the resource reports a Ready/Available condition
    Ready,
    /// The resource has been removed from the cluster
    Deleted,
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Readiness::Exists => "Exists",
            Readiness::Established => "Established",
            Readiness::Ready => "Ready",
            Readiness::Deleted => "Deleted",
        };
        write!(f, "{}", s)
    }
}

/// A directed dependency: `to` may not be applied until `from` has
/// reached `requirement`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyEdge {
    /// The prerequisite resource
    pub from: ResourceKey,
    /// The dependent resource
    pub to: ResourceKey,
    /// Readiness the prerequisite must reach
    pub requirement: Readiness,
}

impl DependencyEdge {
    /// Create an edge: `to` depends on `from` reaching `requirement`
    pub fn new(from: ResourceKey, to: ResourceKey, requirement: Readiness) -> Self {
        Self {
            from,
            to,
            requirement,
        }
    }
}

impl fmt::Display for DependencyEdge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {} ({})", self.from, self.to, self.requirement)
    }
}

/// Errors detected while building a plan. All are configuration errors:
/// fatal, surfaced before any apply, never retried.
#[derive(Debug, Error)]
pub enum GraphError {
    /// The edge set admits no topological order
    #[error("dependency cycle detected involving: {}", involved.iter().map(|k| k.to_string()).collect::<Vec<_>>().join(", "))]
    CycleDetected {
        /// Keys participating in (or downstream of) the cycle
        involved: Vec<ResourceKey>,
    },

    /// An edge references a resource key not present in the spec set
    #[error("dangling edge {edge}: unknown resource key {missing}")]
    DanglingEdge {
        /// The offending edge
        edge: DependencyEdge,
        /// The key the edge references that no spec declares
        missing: ResourceKey,
    },

    /// Two specs declare the same kind+namespace+name
    #[error("duplicate resource key: {key}")]
    DuplicateKey {
        /// The duplicated key
        key: ResourceKey,
    },
}

/// An ordered apply plan: specs in topological order plus the edge set,
/// with prerequisite and dependent lookups for the orchestrator.
#[derive(Clone, Debug)]
pub struct InstallationPlan {
    specs: Vec<ResourceSpec>,
    edges: Vec<DependencyEdge>,
    /// For each spec index, the (prerequisite index, requirement) pairs
    prerequisites: Vec<Vec<(usize, Readiness)>>,
    /// For each spec index, the indices of direct dependents
    dependents: Vec<Vec<usize>>,
}

impl InstallationPlan {
    /// Specs in apply order
    pub fn specs(&self) -> &[ResourceSpec] {
        &self.specs
    }

    /// Number of resources in the plan
    pub fn len(&self) -> usize {
        self.specs.len()
    }

    /// True if the plan contains no resources
    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// The declared edges
    pub fn edges(&self) -> &[DependencyEdge] {
        &self.edges
    }

    /// Prerequisites of the spec at `index`: (prerequisite index, requirement)
    pub fn prerequisites(&self, index: usize) -> &[(usize, Readiness)] {
        &self.prerequisites[index]
    }

    /// The strongest readiness any dependent requires of the spec at
    /// `index`, ignoring `Deleted` edges (those gate teardown, not apply).
    /// `Exists` when nothing depends on it.
    pub fn required_readiness(&self, index: usize) -> Readiness {
        let key = &self.specs[index].key;
        self.edges
            .iter()
            .filter(|e| &e.from == key && e.requirement != Readiness::Deleted)
            .map(|e| e.requirement)
            .max()
            .unwrap_or(Readiness::Exists)
    }

    /// Indices of all transitive dependents of the spec at `index`.
    ///
    /// Used by best-effort runs to skip exactly the subtree below a
    /// failed resource while unrelated branches continue.
    pub fn transitive_dependents(&self, index: usize) -> Vec<usize> {
        let mut seen = vec![false; self.specs.len()];
        let mut stack = vec![index];
        while let Some(i) = stack.pop() {
            for &d in &self.dependents[i] {
                if !seen[d] {
                    seen[d] = true;
                    stack.push(d);
                }
            }
        }
        seen.iter()
            .enumerate()
            .filter_map(|(i, &s)| s.then_some(i))
            .collect()
    }

    /// Position of a key in the plan, if present
    pub fn position(&self, key: &ResourceKey) -> Option<usize> {
        self.specs.iter().position(|s| &s.key == key)
    }
}

/// Build an [`InstallationPlan`] from specs and declared edges.
///
/// Kahn's algorithm with tie-break by declaration order in `specs`, so
/// the output is deterministic across runs: the same inputs always yield
/// the same plan, which keeps installs reproducible and plans testable.
///
/// Pure function; no side effects.
pub fn build(
    specs: Vec<ResourceSpec>,
    edges: Vec<DependencyEdge>,
) -> Result<InstallationPlan, GraphError> {
    // Reject duplicate keys up front
    let mut index_of: BTreeMap<&ResourceKey, usize> = BTreeMap::new();
    for (i, spec) in specs.iter().enumerate() {
        if index_of.insert(&spec.key, i).is_some() {
            return Err(GraphError::DuplicateKey {
                key: spec.key.clone(),
            });
        }
    }

    // Resolve edges to indices, rejecting references to unknown keys
    let n = specs.len();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut prerequisites: Vec<Vec<(usize, Readiness)>> = vec![Vec::new(); n];
    let mut in_degree = vec![0usize; n];

    for edge in &edges {
        let from = *index_of
            .get(&edge.from)
            .ok_or_else(|| GraphError::DanglingEdge {
                edge: edge.clone(),
                missing: edge.from.clone(),
            })?;
        let to = *index_of
            .get(&edge.to)
            .ok_or_else(|| GraphError::DanglingEdge {
                edge: edge.clone(),
                missing: edge.to.clone(),
            })?;
        dependents[from].push(to);
        prerequisites[to].push((from, edge.requirement));
        in_degree[to] += 1;
    }

    // Kahn's algorithm. The frontier is scanned in declaration order so
    // unrelated resources keep their input ordering.
    let mut order = Vec::with_capacity(n);
    let mut remaining: Vec<bool> = vec![true; n];
    let mut degree = in_degree;

    while order.len() < n {
        let next = (0..n).find(|&i| remaining[i] && degree[i] == 0);
        match next {
            Some(i) => {
                remaining[i] = false;
                order.push(i);
                for &d in &dependents[i] {
                    degree[d] -= 1;
                }
            }
            None => {
                // Everything left has in-degree > 0: a cycle
                let involved = (0..n)
                    .filter(|&i| remaining[i])
                    .map(|i| specs[i].key.clone())
                    .collect();
                return Err(GraphError::CycleDetected { involved });
            }
        }
    }

    // Re-index specs and adjacency into plan order
    let mut new_index = vec![0usize; n];
    for (pos, &old) in order.iter().enumerate() {
        new_index[old] = pos;
    }

    let mut plan_specs = Vec::with_capacity(n);
    let mut plan_prereqs = vec![Vec::new(); n];
    let mut plan_dependents = vec![Vec::new(); n];
    for (pos, &old) in order.iter().enumerate() {
        plan_specs.push(specs[old].clone());
        plan_prereqs[pos] = prerequisites[old]
            .iter()
            .map(|&(p, r)| (new_index[p], r))
            .collect();
        plan_dependents[pos] = dependents[old].iter().map(|&d| new_index[d]).collect();
    }

    Ok(InstallationPlan {
        specs: plan_specs,
        edges,
        prerequisites: plan_prereqs,
        dependents: plan_dependents,
    })
}
