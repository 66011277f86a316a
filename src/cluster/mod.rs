//! Cluster client adapter
//!
//! Thin adapter between the orchestrator and the Kubernetes API. The
//! orchestrator stays schema-agnostic: documents are applied as untyped
//! [`DynamicObject`]s via server-side apply, and readiness is read from
//! the generic condition/phase shapes (`Established` for CRDs,
//! `Ready`/`Available` for workloads) without deserializing the body.
//!
//! The [`ClusterClient`] trait is the seam for tests: the orchestrator is
//! exercised against a mock, the real [`KubeClusterClient`] is only glue.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, DynamicObject, Patch, PatchParams};
use kube::discovery::{ApiResource, Discovery};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use thiserror::Error;
use tracing::{debug, info};

use crate::catalog::Document;
use crate::graph::{Readiness, ResourceKey};

/// Field manager used for server-side apply
const FIELD_MANAGER: &str = "reef-orchestrator";

/// Metadata returned from a successful apply
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppliedMeta {
    /// Generation of the live object after the apply, when reported
    pub generation: Option<i64>,
}

/// Status observed on the live cluster for one resource
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ObservedStatus {
    /// The resource does not exist
    Absent,
    /// The resource exists
    Present {
        /// CRD `Established` condition is True
        established: bool,
        /// `Ready`/`Available` condition is True, or phase reports ready
        ready: bool,
        /// Generation of the live object, when reported
        generation: Option<i64>,
    },
}

impl ObservedStatus {
    /// Whether this status satisfies a dependency requirement
    pub fn satisfies(&self, requirement: Readiness) -> bool {
        match (self, requirement) {
            (ObservedStatus::Absent, Readiness::Deleted) => true,
            (ObservedStatus::Absent, _) => false,
            (ObservedStatus::Present { .. }, Readiness::Exists) => true,
            (ObservedStatus::Present { established, .. }, Readiness::Established) => *established,
            (ObservedStatus::Present { ready, .. }, Readiness::Ready) => *ready,
            (ObservedStatus::Present { .. }, Readiness::Deleted) => false,
        }
    }
}

/// Errors from cluster operations. Each carries the offending resource
/// key and classifies itself as transient (retryable with backoff) or
/// terminal (rejection; never retried).
#[derive(Debug, Error)]
pub enum ClusterError {
    /// The Kubernetes API rejected or failed the call
    #[error("api error for {key}: {source}")]
    Api {
        /// The resource the call was for
        key: ResourceKey,
        /// Underlying kube error
        #[source]
        source: kube::Error,
    },

    /// API discovery could not resolve the resource's kind
    #[error("discovery failed for {key}: {message}")]
    Discovery {
        /// The resource being resolved
        key: ResourceKey,
        /// What went wrong
        message: String,
    },

    /// The rendered document could not be converted for the API call
    #[error("invalid document for {key}: {reason}")]
    InvalidDocument {
        /// The resource the document declares
        key: ResourceKey,
        /// What was malformed
        reason: String,
    },
}

impl ClusterError {
    /// Whether retrying with backoff may succeed.
    ///
    /// Server overload and transport failures are transient; schema
    /// rejections, permission denials, and conflicts are not.
    pub fn is_transient(&self) -> bool {
        match self {
            ClusterError::Api { source, .. } => match source {
                kube::Error::Api(resp) => transient_code(resp.code),
                // Transport, timeout, and connection classes
                _ => true,
            },
            ClusterError::Discovery { .. } => true,
            ClusterError::InvalidDocument { .. } => false,
        }
    }

    /// The resource key the error is about
    pub fn key(&self) -> &ResourceKey {
        match self {
            ClusterError::Api { key, .. }
            | ClusterError::Discovery { key, .. }
            | ClusterError::InvalidDocument { key, .. } => key,
        }
    }
}

impl crate::retry::TransientError for ClusterError {
    fn is_transient(&self) -> bool {
        ClusterError::is_transient(self)
    }
}

/// HTTP status codes worth retrying: throttling, server errors, timeouts.
/// 403/404/409/422 are rejections and terminal for the resource.
fn transient_code(code: u16) -> bool {
    matches!(code, 408 | 429) || code >= 500
}

/// Kubernetes-API-compatible verbs the orchestrator needs.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Apply a rendered document (create-or-update semantics)
    async fn apply(&self, doc: &Document) -> Result<AppliedMeta, ClusterError>;

    /// Observe the current status of a resource
    async fn status(&self, key: &ResourceKey) -> Result<ObservedStatus, ClusterError>;

    /// Delete a resource; succeeds if it is already absent
    async fn delete(&self, key: &ResourceKey) -> Result<(), ClusterError>;
}

/// Real client over the Kubernetes API using discovery + DynamicObject.
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    /// Wrap a connected kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Resolve the ApiResource for a kind via API discovery.
    ///
    /// `api_version` narrows the match when known (apply path); status
    /// and delete resolve by kind alone. Falls back to static
    /// pluralization when discovery has not yet caught up with a freshly
    /// installed CRD.
    async fn discover(
        &self,
        key: &ResourceKey,
        api_version: Option<&str>,
    ) -> Result<Option<ApiResource>, ClusterError> {
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| ClusterError::Discovery {
                key: key.clone(),
                message: e.to_string(),
            })?;

        let wanted = api_version.map(parse_api_version);
        for group in discovery.groups() {
            if let Some((g, _)) = wanted {
                if group.name() != g {
                    continue;
                }
            }
            for (ar, _caps) in group.recommended_resources() {
                if ar.kind != key.kind {
                    continue;
                }
                if let Some((_, v)) = wanted {
                    if ar.version != v {
                        continue;
                    }
                }
                return Ok(Some(ar.clone()));
            }
        }

        // Discovery cache can lag a just-established CRD; construct the
        // resource manually when the caller knows the apiVersion.
        if let Some(api_version) = api_version {
            let (group, version) = parse_api_version(api_version);
            debug!(
                kind = %key.kind,
                api_version = %api_version,
                "kind not in discovery, using fallback pluralization"
            );
            return Ok(Some(ApiResource {
                group: group.to_string(),
                version: version.to_string(),
                api_version: api_version.to_string(),
                kind: key.kind.clone(),
                plural: pluralize_kind(&key.kind),
            }));
        }

        Ok(None)
    }

    fn api_for(&self, key: &ResourceKey, ar: &ApiResource) -> Api<DynamicObject> {
        match &key.namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, ar),
            None => Api::all_with(self.client.clone(), ar),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn apply(&self, doc: &Document) -> Result<AppliedMeta, ClusterError> {
        let key = &doc.key;
        let value: serde_json::Value =
            serde_yaml::from_str(doc.content()).map_err(|e| ClusterError::InvalidDocument {
                key: key.clone(),
                reason: e.to_string(),
            })?;

        let ar = self
            .discover(key, Some(&doc.api_version))
            .await?
            .ok_or_else(|| ClusterError::Discovery {
                key: key.clone(),
                message: format!("kind {} not served by the API", key.kind),
            })?;

        let api = self.api_for(key, &ar);
        let applied = api
            .patch(
                &key.name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&value),
            )
            .await
            .map_err(|e| ClusterError::Api {
                key: key.clone(),
                source: e,
            })?;

        info!(key = %key, "applied manifest");
        Ok(AppliedMeta {
            generation: applied.metadata.generation,
        })
    }

    async fn status(&self, key: &ResourceKey) -> Result<ObservedStatus, ClusterError> {
        // If the kind itself is unknown to the API, instances cannot exist
        let Some(ar) = self.discover(key, None).await? else {
            return Ok(ObservedStatus::Absent);
        };

        let api = self.api_for(key, &ar);
        match api.get(&key.name).await {
            Ok(obj) => Ok(observe(&obj)),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(ObservedStatus::Absent),
            Err(e) => Err(ClusterError::Api {
                key: key.clone(),
                source: e,
            }),
        }
    }

    async fn delete(&self, key: &ResourceKey) -> Result<(), ClusterError> {
        let Some(ar) = self.discover(key, None).await? else {
            return Ok(());
        };

        let api = self.api_for(key, &ar);
        match api.delete(&key.name, &DeleteParams::default()).await {
            Ok(_) => {
                info!(key = %key, "deletion requested");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(ClusterError::Api {
                key: key.clone(),
                source: e,
            }),
        }
    }
}

/// Derive an [`ObservedStatus`] from a live object's status shape
fn observe(obj: &DynamicObject) -> ObservedStatus {
    let status = obj.data.get("status");
    ObservedStatus::Present {
        established: status.map(established_from).unwrap_or(false),
        ready: status.map(ready_from).unwrap_or(false),
        generation: obj.metadata.generation,
    }
}

/// CRD readiness: conditions contains `Established == True`
fn established_from(status: &serde_json::Value) -> bool {
    condition_true(status, "Established")
}

/// Workload readiness: a Ready/Available condition, or a ready phase
fn ready_from(status: &serde_json::Value) -> bool {
    if let Some(phase) = status.get("phase").and_then(|p| p.as_str()) {
        if matches!(phase, "Ready" | "Succeeded" | "Provisioned") {
            return true;
        }
    }
    condition_true(status, "Ready") || condition_true(status, "Available")
}

fn condition_true(status: &serde_json::Value, kind: &str) -> bool {
    status
        .get("conditions")
        .and_then(|c| c.as_array())
        .map(|conds| {
            conds.iter().any(|c| {
                c.get("type").and_then(|t| t.as_str()) == Some(kind)
                    && c.get("status").and_then(|s| s.as_str()) == Some("True")
            })
        })
        .unwrap_or(false)
}

/// Parse `group/version` into components; core API has no group
fn parse_api_version(api_version: &str) -> (&str, &str) {
    match api_version.rfind('/') {
        Some(idx) => (&api_version[..idx], &api_version[idx + 1..]),
        None => ("", api_version),
    }
}

/// Known pluralizations for the kinds a Rook/Ceph catalog carries.
///
/// Kubernetes plurals are all-lowercase and occasionally irregular.
/// Kinds not listed fall back to lowercase + 's', which is correct for
/// most resources.
const KIND_PLURALS: &[(&str, &str)] = &[
    ("customresourcedefinition", "customresourcedefinitions"),
    ("cephblockpool", "cephblockpools"),
    ("cephblockpoolradosnamespace", "cephblockpoolradosnamespaces"),
    ("cephcluster", "cephclusters"),
    ("cephfilesystem", "cephfilesystems"),
    ("cephfilesystemsubvolumegroup", "cephfilesystemsubvolumegroups"),
    ("cephnfs", "cephnfses"),
    ("cephobjectstore", "cephobjectstores"),
    ("cephobjectstoreuser", "cephobjectstoreusers"),
    ("cephrbdmirror", "cephrbdmirrors"),
    ("objectbucket", "objectbuckets"),
    ("objectbucketclaim", "objectbucketclaims"),
];

fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    for (k, plural) in KIND_PLURALS {
        if *k == lower {
            return plural.to_string();
        }
    }
    format!("{}s", lower)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ==========================================================================
    // Story: Readiness Observation From Untyped Status
    // ==========================================================================

    #[test]
    fn crd_established_condition_is_recognized() {
        let status = json!({
            "conditions": [
                {"type": "NamesAccepted", "status": "True"},
                {"type": "Established", "status": "True"},
            ]
        });
        assert!(established_from(&status));
        assert!(!ready_from(&status));
    }

    #[test]
    fn unestablished_crd_is_not_established() {
        let status = json!({
            "conditions": [{"type": "Established", "status": "False"}]
        });
        assert!(!established_from(&status));
    }

    #[test]
    fn ready_phase_marks_workload_ready() {
        assert!(ready_from(&json!({"phase": "Ready"})));
        assert!(ready_from(&json!({"phase": "Provisioned"})));
        assert!(!ready_from(&json!({"phase": "Progressing"})));
    }

    #[test]
    fn available_condition_marks_workload_ready() {
        let status = json!({
            "conditions": [{"type": "Available", "status": "True"}]
        });
        assert!(ready_from(&status));
    }

    #[test]
    fn missing_status_is_neither_established_nor_ready() {
        let status = json!({});
        assert!(!established_from(&status));
        assert!(!ready_from(&status));
    }

    // ==========================================================================
    // Story: Status Satisfies Requirements
    // ==========================================================================

    #[test]
    fn present_satisfies_exists_regardless_of_conditions() {
        let present = ObservedStatus::Present {
            established: false,
            ready: false,
            generation: Some(1),
        };
        assert!(present.satisfies(Readiness::Exists));
        assert!(!present.satisfies(Readiness::Established));
        assert!(!present.satisfies(Readiness::Ready));
        assert!(!present.satisfies(Readiness::Deleted));
    }

    #[test]
    fn absent_satisfies_only_deleted() {
        assert!(ObservedStatus::Absent.satisfies(Readiness::Deleted));
        assert!(!ObservedStatus::Absent.satisfies(Readiness::Exists));
        assert!(!ObservedStatus::Absent.satisfies(Readiness::Ready));
    }

    // ==========================================================================
    // Story: Transient vs Terminal Error Classes
    // ==========================================================================

    #[test]
    fn server_errors_and_throttling_are_transient() {
        assert!(transient_code(429));
        assert!(transient_code(408));
        assert!(transient_code(500));
        assert!(transient_code(503));
    }

    #[test]
    fn rejections_are_terminal() {
        assert!(!transient_code(403)); // permission denied
        assert!(!transient_code(409)); // conflict / version mismatch
        assert!(!transient_code(422)); // schema validation failure
    }

    #[test]
    fn invalid_documents_are_never_retried() {
        let err = ClusterError::InvalidDocument {
            key: ResourceKey::cluster_scoped("CephCluster", "rook-ceph"),
            reason: "not valid YAML".to_string(),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn discovery_failures_are_transient() {
        let err = ClusterError::Discovery {
            key: ResourceKey::cluster_scoped("CephCluster", "rook-ceph"),
            message: "connection refused".to_string(),
        };
        assert!(err.is_transient());
    }

    // ==========================================================================
    // Story: API Version and Plural Resolution
    // ==========================================================================

    #[test]
    fn api_version_splits_group_and_version() {
        assert_eq!(
            parse_api_version("apiextensions.k8s.io/v1"),
            ("apiextensions.k8s.io", "v1")
        );
        assert_eq!(parse_api_version("ceph.rook.io/v1"), ("ceph.rook.io", "v1"));
        assert_eq!(parse_api_version("v1"), ("", "v1"));
    }

    #[test]
    fn known_kinds_use_irregular_plurals() {
        assert_eq!(pluralize_kind("CephNFS"), "cephnfses");
        assert_eq!(
            pluralize_kind("CustomResourceDefinition"),
            "customresourcedefinitions"
        );
    }

    #[test]
    fn unknown_kinds_fall_back_to_lowercase_s() {
        assert_eq!(pluralize_kind("ConfigMap"), "configmaps");
        assert_eq!(pluralize_kind("CephBlockPool"), "cephblockpools");
    }
}
