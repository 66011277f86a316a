//! Manifest catalog
//!
//! A catalog is a named collection of manifest templates. Rendering a
//! template with a parameter set produces one or more Kubernetes resource
//! documents, separated by `---` per the standard multi-document manifest
//! convention. The orchestrator treats document bodies as opaque bytes;
//! only the shallow `kind`/`metadata` header is read to key the document.
//!
//! Templates use `${...}` placeholder syntax backed by minijinja with
//! custom delimiters and strict undefined-variable behavior, so a typo in
//! a template or a missing parameter fails the render instead of silently
//! producing a broken manifest.

use std::collections::BTreeMap;

use minijinja::syntax::SyntaxConfig;
use minijinja::{context, Environment, UndefinedBehavior};
#[cfg(test)]
use mockall::automock;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::graph::ResourceKey;

/// Errors from rendering catalog templates. All are configuration-class:
/// fatal for the affected resource, never retried.
#[derive(Debug, Error)]
pub enum CatalogError {
    /// No template registered under the requested name
    #[error("unknown template: {name}")]
    UnknownTemplate {
        /// The requested template name
        name: String,
    },

    /// The template engine rejected the template or its parameters
    #[error("failed to render template '{template}': {source}")]
    Render {
        /// The template being rendered
        template: String,
        /// Underlying engine error
        #[source]
        source: minijinja::Error,
    },

    /// Rendering produced no documents
    #[error("template '{template}' rendered no documents")]
    EmptyRender {
        /// The template being rendered
        template: String,
    },

    /// A rendered document is missing its kind or metadata.name header
    #[error("template '{template}' produced an invalid document: {reason}")]
    InvalidDocument {
        /// The template being rendered
        template: String,
        /// What was missing or malformed
        reason: String,
    },

    /// Template engine configuration failed
    #[error("template engine error: {0}")]
    Engine(#[source] minijinja::Error),
}

/// One rendered Kubernetes resource document.
///
/// The body is opaque to the orchestrator; only the shallow header
/// (`apiVersion`, `kind`, `metadata.name`, `metadata.namespace`) is
/// parsed so the document can be keyed and routed to the right API.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Document {
    /// `apiVersion` declared by the document
    pub api_version: String,
    /// Identity the document declares
    pub key: ResourceKey,
    content: String,
}

impl Document {
    /// Parse a single YAML document, extracting the shallow header.
    ///
    /// The body beyond `apiVersion`/`kind`/`metadata` is not validated.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let value: serde_yaml::Value =
            serde_yaml::from_str(raw).map_err(|e| format!("not valid YAML: {}", e))?;

        let api_version = value
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .ok_or("missing apiVersion")?
            .to_string();
        let kind = value
            .get("kind")
            .and_then(|v| v.as_str())
            .ok_or("missing kind")?
            .to_string();
        let metadata = value.get("metadata").ok_or("missing metadata")?;
        let name = metadata
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or("missing metadata.name")?
            .to_string();
        let namespace = metadata
            .get("namespace")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        Ok(Self {
            api_version,
            key: ResourceKey {
                kind,
                namespace,
                name,
            },
            content: raw.to_string(),
        })
    }

    /// The raw document text
    pub fn content(&self) -> &str {
        &self.content
    }

    /// SHA-256 of the rendered bytes, hex-encoded.
    ///
    /// Used to detect whether a re-apply would be a no-op: identical hash
    /// plus satisfied readiness means the resource is already converged.
    pub fn content_hash(&self) -> String {
        let digest = Sha256::digest(self.content.as_bytes());
        digest.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Split multi-document YAML on `---` separator lines.
///
/// Only a marker at column zero splits, matching YAML's own rule that a
/// document start marker terminates any scalar in progress. A `---`
/// nested inside an indented block scalar (manifests embedded in a
/// ConfigMap, say) is kept as content.
///
/// Empty chunks (leading separators, trailing whitespace) are dropped.
pub fn split_documents(raw: &str) -> Vec<String> {
    let mut docs = Vec::new();
    let mut current = String::new();
    for line in raw.lines() {
        if line.trim_end() == "---" {
            if !current.trim().is_empty() {
                docs.push(current.clone());
            }
            current.clear();
        } else {
            current.push_str(line);
            current.push('\n');
        }
    }
    if !current.trim().is_empty() {
        docs.push(current);
    }
    docs
}

/// A named collection of manifest templates.
///
/// `render` is synchronous and pure: the same template and parameters
/// always produce the same documents.
#[cfg_attr(test, automock)]
pub trait ManifestCatalog: Send + Sync {
    /// Render the named template with the given parameters into one or
    /// more resource documents.
    fn render(
        &self,
        template: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<Vec<Document>, CatalogError>;

    /// Names of all registered templates, in registration order
    fn template_names(&self) -> Vec<String>;
}

/// Production catalog backed by minijinja.
///
/// Templates reference parameters as `${params.NAME}` and may use
/// `{% if %}` / `{% for %}` blocks. Undefined variables are errors.
pub struct TemplateCatalog {
    env: Environment<'static>,
    names: Vec<String>,
}

impl TemplateCatalog {
    /// Create an empty catalog
    pub fn new() -> Result<Self, CatalogError> {
        let mut env = Environment::new();
        let syntax = SyntaxConfig::builder()
            .variable_delimiters("${", "}")
            .build()
            .map_err(CatalogError::Engine)?;
        env.set_syntax(syntax);
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Ok(Self {
            env,
            names: Vec::new(),
        })
    }

    /// Register a template under a name. Replaces any prior registration.
    pub fn add_template(
        &mut self,
        name: impl Into<String>,
        source: impl Into<String>,
    ) -> Result<(), CatalogError> {
        let name = name.into();
        self.env
            .add_template_owned(name.clone(), source.into())
            .map_err(|e| CatalogError::Render {
                template: name.clone(),
                source: e,
            })?;
        if !self.names.contains(&name) {
            self.names.push(name);
        }
        Ok(())
    }
}

impl ManifestCatalog for TemplateCatalog {
    fn render(
        &self,
        template: &str,
        params: &BTreeMap<String, String>,
    ) -> Result<Vec<Document>, CatalogError> {
        let tmpl = self
            .env
            .get_template(template)
            .map_err(|_| CatalogError::UnknownTemplate {
                name: template.to_string(),
            })?;

        let rendered = tmpl
            .render(context! { params => params })
            .map_err(|e| CatalogError::Render {
                template: template.to_string(),
                source: e,
            })?;

        let chunks = split_documents(&rendered);
        if chunks.is_empty() {
            return Err(CatalogError::EmptyRender {
                template: template.to_string(),
            });
        }

        chunks
            .iter()
            .map(|chunk| {
                Document::parse(chunk).map_err(|reason| CatalogError::InvalidDocument {
                    template: template.to_string(),
                    reason,
                })
            })
            .collect()
    }

    fn template_names(&self) -> Vec<String> {
        self.names.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POOL_CRD: &str = r#"apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: cephblockpools.ceph.rook.io
spec:
  group: ceph.rook.io
  names:
    kind: CephBlockPool
    plural: cephblockpools
  scope: Namespaced
"#;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    // ==========================================================================
    // Story: Rendering Templates With Parameters
    // ==========================================================================

    #[test]
    fn renders_static_template_into_one_document() {
        let mut catalog = TemplateCatalog::new().unwrap();
        catalog.add_template("pool-crd", POOL_CRD).unwrap();

        let docs = catalog.render("pool-crd", &BTreeMap::new()).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].key.kind, "CustomResourceDefinition");
        assert_eq!(docs[0].key.name, "cephblockpools.ceph.rook.io");
        assert_eq!(docs[0].key.namespace, None);
        assert_eq!(docs[0].api_version, "apiextensions.k8s.io/v1");
    }

    #[test]
    fn substitutes_parameters_with_score_syntax() {
        let mut catalog = TemplateCatalog::new().unwrap();
        catalog
            .add_template(
                "pool",
                "apiVersion: ceph.rook.io/v1\nkind: CephBlockPool\nmetadata:\n  name: ${params.name}\n  namespace: ${params.namespace}\nspec:\n  replicated:\n    size: ${params.replicas}\n",
            )
            .unwrap();

        let docs = catalog
            .render(
                "pool",
                &params(&[
                    ("name", "my-pool"),
                    ("namespace", "rook-ceph"),
                    ("replicas", "3"),
                ]),
            )
            .unwrap();

        assert_eq!(docs[0].key.name, "my-pool");
        assert_eq!(docs[0].key.namespace.as_deref(), Some("rook-ceph"));
        assert!(docs[0].content().contains("size: 3"));
    }

    #[test]
    fn missing_parameter_is_a_render_error() {
        let mut catalog = TemplateCatalog::new().unwrap();
        catalog
            .add_template(
                "pool",
                "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: ${params.missing}\n",
            )
            .unwrap();

        let err = catalog.render("pool", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, CatalogError::Render { .. }));
    }

    #[test]
    fn unknown_template_is_reported_by_name() {
        let catalog = TemplateCatalog::new().unwrap();
        let err = catalog.render("nope", &BTreeMap::new()).unwrap_err();
        match err {
            CatalogError::UnknownTemplate { name } => assert_eq!(name, "nope"),
            other => panic!("expected UnknownTemplate, got {:?}", other),
        }
    }

    // ==========================================================================
    // Story: Multi-Document Manifests
    // ==========================================================================

    #[test]
    fn splits_documents_on_separator_lines() {
        let raw = "---\napiVersion: v1\nkind: A\nmetadata:\n  name: a\n---\napiVersion: v1\nkind: B\nmetadata:\n  name: b\n";
        let docs = split_documents(raw);
        assert_eq!(docs.len(), 2);
        assert!(docs[0].contains("kind: A"));
        assert!(docs[1].contains("kind: B"));
    }

    #[test]
    fn separator_inside_an_indented_block_scalar_is_kept_as_content() {
        let raw = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: embedded\ndata:\n  nested.yaml: |\n    ---\n    apiVersion: v1\n    kind: Pod\n---\napiVersion: v1\nkind: Secret\nmetadata:\n  name: other\n";
        let docs = split_documents(raw);
        assert_eq!(docs.len(), 2);
        assert!(docs[0].contains("    ---"));
        assert!(docs[0].contains("kind: Pod"));
        assert!(docs[1].contains("kind: Secret"));
    }

    #[test]
    fn renders_multi_document_template() {
        let mut catalog = TemplateCatalog::new().unwrap();
        catalog
            .add_template(
                "crds",
                "apiVersion: apiextensions.k8s.io/v1\nkind: CustomResourceDefinition\nmetadata:\n  name: cephclusters.ceph.rook.io\n---\napiVersion: apiextensions.k8s.io/v1\nkind: CustomResourceDefinition\nmetadata:\n  name: cephfilesystems.ceph.rook.io\n",
            )
            .unwrap();

        let docs = catalog.render("crds", &BTreeMap::new()).unwrap();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].key.name, "cephclusters.ceph.rook.io");
        assert_eq!(docs[1].key.name, "cephfilesystems.ceph.rook.io");
    }

    #[test]
    fn empty_render_is_an_error() {
        let mut catalog = TemplateCatalog::new().unwrap();
        catalog.add_template("blank", "   \n").unwrap();
        let err = catalog.render("blank", &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, CatalogError::EmptyRender { .. }));
    }

    // ==========================================================================
    // Story: Document Headers and Hashing
    // ==========================================================================

    #[test]
    fn document_without_name_is_invalid() {
        let mut catalog = TemplateCatalog::new().unwrap();
        catalog
            .add_template("bad", "apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n")
            .unwrap();
        let err = catalog.render("bad", &BTreeMap::new()).unwrap_err();
        match err {
            CatalogError::InvalidDocument { reason, .. } => {
                assert!(reason.contains("metadata.name"));
            }
            other => panic!("expected InvalidDocument, got {:?}", other),
        }
    }

    #[test]
    fn content_hash_is_stable_and_content_sensitive() {
        let a = Document::parse(POOL_CRD).unwrap();
        let b = Document::parse(POOL_CRD).unwrap();
        assert_eq!(a.content_hash(), b.content_hash());

        let changed = POOL_CRD.replace("Namespaced", "Cluster");
        let c = Document::parse(&changed).unwrap();
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn template_names_preserve_registration_order() {
        let mut catalog = TemplateCatalog::new().unwrap();
        catalog.add_template("b", POOL_CRD).unwrap();
        catalog.add_template("a", POOL_CRD).unwrap();
        assert_eq!(catalog.template_names(), vec!["b", "a"]);
    }
}
