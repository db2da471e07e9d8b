//! Provider release metadata and component bundles
//!
//! Repositories are an external collaborator: given a provider they yield
//! the published versions, the release-series metadata mapping versions to
//! API contracts, and rendered component bundles. The in-memory
//! implementation backs tests and programmatic wiring.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::DynamicObject;
#[cfg(test)]
use mockall::automock;
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::inventory::Provider;
use crate::{Error, Result, PROVIDER_LABEL};

/// One release series of a provider: every `major.minor.*` release in the
/// series supports the same contract
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseSeries {
    /// Major version of the series
    pub major: u64,
    /// Minor version of the series
    pub minor: u64,
    /// API contract the series supports
    pub contract: String,
}

/// Release metadata published alongside each provider version
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseMetadata {
    /// The known release series
    #[serde(rename = "releaseSeries")]
    pub release_series: Vec<ReleaseSeries>,
}

impl ReleaseMetadata {
    /// The series covering a version, if any
    pub fn series_for(&self, version: &Version) -> Option<&ReleaseSeries> {
        self.release_series
            .iter()
            .find(|s| s.major == version.major && s.minor == version.minor)
    }

    /// Parse a metadata document
    pub fn from_yaml(doc: &str) -> Result<Self> {
        serde_yaml::from_str(doc)
            .map_err(|e| Error::serialization(format!("malformed release metadata: {}", e)))
    }
}

/// Render options for a component bundle
#[derive(Debug, Clone)]
pub struct ComponentsOptions {
    /// Version tag to fetch (leading "v")
    pub version: String,
    /// Namespace the components are installed into
    pub target_namespace: String,
    /// Namespace the provider's controllers watch; empty means all
    pub watched_namespace: String,
}

/// A rendered component bundle for one provider version
///
/// Objects are pre-rendered: they carry the provider label and their
/// target namespace; CRDs come first, namespaces next, then the rest.
#[derive(Debug, Clone)]
pub struct Components {
    /// The provider the bundle belongs to
    pub provider: Provider,
    /// Version tag of the bundle
    pub version: String,
    /// The declarative objects to apply
    pub objects: Vec<DynamicObject>,
}

/// Typed access to one provider's repository
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RepositoryClient: Send + Sync {
    /// Published versions, ascending
    async fn versions(&self) -> Result<Vec<Version>>;

    /// Release metadata published with a version
    async fn metadata(&self, version: &Version) -> Result<ReleaseMetadata>;

    /// Rendered component bundle for a version
    async fn components(&self, options: &ComponentsOptions) -> Result<Components>;
}

/// Resolves the repository for a provider
pub trait RepositoryFactory: Send + Sync {
    /// Repository client for one provider
    fn repository_for(&self, provider: &Provider) -> Result<Arc<dyn RepositoryClient>>;
}

/// Parse a version tag, tolerating the conventional leading "v"
pub fn parse_version(tag: &str) -> Result<Version> {
    let trimmed = tag.strip_prefix('v').unwrap_or(tag);
    Version::parse(trimmed)
        .map_err(|e| Error::validation(format!("invalid version {:?}: {}", tag, e)))
}

/// Render a version as a tag with the conventional leading "v"; None
/// renders as the empty string ("no version available")
pub fn version_tag(version: Option<&Version>) -> String {
    match version {
        Some(v) => format!("v{}", v),
        None => String::new(),
    }
}

/// In-memory repository for one provider
#[derive(Debug, Clone)]
pub struct MemoryRepository {
    provider: Provider,
    versions: Vec<Version>,
    metadata: BTreeMap<String, ReleaseMetadata>,
    components: BTreeMap<String, Vec<DynamicObject>>,
}

impl MemoryRepository {
    /// Empty repository for a provider
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            versions: Vec::new(),
            metadata: BTreeMap::new(),
            components: BTreeMap::new(),
        }
    }

    /// Publish a version
    pub fn with_version(mut self, tag: &str) -> Result<Self> {
        self.versions.push(parse_version(tag)?);
        self.versions.sort();
        Ok(self)
    }

    /// Publish release metadata for a version tag
    pub fn with_metadata(mut self, tag: &str, metadata: ReleaseMetadata) -> Self {
        self.metadata.insert(tag.to_string(), metadata);
        self
    }

    /// Publish component objects for a version tag
    pub fn with_components(mut self, tag: &str, objects: Vec<DynamicObject>) -> Self {
        self.components.insert(tag.to_string(), objects);
        self
    }
}

#[async_trait]
impl RepositoryClient for MemoryRepository {
    async fn versions(&self) -> Result<Vec<Version>> {
        Ok(self.versions.clone())
    }

    async fn metadata(&self, version: &Version) -> Result<ReleaseMetadata> {
        self.metadata
            .get(&version_tag(Some(version)))
            .cloned()
            .ok_or_else(|| Error::InvalidMetadata {
                provider: self.provider.instance_name(),
                message: format!("no release metadata published for version v{}", version),
            })
    }

    async fn components(&self, options: &ComponentsOptions) -> Result<Components> {
        let objects = self.components.get(&options.version).ok_or_else(|| {
            Error::validation(format!(
                "no components published for {} version {}",
                self.provider.instance_name(),
                options.version
            ))
        })?;

        // Minimal rendering: stamp the provider label and the target
        // namespace on namespaced objects.
        let rendered = objects
            .iter()
            .map(|obj| {
                let mut obj = obj.clone();
                obj.metadata
                    .labels
                    .get_or_insert_with(Default::default)
                    .insert(PROVIDER_LABEL.to_string(), self.provider.name.clone());
                if obj.metadata.namespace.is_some() {
                    obj.metadata.namespace = Some(options.target_namespace.clone());
                }
                obj
            })
            .collect();

        Ok(Components {
            provider: self.provider.clone(),
            version: options.version.clone(),
            objects: rendered,
        })
    }
}

/// In-memory [`RepositoryFactory`] keyed by provider instance name
#[derive(Default)]
pub struct MemoryRepositoryFactory {
    repositories: BTreeMap<String, Arc<MemoryRepository>>,
}

impl MemoryRepositoryFactory {
    /// Empty factory
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a repository
    pub fn with(mut self, repository: MemoryRepository) -> Self {
        self.repositories.insert(
            repository.provider.instance_name(),
            Arc::new(repository),
        );
        self
    }
}

impl RepositoryFactory for MemoryRepositoryFactory {
    fn repository_for(&self, provider: &Provider) -> Result<Arc<dyn RepositoryClient>> {
        self.repositories
            .get(&provider.instance_name())
            .map(|r| r.clone() as Arc<dyn RepositoryClient>)
            .ok_or_else(|| {
                Error::validation(format!(
                    "no repository configured for provider {}",
                    provider.instance_name()
                ))
            })
    }
}
