//! Version-tagged cache namespaces.

use serde::Deserialize;

use super::classify::ResourceClass;

/// A (resource class, version) pair. Entries live inside exactly one namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
  pub class: ResourceClass,
  pub version: String,
}

impl Namespace {
  pub fn new(class: ResourceClass, version: impl Into<String>) -> Self {
    Self {
      class,
      version: version.into(),
    }
  }

  /// Storage name, e.g. `api-v3`.
  pub fn name(&self) -> String {
    format!("{}-{}", self.class.as_str(), self.version)
  }
}

/// The active version of every resource class.
///
/// Bumping a version is the only way to invalidate a class's entries.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CacheVersions {
  #[serde(rename = "static")]
  pub static_assets: String,
  pub api: String,
  pub dynamic: String,
}

impl Default for CacheVersions {
  fn default() -> Self {
    Self {
      static_assets: "v1".to_string(),
      api: "v1".to_string(),
      dynamic: "v1".to_string(),
    }
  }
}

impl CacheVersions {
  pub fn namespace(&self, class: ResourceClass) -> Namespace {
    let version = match class {
      ResourceClass::Static => &self.static_assets,
      ResourceClass::Api => &self.api,
      ResourceClass::Dynamic => &self.dynamic,
    };
    Namespace::new(class, version.clone())
  }

  pub fn namespaces(&self) -> Vec<Namespace> {
    ResourceClass::ALL
      .iter()
      .map(|class| self.namespace(*class))
      .collect()
  }
}
