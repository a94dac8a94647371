//! Version-tagged partition naming.

use super::policy::ResourceClass;

/// Builds partition names of the form `{prefix}-{version}-{class}`.
///
/// The version tag changes with each deployment; any partition that does not
/// carry the current `{prefix}-{version}-` is obsolete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionNamer {
  prefix: String,
  version: String,
}

impl PartitionNamer {
  pub fn new(prefix: impl Into<String>, version: impl Into<String>) -> Self {
    Self {
      prefix: prefix.into(),
      version: version.into(),
    }
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn current_prefix(&self) -> String {
    format!("{}-{}-", self.prefix, self.version)
  }

  pub fn name_for(&self, class: ResourceClass) -> String {
    format!("{}{}", self.current_prefix(), class.as_str())
  }

  pub fn is_current(&self, name: &str) -> bool {
    name.starts_with(&self.current_prefix())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_names_carry_version() {
    let namer = PartitionNamer::new("tiercache", "v3");
    assert_eq!(namer.name_for(ResourceClass::Api), "tiercache-v3-api");
    assert_eq!(namer.name_for(ResourceClass::Image), "tiercache-v3-images");
  }

  #[test]
  fn test_obsolete_detection() {
    let namer = PartitionNamer::new("tiercache", "v3");
    assert!(namer.is_current("tiercache-v3-static"));
    assert!(!namer.is_current("tiercache-v2-static"));
    assert!(!namer.is_current("tiercache-v30-static"));
    assert!(!namer.is_current("other-v3-static"));
  }
}
