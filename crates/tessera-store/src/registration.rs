use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tessera_model::{CapabilityName, PathAddress};

/// What a changed attribute value requires before it takes effect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartLevel {
    #[default]
    None,
    Reload,
    Restart,
}

/// Definition of a resource type, registered at an address pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResourceRegistration {
    pub pattern: PathAddress,
    /// Capability provided by every resource matching the pattern.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability: Option<CapabilityName>,
    /// Dynamic capabilities are named `base.<last element value>`.
    #[serde(default)]
    pub dynamic: bool,
    /// Attribute name to the base name of the capability its value refers to.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requirements: BTreeMap<String, CapabilityName>,
    /// Whether matching resources install a runtime service.
    #[serde(default)]
    pub service: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, RestartLevel>,
}

impl ResourceRegistration {
    pub fn new(pattern: PathAddress) -> Self {
        Self {
            pattern,
            capability: None,
            dynamic: false,
            requirements: BTreeMap::new(),
            service: false,
            attributes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_capability(mut self, base: impl Into<CapabilityName>, dynamic: bool) -> Self {
        self.capability = Some(base.into());
        self.dynamic = dynamic;
        self
    }

    #[must_use]
    pub fn with_requirement(mut self, attribute: &str, base: impl Into<CapabilityName>) -> Self {
        self.requirements.insert(attribute.to_owned(), base.into());
        self
    }

    #[must_use]
    pub fn with_service(mut self) -> Self {
        self.service = true;
        self
    }

    #[must_use]
    pub fn with_attribute(mut self, attribute: &str, level: RestartLevel) -> Self {
        self.attributes.insert(attribute.to_owned(), level);
        self
    }

    /// The capability a concrete resource at `address` provides.
    pub fn capability_for(&self, address: &PathAddress) -> Option<CapabilityName> {
        let base = self.capability.as_ref()?;
        if self.dynamic {
            let element = address.last()?;
            Some(CapabilityName::dynamic(base, &element.value))
        } else {
            Some(base.clone())
        }
    }

    /// The capability an attribute value refers to, if the attribute is a requirement.
    pub fn requirement_for(&self, attribute: &str, value: &str) -> Option<CapabilityName> {
        self.requirements
            .get(attribute)
            .map(|base| CapabilityName::dynamic(base, value))
    }

    pub fn restart_level(&self, attribute: &str) -> RestartLevel {
        self.attributes.get(attribute).copied().unwrap_or_default()
    }
}

/// Resource definitions keyed by address pattern.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationTree {
    entries: BTreeMap<PathAddress, ResourceRegistration>,
}

impl RegistrationTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, registration: ResourceRegistration) -> Result<(), StoreError> {
        if self.entries.contains_key(&registration.pattern) {
            return Err(StoreError::DuplicateRegistration(registration.pattern));
        }
        self.entries
            .insert(registration.pattern.clone(), registration);
        Ok(())
    }

    pub fn unregister(&mut self, pattern: &PathAddress) -> Option<ResourceRegistration> {
        self.entries.remove(pattern)
    }

    pub fn get(&self, pattern: &PathAddress) -> Option<&ResourceRegistration> {
        self.entries.get(pattern)
    }

    /// The most specific registration matching a concrete address.
    pub fn resolve(&self, address: &PathAddress) -> Option<&ResourceRegistration> {
        self.entries
            .values()
            .filter(|reg| address.matches(&reg.pattern))
            .min_by_key(|reg| reg.pattern.wildcard_count())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceRegistration> {
        self.entries.values()
    }

    /// Replace every pattern under `prefix` with the ones `other` holds there.
    pub fn graft(&mut self, prefix: &PathAddress, other: &RegistrationTree) {
        self.entries.retain(|pattern, _| !pattern.starts_with(prefix));
        for (pattern, reg) in &other.entries {
            if pattern.starts_with(prefix) {
                self.entries.insert(pattern.clone(), reg.clone());
            }
        }
    }
}
