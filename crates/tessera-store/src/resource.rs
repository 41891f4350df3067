use crate::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tessera_model::PathAddress;

/// One node of the configuration model: its attribute values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(default)]
    pub model: Map<String, Value>,
}

impl Resource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(model: Map<String, Value>) -> Self {
        Self { model }
    }

    pub fn get(&self, attribute: &str) -> Option<&Value> {
        self.model.get(attribute)
    }

    /// Set an attribute, returning the previous value. `Value::Null` undefines it.
    pub fn set(&mut self, attribute: &str, value: Value) -> Option<Value> {
        if value.is_null() {
            self.model.remove(attribute)
        } else {
            self.model.insert(attribute.to_owned(), value)
        }
    }
}

/// The hierarchical configuration model, stored flat by address.
///
/// The root resource always exists. Every other resource's parent must exist,
/// so a subtree is always a contiguous key range starting at its root address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceTree {
    resources: BTreeMap<PathAddress, Resource>,
}

impl Default for ResourceTree {
    fn default() -> Self {
        let mut resources = BTreeMap::new();
        resources.insert(PathAddress::root(), Resource::new());
        Self { resources }
    }
}

impl ResourceTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, address: &PathAddress) -> Option<&Resource> {
        self.resources.get(address)
    }

    pub fn get_mut(&mut self, address: &PathAddress) -> Option<&mut Resource> {
        self.resources.get_mut(address)
    }

    pub fn contains(&self, address: &PathAddress) -> bool {
        self.resources.contains_key(address)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.len() <= 1
    }

    pub fn iter(&self) -> impl Iterator<Item = (&PathAddress, &Resource)> {
        self.resources.iter()
    }

    pub fn create(&mut self, address: &PathAddress, resource: Resource) -> Result<(), StoreError> {
        let Some(parent) = address.parent() else {
            return Err(StoreError::RootImmutable);
        };
        if self.resources.contains_key(address) {
            return Err(StoreError::DuplicateResource(address.clone()));
        }
        if !self.resources.contains_key(&parent) {
            return Err(StoreError::ParentNotFound(address.clone()));
        }
        self.resources.insert(address.clone(), resource);
        Ok(())
    }

    /// Remove a leaf resource.
    pub fn remove(&mut self, address: &PathAddress) -> Result<Resource, StoreError> {
        if address.is_root() {
            return Err(StoreError::RootImmutable);
        }
        if !self.resources.contains_key(address) {
            return Err(StoreError::ResourceNotFound(address.clone()));
        }
        if self.has_children(address) {
            return Err(StoreError::HasChildren(address.clone()));
        }
        self.resources
            .remove(address)
            .ok_or_else(|| StoreError::ResourceNotFound(address.clone()))
    }

    /// Addresses in the subtree rooted at `prefix`, including `prefix` itself.
    pub fn subtree<'a>(
        &'a self,
        prefix: &'a PathAddress,
    ) -> impl Iterator<Item = (&'a PathAddress, &'a Resource)> + 'a {
        self.resources
            .range(prefix.clone()..)
            .take_while(move |(addr, _)| addr.starts_with(prefix))
    }

    pub fn children<'a>(
        &'a self,
        address: &'a PathAddress,
    ) -> impl Iterator<Item = &'a PathAddress> + 'a {
        let depth = address.len() + 1;
        self.subtree(address)
            .map(|(addr, _)| addr)
            .filter(move |addr| addr.len() == depth)
    }

    pub fn has_children(&self, address: &PathAddress) -> bool {
        self.children(address).next().is_some()
    }

    /// Replace everything under `prefix` with the corresponding subtree of `other`.
    pub fn graft(&mut self, prefix: &PathAddress, other: &ResourceTree) {
        let stale: Vec<PathAddress> = self.subtree(prefix).map(|(a, _)| a.clone()).collect();
        for addr in stale {
            if !addr.is_root() {
                self.resources.remove(&addr);
            }
        }
        for (addr, resource) in other.subtree(prefix) {
            self.resources.insert(addr.clone(), resource.clone());
        }
    }

    /// Render a resource as JSON; `recursive` nests children by type then name.
    pub fn to_json(&self, address: &PathAddress, recursive: bool) -> Option<Value> {
        let resource = self.resources.get(address)?;
        let mut out = resource.model.clone();
        let mut by_type: BTreeMap<String, Map<String, Value>> = BTreeMap::new();
        for child in self.children(address) {
            let Some(element) = child.last() else {
                continue;
            };
            let rendered = if recursive {
                self.to_json(child, true).unwrap_or(Value::Null)
            } else {
                Value::Null
            };
            by_type
                .entry(element.key.clone())
                .or_default()
                .insert(element.value.clone(), rendered);
        }
        for (child_type, children) in by_type {
            out.insert(child_type, Value::Object(children));
        }
        Some(Value::Object(out))
    }
}
