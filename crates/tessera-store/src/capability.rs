//! Capability and requirement registrations.
//!
//! A capability lives in a context: either global, or scoped to a partition
//! of the model such as `profile=full`. A requirement declared in one context
//! can be satisfied by a capability in the same context, by a global
//! capability, or by a capability in a context the requiring context
//! (transitively) includes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tessera_model::{CapabilityName, PathAddress};

/// Address keys whose first-element values scope capabilities.
pub const SCOPING_KEYS: &[&str] = &["profile", "host"];

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CapabilityContext {
    Global,
    Scoped(String),
}

impl CapabilityContext {
    pub fn for_address(address: &PathAddress) -> Self {
        match address.first() {
            Some(first) if SCOPING_KEYS.contains(&first.key.as_str()) => {
                CapabilityContext::Scoped(first.to_string())
            }
            _ => CapabilityContext::Global,
        }
    }
}

impl fmt::Display for CapabilityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CapabilityContext::Global => write!(f, "global"),
            CapabilityContext::Scoped(scope) => write!(f, "{scope}"),
        }
    }
}

/// Where in the model a capability or requirement was registered.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegistrationPoint {
    pub address: PathAddress,
    pub attribute: Option<String>,
}

impl RegistrationPoint {
    pub fn resource(address: PathAddress) -> Self {
        Self {
            address,
            attribute: None,
        }
    }

    pub fn attribute(address: PathAddress, attribute: &str) -> Self {
        Self {
            address,
            attribute: Some(attribute.to_owned()),
        }
    }
}

impl fmt::Display for RegistrationPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.attribute {
            Some(attr) => write!(f, "{} ({attr})", self.address),
            None => write!(f, "{}", self.address),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CapabilityId {
    pub name: CapabilityName,
    pub context: CapabilityContext,
}

impl CapabilityId {
    pub fn new(name: impl Into<CapabilityName>, context: CapabilityContext) -> Self {
        Self {
            name: name.into(),
            context,
        }
    }
}

/// A dependent's requirement on a named capability, within a context.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequirementKey {
    pub required: CapabilityName,
    pub dependent: String,
    pub context: CapabilityContext,
}

impl RequirementKey {
    pub fn new(
        required: impl Into<CapabilityName>,
        dependent: impl Into<String>,
        context: CapabilityContext,
    ) -> Self {
        Self {
            required: required.into(),
            dependent: dependent.into(),
            context,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityRegistry {
    capabilities: BTreeMap<CapabilityId, BTreeSet<RegistrationPoint>>,
    requirements: BTreeMap<RequirementKey, BTreeSet<RegistrationPoint>>,
    includes: BTreeMap<String, BTreeSet<String>>,
    generation: u64,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Incremented by every mutation; cloned along with the registry.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn register_capability(&mut self, id: CapabilityId, point: RegistrationPoint) {
        self.capabilities.entry(id).or_default().insert(point);
        self.generation += 1;
    }

    /// Remove one registration point. Returns true if the capability is now gone.
    pub fn remove_capability(&mut self, id: &CapabilityId, point: &RegistrationPoint) -> bool {
        let Some(points) = self.capabilities.get_mut(id) else {
            return false;
        };
        points.remove(point);
        self.generation += 1;
        if points.is_empty() {
            self.capabilities.remove(id);
            true
        } else {
            false
        }
    }

    pub fn register_requirement(&mut self, key: RequirementKey, point: RegistrationPoint) {
        self.requirements.entry(key).or_default().insert(point);
        self.generation += 1;
    }

    pub fn remove_requirement(&mut self, key: &RequirementKey, point: &RegistrationPoint) {
        if let Some(points) = self.requirements.get_mut(key) {
            points.remove(point);
            if points.is_empty() {
                self.requirements.remove(key);
            }
            self.generation += 1;
        }
    }

    /// Drop every registration made at `address`, returning the capabilities
    /// that no longer exist and the requirements that were removed.
    pub fn remove_address(
        &mut self,
        address: &PathAddress,
    ) -> (Vec<CapabilityId>, Vec<RequirementKey>) {
        let mut gone = Vec::new();
        self.capabilities.retain(|id, points| {
            points.retain(|p| p.address != *address);
            if points.is_empty() {
                gone.push(id.clone());
                false
            } else {
                true
            }
        });
        let mut removed = Vec::new();
        self.requirements.retain(|key, points| {
            let before = points.len();
            points.retain(|p| p.address != *address);
            if points.len() != before {
                removed.push(key.clone());
            }
            !points.is_empty()
        });
        self.generation += 1;
        (gone, removed)
    }

    /// Declare that `context` can use capabilities registered in `included`.
    pub fn include_context(&mut self, context: &str, included: &str) {
        self.includes
            .entry(context.to_owned())
            .or_default()
            .insert(included.to_owned());
        self.generation += 1;
    }

    pub fn contains(&self, id: &CapabilityId) -> bool {
        self.capabilities.contains_key(id)
    }

    pub fn capability_points(&self, id: &CapabilityId) -> Option<&BTreeSet<RegistrationPoint>> {
        self.capabilities.get(id)
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &CapabilityId> {
        self.capabilities.keys()
    }

    pub fn requirements(
        &self,
    ) -> impl Iterator<Item = (&RequirementKey, &BTreeSet<RegistrationPoint>)> {
        self.requirements.iter()
    }

    /// Whether a capability registered in `provider` may satisfy a requirement in `consumer`.
    pub fn can_satisfy(&self, provider: &CapabilityContext, consumer: &CapabilityContext) -> bool {
        match (provider, consumer) {
            (CapabilityContext::Global, _) => true,
            (CapabilityContext::Scoped(_), CapabilityContext::Global) => false,
            (CapabilityContext::Scoped(p), CapabilityContext::Scoped(c)) => {
                p == c || self.includes_transitively(c, p)
            }
        }
    }

    fn includes_transitively(&self, from: &str, target: &str) -> bool {
        let mut seen = BTreeSet::new();
        let mut stack = vec![from];
        while let Some(ctx) = stack.pop() {
            if !seen.insert(ctx) {
                continue;
            }
            if let Some(included) = self.includes.get(ctx) {
                for next in included {
                    if next == target {
                        return true;
                    }
                    stack.push(next.as_str());
                }
            }
        }
        false
    }

    /// Whether some registered capability named `name` can serve `consumer`.
    pub fn is_available(&self, name: &CapabilityName, consumer: &CapabilityContext) -> bool {
        self.capabilities
            .keys()
            .any(|id| id.name == *name && self.can_satisfy(&id.context, consumer))
    }

    /// Registration points of every capability named `name` that can serve `consumer`.
    pub fn providers<'a>(
        &'a self,
        name: &'a CapabilityName,
        consumer: &'a CapabilityContext,
    ) -> impl Iterator<Item = &'a RegistrationPoint> + 'a {
        self.capabilities
            .iter()
            .filter(move |(id, _)| id.name == *name && self.can_satisfy(&id.context, consumer))
            .flat_map(|(_, points)| points.iter())
    }

    /// Replace every registration point under `prefix` with those `other` holds there.
    pub fn graft(&mut self, prefix: &PathAddress, other: &CapabilityRegistry) {
        self.capabilities.retain(|_, points| {
            points.retain(|p| !p.address.starts_with(prefix));
            !points.is_empty()
        });
        self.requirements.retain(|_, points| {
            points.retain(|p| !p.address.starts_with(prefix));
            !points.is_empty()
        });
        for (id, points) in &other.capabilities {
            for point in points.iter().filter(|p| p.address.starts_with(prefix)) {
                self.capabilities
                    .entry(id.clone())
                    .or_default()
                    .insert(point.clone());
            }
        }
        for (key, points) in &other.requirements {
            for point in points.iter().filter(|p| p.address.starts_with(prefix)) {
                self.requirements
                    .entry(key.clone())
                    .or_default()
                    .insert(point.clone());
            }
        }
        for (ctx, included) in &other.includes {
            self.includes
                .entry(ctx.clone())
                .or_default()
                .extend(included.iter().cloned());
        }
        self.generation += 1;
    }
}
