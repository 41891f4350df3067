//! Immutable store bundles and per-transaction copy-on-write views.
//!
//! Readers load the current [`Snapshot`] from a [`SnapshotHandle`] without
//! blocking. A transaction writes through a [`TransactionSnapshot`], which pins
//! the published bundle on its first write and clones each store the first
//! time it is written. Commit publishes the result with one compare-and-swap
//! against the pinned bundle; discard just drops the private clones.

use crate::capability::CapabilityRegistry;
use crate::registration::RegistrationTree;
use crate::resource::ResourceTree;
use crate::StoreError;
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    resources: Arc<ResourceTree>,
    registrations: Arc<RegistrationTree>,
    capabilities: Arc<CapabilityRegistry>,
    version: u64,
}

impl Snapshot {
    pub fn new(
        resources: ResourceTree,
        registrations: RegistrationTree,
        capabilities: CapabilityRegistry,
    ) -> Self {
        Self {
            resources: Arc::new(resources),
            registrations: Arc::new(registrations),
            capabilities: Arc::new(capabilities),
            version: 0,
        }
    }

    pub fn resources(&self) -> &Arc<ResourceTree> {
        &self.resources
    }

    pub fn registrations(&self) -> &Arc<RegistrationTree> {
        &self.registrations
    }

    pub fn capabilities(&self) -> &Arc<CapabilityRegistry> {
        &self.capabilities
    }

    /// Number of commits published since startup.
    pub fn version(&self) -> u64 {
        self.version
    }
}

/// The globally published "current snapshot".
pub struct SnapshotHandle {
    current: ArcSwap<Snapshot>,
}

impl SnapshotHandle {
    pub fn new(initial: Snapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
        }
    }

    pub fn load(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Publish `next` if `expected` is still current.
    pub fn publish(
        &self,
        expected: &Arc<Snapshot>,
        next: Snapshot,
    ) -> Result<Arc<Snapshot>, StoreError> {
        let next = Arc::new(next);
        let prev = self.current.compare_and_swap(expected, Arc::clone(&next));
        if Arc::ptr_eq(&prev, expected) {
            debug!("published snapshot version {}", next.version);
            Ok(next)
        } else {
            Err(StoreError::StalePublish {
                expected: expected.version,
                found: prev.version,
            })
        }
    }
}

impl Default for SnapshotHandle {
    fn default() -> Self {
        Self::new(Snapshot::default())
    }
}

/// Which stores a transaction has written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Modified {
    pub resources: bool,
    pub registrations: bool,
    pub capabilities: bool,
}

impl Modified {
    pub fn any(&self) -> bool {
        self.resources || self.registrations || self.capabilities
    }
}

/// The locally written stores of a transaction, for grafting into another.
#[derive(Debug, Default)]
pub struct ModifiedParts {
    pub resources: Option<Arc<ResourceTree>>,
    pub registrations: Option<Arc<RegistrationTree>>,
    pub capabilities: Option<Arc<CapabilityRegistry>>,
}

#[derive(Debug, Default)]
pub struct TransactionSnapshot {
    base: Option<Arc<Snapshot>>,
    resources: Option<Arc<ResourceTree>>,
    registrations: Option<Arc<RegistrationTree>>,
    capabilities: Option<Arc<CapabilityRegistry>>,
}

impl TransactionSnapshot {
    /// A view that reads the published snapshot until its first write.
    pub fn new() -> Self {
        Self::default()
    }

    /// A view pinned to `base`: reads see `base`, never the published snapshot.
    pub fn seeded(base: Arc<Snapshot>) -> Self {
        Self {
            base: Some(base),
            ..Self::default()
        }
    }

    fn current_base(&self, handle: &SnapshotHandle) -> Arc<Snapshot> {
        match &self.base {
            Some(base) => Arc::clone(base),
            None => handle.load(),
        }
    }

    fn pin(&mut self, handle: &SnapshotHandle) -> Arc<Snapshot> {
        Arc::clone(self.base.get_or_insert_with(|| handle.load()))
    }

    pub fn resources(&self, handle: &SnapshotHandle) -> Arc<ResourceTree> {
        match &self.resources {
            Some(local) => Arc::clone(local),
            None => Arc::clone(self.current_base(handle).resources()),
        }
    }

    pub fn registrations(&self, handle: &SnapshotHandle) -> Arc<RegistrationTree> {
        match &self.registrations {
            Some(local) => Arc::clone(local),
            None => Arc::clone(self.current_base(handle).registrations()),
        }
    }

    pub fn capabilities(&self, handle: &SnapshotHandle) -> Arc<CapabilityRegistry> {
        match &self.capabilities {
            Some(local) => Arc::clone(local),
            None => Arc::clone(self.current_base(handle).capabilities()),
        }
    }

    pub fn resources_mut(&mut self, handle: &SnapshotHandle) -> &mut ResourceTree {
        if self.resources.is_none() {
            let base = self.pin(handle);
            self.resources = Some(Arc::clone(base.resources()));
        }
        let local = self.resources.get_or_insert_with(Default::default);
        Arc::make_mut(local)
    }

    pub fn registrations_mut(&mut self, handle: &SnapshotHandle) -> &mut RegistrationTree {
        if self.registrations.is_none() {
            let base = self.pin(handle);
            self.registrations = Some(Arc::clone(base.registrations()));
        }
        let local = self.registrations.get_or_insert_with(Default::default);
        Arc::make_mut(local)
    }

    pub fn capabilities_mut(&mut self, handle: &SnapshotHandle) -> &mut CapabilityRegistry {
        if self.capabilities.is_none() {
            let base = self.pin(handle);
            self.capabilities = Some(Arc::clone(base.capabilities()));
        }
        let local = self.capabilities.get_or_insert_with(Default::default);
        Arc::make_mut(local)
    }

    pub fn modified(&self) -> Modified {
        Modified {
            resources: self.resources.is_some(),
            registrations: self.registrations.is_some(),
            capabilities: self.capabilities.is_some(),
        }
    }

    /// The combined view this transaction currently sees.
    pub fn view(&self, handle: &SnapshotHandle) -> Snapshot {
        let base = self.current_base(handle);
        Snapshot {
            resources: self.resources(handle),
            registrations: self.registrations(handle),
            capabilities: self.capabilities(handle),
            version: base.version,
        }
    }

    pub fn into_parts(self) -> ModifiedParts {
        ModifiedParts {
            resources: self.resources,
            registrations: self.registrations,
            capabilities: self.capabilities,
        }
    }

    /// Publish the local clones. Returns `None` when nothing was written.
    pub fn commit(self, handle: &SnapshotHandle) -> Result<Option<Arc<Snapshot>>, StoreError> {
        if !self.modified().any() {
            return Ok(None);
        }
        let Some(base) = self.base else {
            return Ok(None);
        };
        let next = Snapshot {
            resources: self
                .resources
                .unwrap_or_else(|| Arc::clone(base.resources())),
            registrations: self
                .registrations
                .unwrap_or_else(|| Arc::clone(base.registrations())),
            capabilities: self
                .capabilities
                .unwrap_or_else(|| Arc::clone(base.capabilities())),
            version: base.version + 1,
        };
        handle.publish(&base, next).map(Some)
    }

    pub fn discard(self) {
        let modified = self.modified();
        if modified.any() {
            debug!("discarding transaction snapshot: {modified:?}");
        }
    }
}
