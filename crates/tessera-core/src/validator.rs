//! Capability requirement checking at the MODEL stage exit.

use crate::step::StepId;
use crate::transaction::Transaction;
use serde_json::Value;
use std::collections::BTreeMap;
use tessera_store::{CapabilityRegistry, RegistrationPoint, RequirementKey};
use tracing::{debug, info};

/// A requirement with no capability able to satisfy it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsatisfied {
    pub requirement: RequirementKey,
    pub points: Vec<RegistrationPoint>,
}

impl Unsatisfied {
    pub fn message(&self) -> String {
        format!(
            "'{}' requires capability '{}' which is not available in context {}",
            self.requirement.dependent, self.requirement.required, self.requirement.context
        )
    }
}

pub struct CapabilityValidator;

impl CapabilityValidator {
    pub fn unsatisfied(registry: &CapabilityRegistry) -> Vec<Unsatisfied> {
        registry
            .requirements()
            .filter(|(key, _)| !registry.is_available(&key.required, &key.context))
            .map(|(key, points)| Unsatisfied {
                requirement: key.clone(),
                points: points.iter().cloned().collect(),
            })
            .collect()
    }
}

/// Validate if the capability store changed since the last check.
/// Returns false, with ROLLBACK forced, when a requirement is unsatisfied.
pub(crate) fn validate(txn: &mut Transaction) -> bool {
    if !txn.snapshot.modified().capabilities {
        return true;
    }
    let registry = txn.snapshot.capabilities(&txn.engine.snapshots);
    if txn.validated_generation == Some(registry.generation()) {
        return true;
    }
    txn.validated_generation = Some(registry.generation());
    let unsatisfied = CapabilityValidator::unsatisfied(&registry);
    if unsatisfied.is_empty() {
        debug!("{} capability requirements satisfied", txn.id);
        return true;
    }

    let mut by_step: BTreeMap<StepId, Vec<String>> = BTreeMap::new();
    for failure in &unsatisfied {
        let message = failure.message();
        for step in attribute(txn, &registry, &failure.requirement) {
            by_step.entry(step).or_default().push(message.clone());
        }
    }
    for (step, messages) in by_step {
        let description = format!(
            "unsatisfied capability requirements: {}",
            messages.join("; ")
        );
        info!("{} {step}: {description}", txn.id);
        txn.fail_step(step, Value::String(description));
    }
    txn.force_rollback();
    false
}

/// The step(s) responsible for an unsatisfied requirement.
fn attribute(
    txn: &Transaction,
    registry: &CapabilityRegistry,
    requirement: &RequirementKey,
) -> Vec<StepId> {
    let remover = txn.state.capability_removals.iter().find(|(id, _)| {
        id.name == requirement.required && registry.can_satisfy(&id.context, &requirement.context)
    });
    if let Some((_, step)) = remover {
        return vec![*step];
    }
    match txn.state.requirement_owners.get(requirement) {
        Some(owners) if !owners.is_empty() => owners.iter().copied().collect(),
        _ => vec![txn.root_step],
    }
}
