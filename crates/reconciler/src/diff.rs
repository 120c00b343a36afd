//! Membership diff between the desired endpoint set and a pool snapshot.
//!
//! The reconciler never replaces a pool's member list wholesale. It computes the
//! members to add and the members to remove and issues only those, so a pool that
//! is already converged sees no store mutation at all.

use crate::endpoint::EndpointSet;

/// Minimal change turning an observed membership into the desired one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDiff {
    /// Members present in the desired set but not in the pool.
    pub to_add: EndpointSet,
    /// Members present in the pool but not in the desired set.
    pub to_remove: EndpointSet,
}

impl MembershipDiff {
    /// Compute the diff between `desired` and `observed`.
    #[must_use]
    pub fn between(desired: &EndpointSet, observed: &EndpointSet) -> Self {
        Self {
            to_add: desired.difference(observed).copied().collect(),
            to_remove: observed.difference(desired).copied().collect(),
        }
    }

    /// True when the pool already matches the desired set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }

    /// The membership that results from applying this diff to `observed`.
    #[must_use]
    pub fn apply(&self, observed: &EndpointSet) -> EndpointSet {
        observed
            .union(&self.to_add)
            .filter(|endpoint| !self.to_remove.contains(endpoint))
            .copied()
            .collect()
    }
}

/// Shorthand for [`MembershipDiff::between`].
#[must_use]
pub fn diff(desired: &EndpointSet, observed: &EndpointSet) -> MembershipDiff {
    MembershipDiff::between(desired, observed)
}
