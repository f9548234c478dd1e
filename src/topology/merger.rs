//! Flat knob names → per-role node overrides.

use std::collections::BTreeMap;

use tracing::debug;

use super::TopologyDocument;
use crate::knob::{KnobScope, KnobSet, RoleMap};

/// Merges role-namespaced knobs into a [`TopologyDocument`].
///
/// `tikv.storage.block-cache.capacity = 8GB` becomes
/// `config: {storage.block-cache.capacity: 8GB}` on **every** node listed
/// under the `tikv` role's section. Keys without a known role prefix are
/// ignored here; they are global variables.
#[derive(Debug, Clone, Default)]
pub struct TopologyMerger {
    roles: RoleMap,
}

/// Nodes written per role by one merge.
pub type MergeCounts = BTreeMap<String, usize>;

impl TopologyMerger {
    pub fn new(roles: RoleMap) -> Self {
        Self { roles }
    }

    pub fn roles(&self) -> &RoleMap {
        &self.roles
    }

    /// Pure merge. Never fails; values are stored as opaque scalars.
    pub fn merge(&self, mut topology: TopologyDocument, knobs: &KnobSet) -> TopologyDocument {
        self.merge_in_place(&mut topology, knobs);
        topology
    }

    /// Merge into `topology` and report how many nodes each role had written.
    ///
    /// Overwrites existing keys, so merging the same set twice is a no-op.
    pub fn merge_in_place(&self, topology: &mut TopologyDocument, knobs: &KnobSet) -> MergeCounts {
        let mut counts = MergeCounts::new();
        for (key, value) in knobs {
            let KnobScope::Role { role, name } = self.roles.classify(key) else {
                continue;
            };
            let Some(section) = self.roles.section(role) else {
                continue;
            };
            let written = topology.set_role_config(section, name, value);
            debug!(role, key = name, nodes = written, "merged role knob");
            let slot = counts.entry(role.to_string()).or_insert(0);
            *slot = (*slot).max(written);
        }
        counts
    }
}
