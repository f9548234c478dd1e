//! # Stage: Topology
//!
//! ## Responsibility
//! Hold a cluster topology document as a lossless YAML tree, merge
//! role-namespaced knobs into the per-node `config` overrides, and talk to
//! the deployment tool that owns the document.
//!
//! ## Guarantees
//! - Fields the merge does not touch keep their structure and order.
//! - A node touched by the merge always ends with a `config` mapping.
//! - The document is never cached: every apply fetches it fresh.
//!
//! ## NOT Responsible For
//! - Deciding which knobs are global variables (see [`crate::driver`])
//! - Validating that a topology is deployable

pub mod merger;
pub mod tiup;

use async_trait::async_trait;
use serde_yaml::{Mapping, Value};
use tracing::warn;

use crate::error::{Result, TuneError};
use crate::knob::KnobValue;

pub use merger::TopologyMerger;
pub use tiup::TiupManager;

/// Key holding a node's configuration override mapping.
pub const NODE_CONFIG_KEY: &str = "config";

// ---------------------------------------------------------------------------
// TopologyDocument
// ---------------------------------------------------------------------------

/// A cluster topology: role sections (`tikv_servers`, ...) listing nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyDocument {
    root: Value,
}

impl TopologyDocument {
    /// Parse topology YAML. The top level must be a mapping.
    ///
    /// # Errors
    /// [`TuneError::InvalidTopology`] for unparsable YAML or a non-mapping root.
    pub fn parse(text: &str) -> Result<Self> {
        let root: Value =
            serde_yaml::from_str(text).map_err(|e| TuneError::InvalidTopology(e.to_string()))?;
        if !root.is_mapping() {
            return Err(TuneError::InvalidTopology(
                "top level is not a mapping".to_string(),
            ));
        }
        Ok(Self { root })
    }

    /// # Errors
    /// [`TuneError::InvalidTopology`] if the tree cannot be serialized.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(&self.root).map_err(|e| TuneError::InvalidTopology(e.to_string()))
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    /// Nodes listed under `section`; empty when the section is absent or not a list.
    pub fn nodes(&self, section: &str) -> &[Value] {
        self.root
            .get(section)
            .and_then(Value::as_sequence)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// The `config` override of the `index`-th node of `section`, if it is a mapping.
    pub fn node_config(&self, section: &str, index: usize) -> Option<&Mapping> {
        self.nodes(section)
            .get(index)?
            .get(NODE_CONFIG_KEY)?
            .as_mapping()
    }

    /// Set `key = value` in the `config` override of every node of `section`.
    ///
    /// Returns the number of nodes written. A missing or null `config` is
    /// replaced with an empty mapping first; nodes that are not mappings, or
    /// whose `config` is some other scalar, are skipped with a warning.
    pub fn set_role_config(&mut self, section: &str, key: &str, value: &KnobValue) -> usize {
        let Some(nodes) = self
            .root
            .get_mut(section)
            .and_then(Value::as_sequence_mut)
        else {
            return 0;
        };

        let mut written = 0;
        for (index, node) in nodes.iter_mut().enumerate() {
            let Some(node) = node.as_mapping_mut() else {
                warn!(section, index, "topology node is not a mapping, skipped");
                continue;
            };
            let config = node
                .entry(Value::from(NODE_CONFIG_KEY))
                .or_insert(Value::Null);
            if config.is_null() {
                *config = Value::Mapping(Mapping::new());
            }
            match config.as_mapping_mut() {
                Some(config) => {
                    config.insert(Value::from(key), value.to_yaml());
                    written += 1;
                }
                None => warn!(section, index, "node config is not a mapping, skipped"),
            }
        }
        written
    }
}

// ---------------------------------------------------------------------------
// TopologyManager
// ---------------------------------------------------------------------------

/// The deployment tool that stores the topology and pushes it to nodes.
#[async_trait]
pub trait TopologyManager: Send + Sync {
    /// Current topology text of `cluster`.
    async fn show_config(&self, cluster: &str) -> Result<String>;

    /// Replace the stored topology of `cluster` with `topology`.
    async fn edit_config(&self, cluster: &str, topology: &str) -> Result<()>;

    /// Restart the nodes of exactly `roles` so they pick up their new config.
    async fn reload(&self, cluster: &str, roles: &[String]) -> Result<()>;
}
