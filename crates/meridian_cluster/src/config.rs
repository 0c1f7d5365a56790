//! Profile loading.
//!
//! A node boots from a TOML profile naming the bus endpoint, the master node
//! id, every node's identity, and agent tuning. Values that protect runtime
//! invariants (heartbeat, backlog) are clamped here so the rest of the code
//! never sees a pathological setting.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ClusterError;

/// Root profile structure, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub cluster: ClusterSettings,

    /// Per-node identity, keyed by node id.
    #[serde(default)]
    pub node: HashMap<String, NodeSettings>,

    #[serde(default)]
    pub agent: AgentSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    pub bus: BusSettings,
}

/// Settings for the subject bus connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSettings {
    /// Node id of the discovery master for this cluster generation.
    pub master_node_id: String,

    /// Broker endpoint, `host:port`.
    pub address: String,

    /// Backoff between reconnect attempts.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

impl BusSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

/// One node's identity as seen by the rest of the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Short type tag: `center`, `gate`, `game`, ...
    pub node_type: String,

    /// Bus-reachable endpoint advertised to peers.
    pub rpc_address: String,

    /// Opaque hints shipped with the member record.
    #[serde(default)]
    pub settings: HashMap<String, String>,
}

/// Session agent tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSettings {
    /// Heartbeat deadline in seconds. Values below 1 fall back to the
    /// 60 second default rather than producing a busy timer.
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    /// Capacity of the per-session send queue.
    #[serde(default = "default_write_backlog")]
    pub write_backlog: usize,
}

impl AgentSettings {
    pub fn heartbeat(&self) -> Duration {
        if self.heartbeat_secs < 1 {
            Duration::from_secs(default_heartbeat_secs())
        } else {
            Duration::from_secs(self.heartbeat_secs)
        }
    }

    pub fn write_backlog(&self) -> usize {
        if self.write_backlog == 0 {
            default_write_backlog()
        } else {
            self.write_backlog
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            heartbeat_secs: default_heartbeat_secs(),
            write_backlog: default_write_backlog(),
        }
    }
}

fn default_heartbeat_secs() -> u64 {
    60
}

fn default_write_backlog() -> usize {
    64
}

fn default_reconnect_delay_ms() -> u64 {
    3000
}

impl Profile {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ClusterError> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            ClusterError::Config(format!("read {}: {e}", path.as_ref().display()))
        })?;
        Self::from_str(&raw)
    }

    pub fn from_str(raw: &str) -> Result<Self, ClusterError> {
        let profile: Profile =
            toml::from_str(raw).map_err(|e| ClusterError::Config(e.to_string()))?;
        profile.validate()?;
        Ok(profile)
    }

    /// Identity of `node_id`, if the profile names it.
    pub fn node(&self, node_id: &str) -> Option<&NodeSettings> {
        self.node.get(node_id)
    }

    fn validate(&self) -> Result<(), ClusterError> {
        if self.cluster.bus.master_node_id.is_empty() {
            return Err(ClusterError::Config(
                "cluster.bus.master_node_id is required".into(),
            ));
        }
        if self.cluster.bus.address.is_empty() {
            return Err(ClusterError::Config("cluster.bus.address is required".into()));
        }
        if !self.node.contains_key(&self.cluster.bus.master_node_id) {
            return Err(ClusterError::Config(format!(
                "master node {} has no [node.{}] section",
                self.cluster.bus.master_node_id, self.cluster.bus.master_node_id
            )));
        }
        Ok(())
    }
}
