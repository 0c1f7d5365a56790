//! Member records exchanged by the discovery protocol.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// One node's identity as registered in the cluster.
///
/// Within a cluster generation, a node id always maps to byte-equal fields;
/// changing any of them requires an unregister/register pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub node_id: String,
    /// Short type tag: `center`, `gate`, `game`, ...
    pub node_type: String,
    /// Bus-reachable endpoint.
    pub address: String,
    /// Opaque string hints (zone, capacity, build, ...).
    #[serde(default)]
    pub settings: HashMap<String, String>,
}

impl Member {
    pub fn new(
        node_id: impl Into<String>,
        node_type: impl Into<String>,
        address: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_type: node_type.into(),
            address: address.into(),
            settings: HashMap::new(),
        }
    }
}

impl std::fmt::Display for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})@{}", self.node_id, self.node_type, self.address)
    }
}

/// Reply payload of a `register` request: the membership the joiner missed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemberList {
    pub list: Vec<Member>,
}
