//! Remote leg of the RPC plane.
//!
//! Outbound envelopes are published on a subject derived only from the
//! target node id, so every node computes the same address without any
//! coordination. Each node subscribes its own subject at startup and
//! answers request-style envelopes on their reply inbox.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use meridian_wire::serialize::{marshal, unmarshal};

use crate::actor::ActorSystem;
use crate::bus::BusClient;

/// The per-node RPC subject. Identical derivation on every node.
pub fn rpc_subject(node_id: &str) -> String {
    format!("meridian.rpc.{node_id}")
}

/// A call envelope crossing the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteRequest {
    /// Caller's actor path, or empty for non-actor callers.
    pub source: String,
    /// Fully resolved target path.
    pub target: String,
    pub func: String,
    /// Payload, already serialized with the cluster serializer.
    pub payload: Vec<u8>,
}

/// Reply to a [`RemoteRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteResponse {
    /// A [`meridian_wire::Code`] value; 0 carries a payload.
    pub code: i32,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl RemoteResponse {
    pub fn fail(code: meridian_wire::Code) -> Self {
        Self {
            code: code.into(),
            payload: Vec::new(),
        }
    }
}

/// Subscribe this node's RPC subject and serve inbound envelopes until the
/// bus closes. Fire-and-forget envelopes (no reply inbox) are dispatched
/// without answering.
pub async fn spawn_rpc_responder(
    system: ActorSystem,
    bus: BusClient,
    serializer: std::sync::Arc<dyn meridian_wire::Serializer>,
) -> Result<(), crate::error::ClusterError> {
    let mut sub = bus.subscribe(&rpc_subject(system.node_id())).await?;

    tokio::spawn(async move {
        while let Some(msg) = sub.next().await {
            let request: RemoteRequest = match unmarshal(serializer.as_ref(), &msg.data) {
                Ok(request) => request,
                Err(e) => {
                    warn!("undecodable rpc envelope ({} bytes): {e}", msg.data.len());
                    continue;
                }
            };

            // Serve each envelope on its own task; a slow handler must not
            // stall the subscription.
            let system = system.clone();
            let bus = bus.clone();
            let serializer = serializer.clone();
            tokio::spawn(async move {
                let wants_reply = msg.reply.is_some();
                let response = system.handle_remote(request).await;
                if !wants_reply {
                    return;
                }
                match marshal(serializer.as_ref(), &response) {
                    Ok(bytes) => {
                        if let Err(e) = bus.respond(&msg, bytes).await {
                            debug!("rpc reply dropped: {e}");
                        }
                    }
                    Err(e) => warn!("rpc reply marshal failed: {e}"),
                }
            });
        }
        debug!("rpc responder stopped");
    });
    Ok(())
}
