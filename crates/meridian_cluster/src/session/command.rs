//! Packet commands.
//!
//! The reader's dispatch table is a map from packet type to one of these.
//! The built-in set covers the protocol lifecycle (handshake, heartbeat)
//! and the `Data` path that turns client messages into actor calls; gates
//! can replace any entry with their own implementation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use meridian_wire::{Code, MessageType, Packet, PacketType};

use crate::actor::ActorSystem;
use crate::cluster::MemberRegistry;
use crate::session::agent::{Agent, MessageBody};
use crate::session::session::SessionState;

/// A handler for one packet type.
#[async_trait]
pub trait Command: Send + Sync + 'static {
    async fn execute(&self, agent: &Agent, packet: &Packet);
}

/// Replies to a `Handshake` with the session parameters the client needs:
/// the heartbeat interval and the route dictionary.
pub struct HandshakeCommand;

#[async_trait]
impl Command for HandshakeCommand {
    async fn execute(&self, agent: &Agent, _packet: &Packet) {
        let sys = json!({
            "heartbeat": agent.heartbeat().as_secs(),
            "dict": agent.codec().dictionary(),
        });
        let body = match agent.serializer().serialize_value(&json!({ "code": 200, "sys": sys })) {
            Ok(body) => body,
            Err(e) => {
                warn!("{} handshake reply serialize failed: {e}", agent.session());
                return;
            }
        };
        match Packet::new(PacketType::Handshake, body).encode() {
            Ok(frame) => {
                agent.send_raw(frame);
            }
            Err(e) => warn!("{} handshake reply encode failed: {e}", agent.session()),
        }
    }
}

/// Marks the session `Working` once the client acknowledges the handshake.
pub struct HandshakeAckCommand;

#[async_trait]
impl Command for HandshakeAckCommand {
    async fn execute(&self, agent: &Agent, _packet: &Packet) {
        agent.session().set_state(SessionState::Working);
        debug!("{} handshake complete", agent.session());
    }
}

/// Echoes heartbeats. The timestamp stamp happens in the reader for every
/// packet, so this only needs to answer.
pub struct HeartbeatCommand;

#[async_trait]
impl Command for HeartbeatCommand {
    async fn execute(&self, agent: &Agent, _packet: &Packet) {
        match Packet::new(PacketType::Heartbeat, Vec::new()).encode() {
            Ok(frame) => {
                agent.send_raw(frame);
            }
            Err(e) => warn!("{} heartbeat encode failed: {e}", agent.session()),
        }
    }
}

/// Decodes `Data` packets and dispatches them into the actor system.
///
/// Client routes have the shape `nodeType.actorId.funcName`. A route whose
/// node type matches this node is served locally; any other type is routed
/// to the earliest-registered member of that type.
pub struct DataCommand {
    system: ActorSystem,
    registry: Arc<MemberRegistry>,
    local_node_type: String,
}

impl DataCommand {
    pub fn new(system: ActorSystem, registry: Arc<MemberRegistry>, local_node_type: String) -> Self {
        Self {
            system,
            registry,
            local_node_type,
        }
    }

    /// Map a client route onto an actor path and function.
    fn resolve_route(&self, route: &str) -> Result<(String, String), Code> {
        let segments: Vec<&str> = route.split('.').collect();
        let [node_type, actor_id, func] = segments.as_slice() else {
            return Err(Code::RouteDecodeError);
        };
        if node_type.is_empty() || actor_id.is_empty() || func.is_empty() {
            return Err(Code::RouteDecodeError);
        }

        let target_node = if *node_type == self.local_node_type {
            String::new() // blank node id: dispatch locally
        } else {
            match self.registry.first_of_type(node_type) {
                Some(member) => member.node_id,
                None => return Err(Code::RouteHashError),
            }
        };
        Ok((format!("{target_node}.{actor_id}"), func.to_string()))
    }
}

#[async_trait]
impl Command for DataCommand {
    async fn execute(&self, agent: &Agent, packet: &Packet) {
        if !agent.session().is_working() {
            warn!("{} data before handshake ack, ignoring", agent.session());
            return;
        }

        let message = match agent.codec().decode(&packet.body) {
            Ok(message) => message,
            Err(e) => {
                warn!("{} undecodable message: {e}", agent.session());
                return;
            }
        };

        let (target, func) = match self.resolve_route(&message.route) {
            Ok(resolved) => resolved,
            Err(code) => {
                warn!(
                    "{} route {:?} rejected: {code}",
                    agent.session(),
                    message.route
                );
                if message.typ == MessageType::Request {
                    agent.response_error(
                        message.id,
                        MessageBody::Value(json!({ "code": i32::from(code) })),
                    );
                }
                return;
            }
        };
        let source = format!("{}.session.{}", self.system.node_id(), agent.session().sid());

        match message.typ {
            MessageType::Request => {
                match self
                    .system
                    .call_wait_raw(&source, &target, &func, message.data)
                    .await
                {
                    Ok(payload) => {
                        agent.response(message.id, MessageBody::Raw(payload));
                    }
                    Err(code) => {
                        agent.response_error(
                            message.id,
                            MessageBody::Value(json!({ "code": i32::from(code) })),
                        );
                    }
                }
            }
            MessageType::Notify => {
                let code = self
                    .system
                    .call_raw(&source, &target, &func, message.data)
                    .await;
                if code.is_fail() {
                    debug!("{} notify {target}.{func} dropped: {code}", agent.session());
                }
            }
            MessageType::Response | MessageType::Push => {
                warn!(
                    "{} sent a server-side message type {:?}",
                    agent.session(),
                    message.typ
                );
            }
        }
    }
}

/// The standard gate command table.
pub fn default_commands(
    system: ActorSystem,
    registry: Arc<MemberRegistry>,
    local_node_type: String,
) -> HashMap<PacketType, Arc<dyn Command>> {
    let mut commands: HashMap<PacketType, Arc<dyn Command>> = HashMap::new();
    commands.insert(PacketType::Handshake, Arc::new(HandshakeCommand));
    commands.insert(PacketType::HandshakeAck, Arc::new(HandshakeAckCommand));
    commands.insert(PacketType::Heartbeat, Arc::new(HeartbeatCommand));
    commands.insert(
        PacketType::Data,
        Arc::new(DataCommand::new(system, registry, local_node_type)),
    );
    commands
}
