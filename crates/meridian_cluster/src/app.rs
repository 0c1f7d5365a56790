//! The application facade: one value owning a node's cluster runtime.
//!
//! Explicitly not a global — tests and tools routinely run several
//! applications (a whole cluster) inside one process, each built from its
//! own profile view.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use meridian_wire::{JsonSerializer, MessageCodec, Serializer};

use crate::actor::{spawn_rpc_responder, ActorSystem, DEFAULT_CALL_TIMEOUT};
use crate::bus::{BusClient, BusOptions};
use crate::cluster::{Discovery, Member, MemberRegistry};
use crate::config::Profile;
use crate::error::ClusterError;
use crate::session::{default_commands, AgentFactory, AgentOptions, SessionTable};

/// Staged configuration for an [`Application`].
pub struct ApplicationBuilder {
    profile: Profile,
    node_id: String,
    serializer: Arc<dyn Serializer>,
    codec: Arc<MessageCodec>,
}

impl ApplicationBuilder {
    pub fn new(profile: Profile, node_id: impl Into<String>) -> Self {
        Self {
            profile,
            node_id: node_id.into(),
            serializer: Arc::new(JsonSerializer),
            codec: Arc::new(MessageCodec::new()),
        }
    }

    /// Replace the default JSON serializer. Every node in a cluster must
    /// agree on this.
    pub fn serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    /// Install a route dictionary shared with clients at handshake.
    pub fn codec(mut self, codec: Arc<MessageCodec>) -> Self {
        self.codec = codec;
        self
    }

    /// Bring the node up: bus, registry, discovery (blocking until the
    /// registry is bootstrapped), then the RPC subscription.
    pub async fn start(self) -> Result<Application, ClusterError> {
        let Self {
            profile,
            node_id,
            serializer,
            codec,
        } = self;

        let node = profile
            .node(&node_id)
            .ok_or_else(|| ClusterError::Config(format!("no [node.{node_id}] section")))?
            .clone();
        let master_id = profile.cluster.bus.master_node_id.clone();
        let master_node = profile
            .node(&master_id)
            .ok_or_else(|| ClusterError::Config(format!("no [node.{master_id}] section")))?
            .clone();

        let self_member = Member {
            node_id: node_id.clone(),
            node_type: node.node_type.clone(),
            address: node.rpc_address.clone(),
            settings: node.settings.clone(),
        };
        let master_member = Member {
            node_id: master_id.clone(),
            node_type: master_node.node_type.clone(),
            address: master_node.rpc_address.clone(),
            settings: master_node.settings.clone(),
        };

        info!("starting node {} ({})", node_id, node.node_type);

        let bus = BusClient::connect(
            &profile.cluster.bus.address,
            BusOptions {
                reconnect_delay: profile.cluster.bus.reconnect_delay(),
            },
        )
        .await?;

        let registry = Arc::new(MemberRegistry::new());
        let discovery = Discovery::new(
            bus.clone(),
            registry.clone(),
            serializer.clone(),
            self_member.clone(),
            master_member,
        );
        discovery.start().await?;
        discovery.wait_ready().await?;

        let actor_system = ActorSystem::new(
            node_id.clone(),
            serializer.clone(),
            registry.clone(),
            Some(bus.clone()),
            DEFAULT_CALL_TIMEOUT,
        );
        spawn_rpc_responder(actor_system.clone(), bus.clone(), serializer.clone()).await?;

        info!("node {} is up, {} member(s) known", node_id, registry.member_count());

        Ok(Application {
            self_member,
            profile,
            serializer,
            codec,
            bus,
            registry,
            discovery,
            actor_system,
            sessions: Arc::new(SessionTable::new()),
            running: AtomicBool::new(true),
        })
    }
}

/// A running node. Owns the bus client, member registry, discovery endpoint
/// and actor system; gates additionally derive agent factories from it.
pub struct Application {
    self_member: Member,
    profile: Profile,
    serializer: Arc<dyn Serializer>,
    codec: Arc<MessageCodec>,
    bus: BusClient,
    registry: Arc<MemberRegistry>,
    discovery: Discovery,
    actor_system: ActorSystem,
    sessions: Arc<SessionTable>,
    running: AtomicBool,
}

impl Application {
    pub fn node_id(&self) -> &str {
        &self.self_member.node_id
    }

    pub fn node_type(&self) -> &str {
        &self.self_member.node_type
    }

    pub fn rpc_address(&self) -> &str {
        &self.self_member.address
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    pub fn actor_system(&self) -> &ActorSystem {
        &self.actor_system
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub fn registry(&self) -> &Arc<MemberRegistry> {
        &self.registry
    }

    pub fn bus(&self) -> &BusClient {
        &self.bus
    }

    pub fn sessions(&self) -> &Arc<SessionTable> {
        &self.sessions
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// The standard agent factory for this node: profile-tuned options and
    /// the built-in command table wired to the actor system.
    pub fn agent_factory(&self) -> AgentFactory {
        let options = AgentOptions {
            heartbeat: self.profile.agent.heartbeat(),
            write_backlog: self.profile.agent.write_backlog(),
            commands: default_commands(
                self.actor_system.clone(),
                self.registry.clone(),
                self.self_member.node_type.clone(),
            ),
            ..AgentOptions::default()
        };
        AgentFactory {
            sessions: self.sessions.clone(),
            serializer: self.serializer.clone(),
            codec: self.codec.clone(),
            options,
        }
    }

    /// Shut the node down in reverse of startup: announce departure, stop
    /// actors, close the bus. Idempotent.
    pub async fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            info!("stopping node {}", self.node_id());
            self.discovery.stop().await;
            self.actor_system.shutdown();
            self.bus.close();
        } else {
            warn!("stop called twice on node {}", self.node_id());
        }
    }
}
