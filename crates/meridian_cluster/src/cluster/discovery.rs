//! Master/client discovery protocol.
//!
//! One node per cluster generation is the master (its id is named in every
//! profile); everyone else is a client. Three subjects, all derived from the
//! master id:
//!
//! * `meridian.discovery.<masterId>.register` — client→master request; the
//!   reply is the membership the joiner has not seen yet.
//! * `meridian.discovery.<masterId>.addMember` — master→all broadcast of a
//!   newly registered member.
//! * `meridian.discovery.<masterId>.unregister` — any→all broadcast of a
//!   departing node id.
//!
//! `addMember` broadcasts can race the `register` reply, so clients apply
//! both check-then-add; the registry converges regardless of arrival order.
//! Loss of the master is observable (registration retries log warnings) but
//! not repaired here.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use meridian_wire::serialize::{marshal, unmarshal};
use meridian_wire::Serializer;

use crate::bus::BusClient;
use crate::cluster::{Member, MemberList, MemberRegistry};
use crate::error::ClusterError;

/// Deadline for one register request; retries are spaced by the bus
/// reconnect delay.
const REGISTER_TIMEOUT: Duration = Duration::from_secs(3);

/// Observer of membership changes applied to the local registry.
pub trait DiscoveryListener: Send + Sync + 'static {
    fn on_add_member(&self, _member: &Member) {}
    fn on_remove_member(&self, _node_id: &str) {}
}

struct Subjects {
    register: String,
    add_member: String,
    unregister: String,
}

impl Subjects {
    fn for_master(master_id: &str) -> Self {
        Self {
            register: format!("meridian.discovery.{master_id}.register"),
            add_member: format!("meridian.discovery.{master_id}.addMember"),
            unregister: format!("meridian.discovery.{master_id}.unregister"),
        }
    }
}

struct DiscoveryInner {
    bus: BusClient,
    registry: Arc<MemberRegistry>,
    serializer: Arc<dyn Serializer>,
    self_member: Member,
    master_member: Member,
    subjects: Subjects,
    ready: watch::Sender<bool>,
    listeners: RwLock<Vec<Arc<dyn DiscoveryListener>>>,
}

impl DiscoveryInner {
    fn notify_add(&self, member: &Member) {
        for listener in self.listeners.read().iter() {
            listener.on_add_member(member);
        }
    }

    fn notify_remove(&self, node_id: &str) {
        for listener in self.listeners.read().iter() {
            listener.on_remove_member(node_id);
        }
    }
}

/// Discovery protocol endpoint for one node.
#[derive(Clone)]
pub struct Discovery {
    inner: Arc<DiscoveryInner>,
}

impl Discovery {
    pub fn new(
        bus: BusClient,
        registry: Arc<MemberRegistry>,
        serializer: Arc<dyn Serializer>,
        self_member: Member,
        master_member: Member,
    ) -> Self {
        let subjects = Subjects::for_master(&master_member.node_id);
        let (ready, _) = watch::channel(false);
        Self {
            inner: Arc::new(DiscoveryInner {
                bus,
                registry,
                serializer,
                self_member,
                master_member,
                subjects,
                ready,
                listeners: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn is_master(&self) -> bool {
        self.inner.self_member.node_id == self.inner.master_member.node_id
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow()
    }

    pub fn add_listener(&self, listener: Arc<dyn DiscoveryListener>) {
        self.inner.listeners.write().push(listener);
    }

    /// Subscribe the role-appropriate subjects and, for clients, begin the
    /// registration loop. Returns once subscriptions are in flight; use
    /// [`Discovery::wait_ready`] to block until bootstrap completes.
    pub async fn start(&self) -> Result<(), ClusterError> {
        self.spawn_unregister_task().await?;

        if self.is_master() {
            self.start_master().await
        } else {
            self.start_client().await
        }
    }

    /// Block until this node holds a bootstrapped registry: immediately for
    /// the master, after the first successful register for clients. Fails
    /// only when the bus client is closed underneath it.
    pub async fn wait_ready(&self) -> Result<(), ClusterError> {
        let mut rx = self.inner.ready.subscribe();
        loop {
            if *rx.borrow() {
                return Ok(());
            }
            if self.inner.bus.is_closed() {
                return Err(ClusterError::BusUnavailable);
            }
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(ClusterError::BusUnavailable);
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(50)) => {}
            }
        }
    }

    /// Announce departure. Clients publish their own id on `unregister`;
    /// the master's departure ends the generation and announces nothing.
    pub async fn stop(&self) {
        if self.is_master() || self.inner.bus.is_closed() {
            return;
        }
        match marshal(self.inner.serializer.as_ref(), &self.inner.self_member) {
            Ok(bytes) => {
                if let Err(e) = self.inner.bus.publish(&self.inner.subjects.unregister, bytes).await {
                    warn!("unregister publish failed: {e}");
                } else {
                    debug!(
                        "unregistered {} from master {}",
                        self.inner.self_member.node_id, self.inner.master_member.node_id
                    );
                }
            }
            Err(e) => warn!("unregister marshal failed: {e}"),
        }
    }

    async fn spawn_unregister_task(&self) -> Result<(), ClusterError> {
        let mut sub = self.inner.bus.subscribe(&self.inner.subjects.unregister).await?;
        let inner = self.inner.clone();
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let member: Member = match unmarshal(inner.serializer.as_ref(), &msg.data) {
                    Ok(member) => member,
                    Err(e) => {
                        warn!("unregister payload unmarshal failed: {e}");
                        continue;
                    }
                };
                // A node never evicts itself on someone else's say-so.
                if member.node_id == inner.self_member.node_id {
                    continue;
                }
                if inner.registry.remove(&member.node_id).is_some() {
                    info!("member {} left the cluster", member.node_id);
                    inner.notify_remove(&member.node_id);
                }
            }
        });
        Ok(())
    }

    async fn start_master(&self) -> Result<(), ClusterError> {
        let inner = &self.inner;

        // A different record under the master id means another process
        // already declared itself master for this generation.
        if let Some(existing) = inner.registry.get(&inner.master_member.node_id) {
            if existing != inner.master_member {
                return Err(ClusterError::MemberConflict(inner.master_member.node_id.clone()));
            }
        }
        inner.registry.add(inner.master_member.clone())?;
        let _ = inner.ready.send(true);

        let mut sub = inner.bus.subscribe(&inner.subjects.register).await?;
        let inner = inner.clone();
        tokio::spawn(async move {
            while let Some(msg) = sub.next().await {
                let member: Member = match unmarshal(inner.serializer.as_ref(), &msg.data) {
                    Ok(member) => member,
                    Err(e) => {
                        warn!("register payload unmarshal failed ({} bytes): {e}", msg.data.len());
                        continue;
                    }
                };

                let newly_added = match inner.registry.add(member.clone()) {
                    Ok(newly_added) => newly_added,
                    Err(e) => {
                        // Conflicting identity: no reply, the operator has
                        // two nodes fighting over one id.
                        warn!("rejected registration of {}: {e}", member.node_id);
                        continue;
                    }
                };

                let reply = MemberList {
                    list: inner
                        .registry
                        .snapshot()
                        .into_iter()
                        .filter(|m| {
                            m.node_id != member.node_id
                                && m.node_id != inner.self_member.node_id
                        })
                        .collect(),
                };
                match marshal(inner.serializer.as_ref(), &reply) {
                    Ok(bytes) => {
                        if let Err(e) = inner.bus.respond(&msg, bytes).await {
                            warn!("register reply failed: {e}");
                            continue;
                        }
                    }
                    Err(e) => {
                        warn!("register reply marshal failed: {e}");
                        continue;
                    }
                }

                if newly_added {
                    info!("member {} joined the cluster", member);
                    inner.notify_add(&member);
                    // Re-publish the original bytes so every client ingests
                    // exactly what the master stored.
                    if let Err(e) = inner
                        .bus
                        .publish(&inner.subjects.add_member, msg.data.clone())
                        .await
                    {
                        warn!("addMember broadcast failed: {e}");
                    }
                }
            }
        });

        info!(
            "discovery running as master [{}]",
            self.inner.self_member.node_id
        );
        Ok(())
    }

    async fn start_client(&self) -> Result<(), ClusterError> {
        let inner = &self.inner;

        let mut add_sub = inner.bus.subscribe(&inner.subjects.add_member).await?;
        {
            let inner = inner.clone();
            tokio::spawn(async move {
                while let Some(msg) = add_sub.next().await {
                    let member: Member = match unmarshal(inner.serializer.as_ref(), &msg.data) {
                        Ok(member) => member,
                        Err(e) => {
                            warn!("addMember payload unmarshal failed: {e}");
                            continue;
                        }
                    };
                    if inner.registry.contains(&member.node_id) {
                        continue;
                    }
                    match inner.registry.add(member.clone()) {
                        Ok(true) => inner.notify_add(&member),
                        Ok(false) => {}
                        Err(e) => warn!("addMember ignored: {e}"),
                    }
                }
            });
        }

        let payload = marshal(inner.serializer.as_ref(), &inner.self_member)?;
        let inner = inner.clone();
        tokio::spawn(async move {
            loop {
                if inner.bus.is_closed() {
                    return;
                }
                match inner
                    .bus
                    .request(&inner.subjects.register, payload.clone(), REGISTER_TIMEOUT)
                    .await
                {
                    Ok(data) => {
                        let list: MemberList = match unmarshal(inner.serializer.as_ref(), &data) {
                            Ok(list) => list,
                            Err(e) => {
                                warn!("register reply unmarshal failed: {e}");
                                tokio::time::sleep(inner.bus.reconnect_delay()).await;
                                continue;
                            }
                        };
                        for member in list.list {
                            if inner.registry.contains(&member.node_id) {
                                continue;
                            }
                            match inner.registry.add(member.clone()) {
                                Ok(true) => inner.notify_add(&member),
                                Ok(false) => {}
                                Err(e) => warn!("bootstrap member ignored: {e}"),
                            }
                        }
                        // The master itself is part of the view.
                        let _ = inner.registry.add(inner.master_member.clone());
                        let _ = inner.registry.add(inner.self_member.clone());
                        info!(
                            "registered {} with master {}",
                            inner.self_member.node_id, inner.master_member.node_id
                        );
                        let _ = inner.ready.send(true);
                        return;
                    }
                    Err(e) => {
                        warn!(
                            "register with master {} failed, retrying: {e}",
                            inner.master_member.node_id
                        );
                    }
                }
                tokio::time::sleep(inner.bus.reconnect_delay()).await;
            }
        });

        info!(
            "discovery running as client [{}] of master [{}]",
            self.inner.self_member.node_id, self.inner.master_member.node_id
        );
        Ok(())
    }
}
