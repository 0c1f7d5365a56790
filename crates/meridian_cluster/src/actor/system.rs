//! Local actor table, mailboxes and the RPC dispatch algorithm.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use meridian_wire::serialize::{marshal, unmarshal};
use meridian_wire::{Code, Serializer};

use crate::actor::path::ActorPath;
use crate::actor::remote::{rpc_subject, RemoteRequest, RemoteResponse};
use crate::bus::BusClient;
use crate::cluster::MemberRegistry;
use crate::error::ClusterError;

/// Deadline applied to every `call_wait`, local or remote.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Envelopes queued per actor before senders are pushed back.
const MAILBOX_CAPACITY: usize = 256;

const RUNNING: u8 = 1;
const STOPPING: u8 = 2;
const STOPPED: u8 = 3;

/// A unit of game logic addressable through the actor system.
///
/// One logical worker drives each actor, so `handle` invocations for a given
/// actor never overlap and arrive in mailbox order. Handlers may await
/// freely — including `call_wait` to other actors — without blocking anyone
/// but their own mailbox.
#[async_trait::async_trait]
pub trait ActorHandler: Send + Sync + 'static {
    /// Execute `func` against `payload`, returning the serialized response.
    /// Fire-and-forget envelopes discard the response.
    async fn handle(&self, func: &str, payload: &[u8]) -> Result<Vec<u8>, Code>;
}

struct ActorEnvelope {
    source: String,
    func: String,
    payload: Vec<u8>,
    child: Option<String>,
    reply: Option<oneshot::Sender<Result<Vec<u8>, Code>>>,
}

struct ActorEntry {
    handler: Arc<dyn ActorHandler>,
    children: Arc<DashMap<String, Arc<dyn ActorHandler>>>,
    tx: mpsc::Sender<ActorEnvelope>,
    state: Arc<AtomicU8>,
}

struct SystemInner {
    node_id: String,
    serializer: Arc<dyn Serializer>,
    registry: Arc<MemberRegistry>,
    bus: Option<BusClient>,
    actors: DashMap<String, ActorEntry>,
    call_timeout: Duration,
    running: AtomicBool,
}

/// The RPC plane for one node. Cheap to clone.
#[derive(Clone)]
pub struct ActorSystem {
    inner: Arc<SystemInner>,
}

impl ActorSystem {
    pub fn new(
        node_id: impl Into<String>,
        serializer: Arc<dyn Serializer>,
        registry: Arc<MemberRegistry>,
        bus: Option<BusClient>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SystemInner {
                node_id: node_id.into(),
                serializer,
                registry,
                bus,
                actors: DashMap::new(),
                call_timeout,
                running: AtomicBool::new(true),
            }),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    pub fn has_actor(&self, actor_id: &str) -> bool {
        self.inner.actors.contains_key(actor_id)
    }

    /// Install a local actor and start its mailbox worker.
    pub fn register(
        &self,
        actor_id: &str,
        handler: Arc<dyn ActorHandler>,
    ) -> Result<(), ClusterError> {
        if actor_id.is_empty() || actor_id.contains('.') {
            return Err(ClusterError::Config(format!("invalid actor id {actor_id:?}")));
        }
        match self.inner.actors.entry(actor_id.to_string()) {
            Entry::Occupied(_) => Err(ClusterError::ActorAlreadyExists(actor_id.to_string())),
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
                let state = Arc::new(AtomicU8::new(RUNNING));
                let children: Arc<DashMap<String, Arc<dyn ActorHandler>>> =
                    Arc::new(DashMap::new());
                slot.insert(ActorEntry {
                    handler: handler.clone(),
                    children: children.clone(),
                    tx,
                    state: state.clone(),
                });
                tokio::spawn(actor_worker(
                    actor_id.to_string(),
                    handler,
                    children,
                    state,
                    rx,
                ));
                debug!("actor {actor_id} registered");
                Ok(())
            }
        }
    }

    /// Attach a child under `parent`. The child shares the parent's worker
    /// and dies with it.
    pub fn register_child(
        &self,
        parent: &str,
        child_id: &str,
        handler: Arc<dyn ActorHandler>,
    ) -> Result<(), ClusterError> {
        if child_id.is_empty() || child_id.contains('.') {
            return Err(ClusterError::Config(format!("invalid child id {child_id:?}")));
        }
        let entry = self
            .inner
            .actors
            .get(parent)
            .ok_or_else(|| ClusterError::ParentActorNotFound(parent.to_string()))?;
        if entry.children.contains_key(child_id) {
            return Err(ClusterError::ActorAlreadyExists(format!("{parent}.{child_id}")));
        }
        entry.children.insert(child_id.to_string(), handler);
        Ok(())
    }

    /// Stop one actor: reject new envelopes, drain in-flight ones, then the
    /// worker exits. Children stop with their parent.
    pub fn stop_actor(&self, actor_id: &str) {
        if let Some((_, entry)) = self.inner.actors.remove(actor_id) {
            entry.state.store(STOPPING, Ordering::Release);
            // Dropping the entry's sender lets the worker drain and exit.
        }
    }

    /// Stop every actor and refuse further calls with `AppIsStop`.
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::Release);
        let ids: Vec<String> = self.inner.actors.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.stop_actor(&id);
        }
    }

    /// Fire-and-forget dispatch of a typed payload.
    pub async fn call<Req: Serialize>(
        &self,
        source: &str,
        target: &str,
        func: &str,
        req: &Req,
    ) -> Code {
        if !self.inner.running.load(Ordering::Acquire) {
            return Code::AppIsStop;
        }
        let payload = match marshal(self.inner.serializer.as_ref(), req) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("marshal for {target}.{func} failed: {e}");
                return Code::MarshalError;
            }
        };
        self.call_raw(source, target, func, payload).await
    }

    /// Fire-and-forget dispatch of an already-serialized payload. The
    /// returned code reports local validation only; once an envelope leaves
    /// this node, delivery is best-effort.
    pub async fn call_raw(
        &self,
        source: &str,
        target: &str,
        func: &str,
        payload: Vec<u8>,
    ) -> Code {
        if !self.inner.running.load(Ordering::Acquire) {
            return Code::AppIsStop;
        }
        let path = match self.resolve(target) {
            Ok(path) => path,
            Err(code) => return code,
        };

        if path.node_id == self.inner.node_id {
            return self.deliver_local(source, &path, func, payload, None).await;
        }

        if self.inner.registry.get(&path.node_id).is_none() {
            return Code::DiscoveryNotFoundNode;
        }
        let Some(bus) = &self.inner.bus else {
            return Code::NetError;
        };
        let request = RemoteRequest {
            source: source.to_string(),
            target: path.to_string(),
            func: func.to_string(),
            payload,
        };
        match marshal(self.inner.serializer.as_ref(), &request) {
            Ok(bytes) => {
                // Past this point delivery is fire-and-forget by contract.
                if let Err(e) = bus.publish(&rpc_subject(&path.node_id), bytes).await {
                    debug!("call publish to {} dropped: {e}", path.node_id);
                }
                Code::Ok
            }
            Err(e) => {
                warn!("marshal of envelope for {target}.{func} failed: {e}");
                Code::MarshalError
            }
        }
    }

    /// Request/response dispatch of a typed payload with the system call
    /// deadline.
    pub async fn call_wait<Req: Serialize, Rsp: DeserializeOwned>(
        &self,
        source: &str,
        target: &str,
        func: &str,
        req: &Req,
    ) -> Result<Rsp, Code> {
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(Code::AppIsStop);
        }
        let payload = marshal(self.inner.serializer.as_ref(), req).map_err(|e| {
            warn!("marshal for {target}.{func} failed: {e}");
            Code::MarshalError
        })?;

        let response_bytes = self.call_wait_raw(source, target, func, payload).await?;
        unmarshal(self.inner.serializer.as_ref(), &response_bytes).map_err(|e| {
            warn!("response unmarshal from {target}.{func} failed: {e}");
            Code::UnmarshalError
        })
    }

    /// Request/response dispatch carrying already-serialized bytes, for
    /// callers (the gate data path) that forward client payloads untouched.
    pub async fn call_wait_raw(
        &self,
        source: &str,
        target: &str,
        func: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, Code> {
        if !self.inner.running.load(Ordering::Acquire) {
            return Err(Code::AppIsStop);
        }
        let path = self.resolve(target)?;
        if path.node_id == self.inner.node_id {
            self.local_call_wait(source, &path, func, payload).await
        } else {
            self.remote_call_wait(source, &path, func, payload).await
        }
    }

    /// Execute an envelope that arrived over the bus for a local actor.
    pub(crate) async fn handle_remote(&self, request: RemoteRequest) -> RemoteResponse {
        if !self.inner.running.load(Ordering::Acquire) {
            return RemoteResponse::fail(Code::AppIsStop);
        }
        let path = match self.resolve(&request.target) {
            Ok(path) => path,
            Err(code) => return RemoteResponse::fail(code),
        };
        if path.node_id != self.inner.node_id {
            warn!("envelope for {} delivered to {}", path, self.inner.node_id);
            return RemoteResponse::fail(Code::HandlerError);
        }
        match self
            .local_call_wait(&request.source, &path, &request.func, request.payload)
            .await
        {
            Ok(payload) => RemoteResponse { code: 0, payload },
            Err(code) => RemoteResponse::fail(code),
        }
    }

    fn resolve(&self, target: &str) -> Result<ActorPath, Code> {
        let mut path = ActorPath::parse(target)?;
        if path.node_id.is_empty() {
            // Routing policy for blank node ids: the local node.
            path.node_id = self.inner.node_id.clone();
        }
        Ok(path)
    }

    fn handler_for(&self, path: &ActorPath) -> Result<Arc<dyn ActorHandler>, Code> {
        let entry = self.inner.actors.get(&path.actor_id).ok_or(Code::HandlerError)?;
        if entry.state.load(Ordering::Acquire) != RUNNING {
            return Err(Code::HandlerError);
        }
        match &path.child_id {
            Some(child) => entry
                .children
                .get(child)
                .map(|h| h.clone())
                .ok_or(Code::HandlerError),
            None => Ok(entry.handler.clone()),
        }
    }

    async fn deliver_local(
        &self,
        source: &str,
        path: &ActorPath,
        func: &str,
        payload: Vec<u8>,
        reply: Option<oneshot::Sender<Result<Vec<u8>, Code>>>,
    ) -> Code {
        let (tx, state) = match self.inner.actors.get(&path.actor_id) {
            Some(entry) => (entry.tx.clone(), entry.state.clone()),
            None => return Code::HandlerError,
        };
        if state.load(Ordering::Acquire) != RUNNING {
            return Code::HandlerError;
        }
        let envelope = ActorEnvelope {
            source: source.to_string(),
            func: func.to_string(),
            payload,
            child: path.child_id.clone(),
            reply,
        };
        match tx.send(envelope).await {
            Ok(()) => Code::Ok,
            Err(_) => Code::HandlerError,
        }
    }

    async fn local_call_wait(
        &self,
        source: &str,
        path: &ActorPath,
        func: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, Code> {
        // A handler calling its own actor would wait on a mailbox its own
        // worker is busy with; run such calls inline instead.
        if let Ok(src) = ActorPath::parse(source) {
            let src_is_local = src.node_id.is_empty() || src.node_id == self.inner.node_id;
            if src_is_local && src.actor_id == path.actor_id {
                let handler = self.handler_for(path)?;
                return handler.handle(func, &payload).await;
            }
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let delivered = self
            .deliver_local(source, path, func, payload, Some(reply_tx))
            .await;
        if delivered.is_fail() {
            return Err(delivered);
        }
        match tokio::time::timeout(self.inner.call_timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Code::HandlerError),
            Err(_) => Err(Code::NetError),
        }
    }

    async fn remote_call_wait(
        &self,
        source: &str,
        path: &ActorPath,
        func: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, Code> {
        if self.inner.registry.get(&path.node_id).is_none() {
            return Err(Code::DiscoveryNotFoundNode);
        }
        let Some(bus) = &self.inner.bus else {
            return Err(Code::NetError);
        };

        let request = RemoteRequest {
            source: source.to_string(),
            target: path.to_string(),
            func: func.to_string(),
            payload,
        };
        let bytes = marshal(self.inner.serializer.as_ref(), &request)
            .map_err(|_| Code::MarshalError)?;

        let data = bus
            .request(&rpc_subject(&path.node_id), bytes, self.inner.call_timeout)
            .await
            .map_err(|e| {
                warn!("rpc to {} failed: {e}", path.node_id);
                Code::NetError
            })?;

        let response: RemoteResponse =
            unmarshal(self.inner.serializer.as_ref(), &data).map_err(|e| {
                warn!("rpc response from {} undecodable: {e}", path.node_id);
                Code::UnmarshalError
            })?;

        match Code::try_from(response.code) {
            Ok(Code::Ok) => Ok(response.payload),
            Ok(code) => Err(code),
            Err(raw) => {
                warn!("rpc to {} returned unknown code {raw}", path.node_id);
                Err(Code::RemoteExecuteError)
            }
        }
    }
}

/// One logical worker per actor: strict envelope ordering, no overlap.
async fn actor_worker(
    actor_id: String,
    handler: Arc<dyn ActorHandler>,
    children: Arc<DashMap<String, Arc<dyn ActorHandler>>>,
    state: Arc<AtomicU8>,
    mut rx: mpsc::Receiver<ActorEnvelope>,
) {
    while let Some(envelope) = rx.recv().await {
        let target = match &envelope.child {
            Some(child) => match children.get(child) {
                Some(h) => h.clone(),
                None => {
                    if let Some(reply) = envelope.reply {
                        let _ = reply.send(Err(Code::HandlerError));
                    }
                    continue;
                }
            },
            None => handler.clone(),
        };

        let outcome = std::panic::AssertUnwindSafe(target.handle(&envelope.func, &envelope.payload))
            .catch_unwind()
            .await;
        match outcome {
            Ok(result) => {
                if let Some(reply) = envelope.reply {
                    let _ = reply.send(result);
                }
            }
            Err(panic) => {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".to_string());
                error!(
                    "actor {actor_id} panicked in {}: {detail}; stopping actor",
                    envelope.func
                );
                if let Some(reply) = envelope.reply {
                    let _ = reply.send(Err(Code::RemoteExecuteError));
                }
                state.store(STOPPED, Ordering::Release);
                return;
            }
        }
    }
    state.store(STOPPED, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_wire::JsonSerializer;
    use std::sync::atomic::AtomicU32;

    fn local_system() -> ActorSystem {
        ActorSystem::new(
            "test-node",
            Arc::new(JsonSerializer),
            Arc::new(MemberRegistry::new()),
            None,
            Duration::from_secs(2),
        )
    }

    struct Echo;

    #[async_trait::async_trait]
    impl ActorHandler for Echo {
        async fn handle(&self, func: &str, payload: &[u8]) -> Result<Vec<u8>, Code> {
            match func {
                "echo" => Ok(payload.to_vec()),
                "fail" => Err(Code::RemoteExecuteError),
                "boom" => panic!("scripted failure"),
                _ => Err(Code::NotImplement),
            }
        }
    }

    /// Appends the sequence number from each envelope and stalls, so
    /// interleaving would be visible in the recorded order.
    struct Sequencer {
        log: Arc<parking_lot::Mutex<Vec<u32>>>,
        busy: Arc<AtomicU32>,
    }

    #[async_trait::async_trait]
    impl ActorHandler for Sequencer {
        async fn handle(&self, _func: &str, payload: &[u8]) -> Result<Vec<u8>, Code> {
            let n: u32 = serde_json::from_slice(payload).map_err(|_| Code::UnmarshalError)?;
            assert_eq!(
                self.busy.fetch_add(1, Ordering::SeqCst),
                0,
                "handler invocations overlapped"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.log.lock().push(n);
            self.busy.fetch_sub(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn local_call_wait_round_trip() {
        let system = local_system();
        system.register("echo", Arc::new(Echo)).unwrap();
        let out: String = system
            .call_wait("", "test-node.echo", "echo", &"hello".to_string())
            .await
            .unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn empty_node_id_routes_locally() {
        let system = local_system();
        system.register("echo", Arc::new(Echo)).unwrap();
        let out: i64 = system.call_wait("", ".echo", "echo", &42i64).await.unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn unknown_actor_is_handler_error() {
        let system = local_system();
        let err = system
            .call_wait::<_, serde_json::Value>("", "test-node.ghost", "x", &())
            .await
            .unwrap_err();
        assert_eq!(err, Code::HandlerError);
    }

    #[tokio::test]
    async fn unknown_node_is_discovery_miss() {
        let system = local_system();
        let err = system
            .call_wait::<_, serde_json::Value>("", "nope.account", "getUID", &())
            .await
            .unwrap_err();
        assert_eq!(err, Code::DiscoveryNotFoundNode);
    }

    #[tokio::test]
    async fn bad_path_is_route_decode_error() {
        let system = local_system();
        let err = system
            .call_wait::<_, serde_json::Value>("", "a.b.c.d", "x", &())
            .await
            .unwrap_err();
        assert_eq!(err, Code::RouteDecodeError);
    }

    #[tokio::test]
    async fn handler_error_codes_propagate() {
        let system = local_system();
        system.register("echo", Arc::new(Echo)).unwrap();
        let err = system
            .call_wait::<_, serde_json::Value>("", ".echo", "fail", &())
            .await
            .unwrap_err();
        assert_eq!(err, Code::RemoteExecuteError);
    }

    #[tokio::test]
    async fn mailbox_preserves_order_without_overlap() {
        let system = local_system();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        system
            .register(
                "seq",
                Arc::new(Sequencer {
                    log: log.clone(),
                    busy: Arc::new(AtomicU32::new(0)),
                }),
            )
            .unwrap();

        for n in 0u32..32 {
            assert!(system.call("", ".seq", "note", &n).await.is_ok());
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(*log.lock(), (0u32..32).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let system = local_system();
        system.register("echo", Arc::new(Echo)).unwrap();
        assert!(matches!(
            system.register("echo", Arc::new(Echo)),
            Err(ClusterError::ActorAlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn stopped_actor_rejects_new_envelopes() {
        let system = local_system();
        system.register("echo", Arc::new(Echo)).unwrap();
        system.stop_actor("echo");
        let err = system
            .call_wait::<_, serde_json::Value>("", ".echo", "echo", &1)
            .await
            .unwrap_err();
        assert_eq!(err, Code::HandlerError);
    }

    #[tokio::test]
    async fn panic_stops_only_the_offending_actor() {
        let system = local_system();
        system.register("echo", Arc::new(Echo)).unwrap();
        system.register("other", Arc::new(Echo)).unwrap();

        let err = system
            .call_wait::<_, serde_json::Value>("", ".echo", "boom", &())
            .await
            .unwrap_err();
        assert_eq!(err, Code::RemoteExecuteError);

        // The panicked actor is gone...
        let err = system
            .call_wait::<_, serde_json::Value>("", ".echo", "echo", &1)
            .await
            .unwrap_err();
        assert_eq!(err, Code::HandlerError);

        // ...while its neighbor still answers.
        let out: i64 = system.call_wait("", ".other", "echo", &7i64).await.unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn child_shares_parent_and_dies_with_it() {
        let system = local_system();
        system.register("room", Arc::new(Echo)).unwrap();
        system.register_child("room", "1001", Arc::new(Echo)).unwrap();

        let out: i64 = system
            .call_wait("", ".room.1001", "echo", &5i64)
            .await
            .unwrap();
        assert_eq!(out, 5);

        system.stop_actor("room");
        let err = system
            .call_wait::<_, serde_json::Value>("", ".room.1001", "echo", &5)
            .await
            .unwrap_err();
        assert_eq!(err, Code::HandlerError);
    }

    /// A handler that issues `call_wait` against its own actor; must not
    /// deadlock the mailbox worker.
    struct SelfCaller {
        system: parking_lot::Mutex<Option<ActorSystem>>,
    }

    #[async_trait::async_trait]
    impl ActorHandler for SelfCaller {
        async fn handle(&self, func: &str, _payload: &[u8]) -> Result<Vec<u8>, Code> {
            match func {
                "outer" => {
                    let system = self.system.lock().clone().unwrap();
                    let inner: i64 = system
                        .call_wait("test-node.loopy", ".loopy", "inner", &())
                        .await?;
                    Ok(serde_json::to_vec(&(inner + 1)).map_err(|_| Code::MarshalError)?)
                }
                "inner" => Ok(b"41".to_vec()),
                _ => Err(Code::NotImplement),
            }
        }
    }

    #[tokio::test]
    async fn self_call_does_not_deadlock() {
        let system = local_system();
        let handler = Arc::new(SelfCaller {
            system: parking_lot::Mutex::new(Some(system.clone())),
        });
        system.register("loopy", handler).unwrap();

        let out: i64 = tokio::time::timeout(
            Duration::from_secs(3),
            system.call_wait("", ".loopy", "outer", &()),
        )
        .await
        .expect("self call deadlocked")
        .unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn shutdown_returns_app_is_stop() {
        let system = local_system();
        system.register("echo", Arc::new(Echo)).unwrap();
        system.shutdown();
        let err = system
            .call_wait::<_, serde_json::Value>("", ".echo", "echo", &1)
            .await
            .unwrap_err();
        assert_eq!(err, Code::AppIsStop);
    }
}
