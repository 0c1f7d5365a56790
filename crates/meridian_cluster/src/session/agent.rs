//! The per-connection agent: reader and writer workers, outbound queues,
//! heartbeat enforcement and teardown.
//!
//! Exactly two workers touch a connection. The reader pulls chunks, decodes
//! packets and hands them to commands; the writer is the only thing that
//! writes (kick excepted), which is what makes per-session send order a
//! guarantee rather than an accident. The two meet only through the agent's
//! queues and the death signal.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, warn};

use meridian_wire::serialize::marshal;
use meridian_wire::{Message, MessageCodec, MessageType, Packet, PacketDecoder, PacketType, Serializer, WireError};

use crate::session::command::Command;
use crate::session::conn::{AgentConn, ConnReader, ConnWriter};
use crate::session::session::{unix_now, Session, SessionState, SessionTable};

/// Default outbound backlog, matching the profile default.
pub const WRITE_BACKLOG: usize = 64;

/// Agent tuning plus the command table driving inbound dispatch.
#[derive(Clone)]
pub struct AgentOptions {
    /// Heartbeat deadline. Anything below one second falls back to the
    /// 60 second default.
    pub heartbeat: Duration,
    pub write_backlog: usize,
    pub commands: HashMap<PacketType, Arc<dyn Command>>,
    /// Maximum accepted packet body, handed to the frame decoder.
    pub packet_body_limit: usize,
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            heartbeat: Duration::from_secs(60),
            write_backlog: WRITE_BACKLOG,
            commands: HashMap::new(),
            packet_body_limit: meridian_wire::packet::DEFAULT_BODY_LIMIT,
        }
    }
}

impl AgentOptions {
    fn normalized(mut self) -> Self {
        if self.heartbeat < Duration::from_secs(1) {
            self.heartbeat = Duration::from_secs(60);
        }
        if self.write_backlog == 0 {
            self.write_backlog = WRITE_BACKLOG;
        }
        self
    }
}

/// Outbound payload. The writer serializes `Value` bodies itself; `Raw`
/// bodies pass through untouched. No runtime reflection anywhere.
#[derive(Debug, Clone)]
pub enum MessageBody {
    Raw(Vec<u8>),
    Value(serde_json::Value),
}

struct PendingMessage {
    typ: MessageType,
    route: String,
    mid: u32,
    body: MessageBody,
    error: bool,
}

type CloseHook = Box<dyn FnOnce(&Session) + Send>;

/// One agent per accepted connection.
pub struct Agent {
    session: Arc<Session>,
    table: Arc<SessionTable>,
    serializer: Arc<dyn Serializer>,
    codec: Arc<MessageCodec>,
    options: AgentOptions,
    writer: Arc<Mutex<Option<Box<dyn ConnWriter>>>>,
    ch_send: mpsc::Sender<PendingMessage>,
    ch_write: mpsc::Sender<Vec<u8>>,
    die: watch::Sender<bool>,
    close_lock: Mutex<()>,
    on_close: parking_lot::Mutex<Vec<CloseHook>>,
    dropped_sends: AtomicU64,
    protocol_errors: AtomicU64,
    // Receivers parked here between new() and run().
    queues: parking_lot::Mutex<Option<(mpsc::Receiver<PendingMessage>, mpsc::Receiver<Vec<u8>>)>>,
}

impl Agent {
    pub fn new(
        session: Arc<Session>,
        table: Arc<SessionTable>,
        serializer: Arc<dyn Serializer>,
        codec: Arc<MessageCodec>,
        options: AgentOptions,
    ) -> Arc<Self> {
        let options = options.normalized();
        let (ch_send, send_rx) = mpsc::channel(options.write_backlog);
        let (ch_write, write_rx) = mpsc::channel(options.write_backlog);
        let (die, _) = watch::channel(false);

        Arc::new(Self {
            session,
            table,
            serializer,
            codec,
            options,
            writer: Arc::new(Mutex::new(None)),
            ch_send,
            ch_write,
            die,
            close_lock: Mutex::new(()),
            on_close: parking_lot::Mutex::new(Vec::new()),
            dropped_sends: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            queues: parking_lot::Mutex::new(Some((send_rx, write_rx))),
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn codec(&self) -> &MessageCodec {
        &self.codec
    }

    pub fn serializer(&self) -> &Arc<dyn Serializer> {
        &self.serializer
    }

    pub fn heartbeat(&self) -> Duration {
        self.options.heartbeat
    }

    /// Messages dropped by backpressure or a closed session.
    pub fn dropped_sends(&self) -> u64 {
        self.dropped_sends.load(Ordering::Relaxed)
    }

    /// Frames rejected by the packet decoder on this connection.
    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    /// Register a hook to run during close, before the death signal fires.
    pub fn on_close(&self, hook: impl FnOnce(&Session) + Send + 'static) {
        self.on_close.lock().push(Box::new(hook));
    }

    /// Start the reader and writer workers for `conn`.
    pub fn run(self: &Arc<Self>, conn: AgentConn) {
        let AgentConn { reader, writer, .. } = conn;
        match self.writer.try_lock() {
            Ok(mut slot) => *slot = Some(writer),
            Err(_) => {
                warn!("{} run called on a live agent", self.session);
                return;
            }
        }

        let agent = self.clone();
        tokio::spawn(async move { agent.read_loop(reader).await });

        let agent = self.clone();
        tokio::spawn(async move { agent.write_loop().await });
    }

    /// Queue an application message. Drops (with a warning and a counter
    /// bump) when the session is closed or the backlog is full — slow
    /// consumers lose messages rather than stalling the writer.
    pub fn send(
        &self,
        typ: MessageType,
        route: impl Into<String>,
        mid: u32,
        body: MessageBody,
        is_error: bool,
    ) -> bool {
        if self.session.state() == SessionState::Closed {
            warn!("{} send on closed session", self.session);
            self.dropped_sends.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        let pending = PendingMessage {
            typ,
            route: route.into(),
            mid,
            body,
            error: is_error,
        };
        match self.ch_send.try_send(pending) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("{} send buffer exceeded, dropping message", self.session);
                self.dropped_sends.fetch_add(1, Ordering::Relaxed);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped_sends.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Push a server-initiated message down this session.
    pub fn push(&self, route: impl Into<String>, body: MessageBody) -> bool {
        self.send(MessageType::Push, route, 0, body, false)
    }

    /// Answer the request correlated by `mid`.
    pub fn response(&self, mid: u32, body: MessageBody) -> bool {
        self.send(MessageType::Response, "", mid, body, false)
    }

    /// Answer with the error flag set.
    pub fn response_error(&self, mid: u32, body: MessageBody) -> bool {
        self.send(MessageType::Response, "", mid, body, true)
    }

    /// Queue pre-framed bytes, skipping the message codec.
    pub fn send_raw(&self, bytes: Vec<u8>) -> bool {
        self.ch_write.try_send(bytes).is_ok()
    }

    /// Disconnect the client with a reason, writing the kick frame directly
    /// so it beats anything still queued.
    pub async fn kick(&self, reason: &serde_json::Value) {
        let bytes = match marshal(self.serializer.as_ref(), reason) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("{} kick marshal failed: {e}", self.session);
                return;
            }
        };
        let frame = match Packet::new(PacketType::Kick, bytes).encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("{} kick encode failed: {e}", self.session);
                return;
            }
        };
        let mut writer = self.writer.lock().await;
        if let Some(writer) = writer.as_mut() {
            if let Err(e) = writer.write_all(&frame).await {
                warn!("{} kick write failed: {e}", self.session);
            }
        }
        debug!("{} kicked: {reason}", self.session);
    }

    /// Tear the session down. Idempotent and serialized; the writer observes
    /// the death signal and finishes draining on its own schedule.
    pub async fn close(&self) {
        let _guard = self.close_lock.lock().await;
        if self.session.state() == SessionState::Closed {
            return;
        }
        self.session.set_state(SessionState::Closed);

        let hooks: Vec<CloseHook> = std::mem::take(&mut *self.on_close.lock());
        for hook in hooks {
            hook(&self.session);
        }

        self.table.remove(self.session.sid());
        let _ = self.die.send(true);

        let mut writer = self.writer.lock().await;
        if let Some(writer) = writer.as_mut() {
            if let Err(e) = writer.shutdown().await {
                debug!("{} connection shutdown: {e}", self.session);
            }
        }
        debug!("{} closed", self.session);
    }

    async fn read_loop(self: Arc<Self>, mut reader: Box<dyn ConnReader>) {
        let mut decoder = PacketDecoder::with_body_limit(self.options.packet_body_limit);
        let mut die_rx = self.die.subscribe();

        'outer: loop {
            let chunk = tokio::select! {
                biased;
                _ = die_rx.changed() => break 'outer,
                chunk = reader.read_chunk() => match chunk {
                    Ok(chunk) if !chunk.is_empty() => chunk,
                    Ok(_) => break 'outer,
                    Err(e) => {
                        debug!("{} read ended: {e}", self.session);
                        break 'outer;
                    }
                },
            };

            decoder.feed(&chunk);
            loop {
                match decoder.next_packet() {
                    Ok(Some(packet)) => self.process_packet(packet).await,
                    Ok(None) => break,
                    Err(e @ WireError::PacketTooLarge { .. }) => {
                        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
                        warn!("{} fatal frame error: {e}", self.session);
                        break 'outer;
                    }
                    Err(e) => {
                        // Malformed but bounded frame: log, count, carry on.
                        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
                        warn!("{} skipping bad frame: {e}", self.session);
                    }
                }
            }
        }

        self.close().await;
    }

    async fn process_packet(&self, packet: Packet) {
        let Some(command) = self.options.commands.get(&packet.typ) else {
            debug!("{} no command for {packet}", self.session);
            return;
        };
        command.execute(self, &packet).await;
        self.session.touch();
    }

    async fn write_loop(self: Arc<Self>) {
        let (mut send_rx, mut write_rx) = match self.queues.lock().take() {
            Some(queues) => queues,
            None => {
                warn!("{} write loop started twice", self.session);
                return;
            }
        };
        let mut die_rx = self.die.subscribe();
        let mut ticker = tokio::time::interval(self.options.heartbeat);
        let heartbeat_secs = self.options.heartbeat.as_secs() as i64;

        loop {
            tokio::select! {
                biased;
                _ = die_rx.changed() => {
                    if *die_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let deadline = unix_now() - heartbeat_secs;
                    if self.session.last_at() < deadline {
                        debug!("{} heartbeat timeout", self.session);
                        break;
                    }
                }
                bytes = write_rx.recv() => match bytes {
                    Some(bytes) => {
                        let mut writer = self.writer.lock().await;
                        let Some(writer) = writer.as_mut() else { break };
                        if let Err(e) = writer.write_all(&bytes).await {
                            warn!("{} write failed: {e}", self.session);
                            break;
                        }
                    }
                    None => break,
                },
                pending = send_rx.recv() => match pending {
                    Some(pending) => {
                        if let Some(frame) = self.encode_pending(pending) {
                            if self.ch_write.try_send(frame).is_err() {
                                warn!("{} raw write queue full, dropping frame", self.session);
                                self.dropped_sends.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                    }
                    None => break,
                },
            }
        }

        // The writer owns queue teardown: receivers drop here, after the
        // death signal, and nowhere else.
        drop(send_rx);
        drop(write_rx);
        self.close().await;
    }

    fn encode_pending(&self, pending: PendingMessage) -> Option<Vec<u8>> {
        let data = match pending.body {
            MessageBody::Raw(bytes) => bytes,
            MessageBody::Value(value) => match self.serializer.serialize_value(&value) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("{} payload serialize failed: {e}", self.session);
                    return None;
                }
            },
        };
        let message = Message {
            typ: pending.typ,
            id: pending.mid,
            route: pending.route,
            data,
            error: pending.error,
        };
        let encoded = match self.codec.encode(&message) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("{} message encode failed: {e}", self.session);
                return None;
            }
        };
        match Packet::new(PacketType::Data, encoded).encode() {
            Ok(frame) => Some(frame),
            Err(e) => {
                warn!("{} packet encode failed: {e}", self.session);
                None
            }
        }
    }
}
