//! Bus client with transparent reconnection.
//!
//! A driver task owns the broker socket. Publishes queue through a bounded
//! channel the driver drains while connected; when the socket drops, the
//! driver backs off by the configured reconnect delay, re-establishes the
//! connection, replays every active subscription, and resumes draining.
//! Callers therefore treat the bus as eventually available — the only hard
//! failures are a closed client and a request deadline.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::bus::frame::{read_frame, write_frame, Frame};
use crate::error::ClusterError;

/// Publishes buffered while the driver reconnects. Beyond this, publishers
/// are pushed back by awaiting queue space.
const PUBLISH_BACKLOG: usize = 1024;

/// Per-subscription delivery buffer.
const DELIVERY_BACKLOG: usize = 256;

/// Tunables for a bus connection.
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Backoff between reconnect attempts.
    pub reconnect_delay: Duration,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            reconnect_delay: Duration::from_secs(3),
        }
    }
}

/// A message delivered to a subscription.
#[derive(Debug, Clone)]
pub struct BusMessage {
    pub subject: String,
    /// Reply subject when the publisher expects an answer.
    pub reply: Option<String>,
    pub data: Vec<u8>,
}

struct SubEntry {
    subject: String,
    tx: mpsc::Sender<BusMessage>,
}

struct ClientInner {
    options: BusOptions,
    out_tx: mpsc::Sender<Frame>,
    subs: DashMap<u64, SubEntry>,
    next_sid: AtomicU64,
    connected: AtomicBool,
    closed: watch::Sender<bool>,
}

/// Handle to the bus. Cheap to clone; all clones share one driver.
#[derive(Clone)]
pub struct BusClient {
    inner: Arc<ClientInner>,
}

impl BusClient {
    /// Connect to a broker. The initial connection must succeed; later
    /// disconnects are repaired automatically.
    pub async fn connect(addr: &str, options: BusOptions) -> Result<Self, ClusterError> {
        let stream = TcpStream::connect(addr).await?;
        let (out_tx, out_rx) = mpsc::channel(PUBLISH_BACKLOG);
        let (closed, closed_rx) = watch::channel(false);

        let inner = Arc::new(ClientInner {
            options,
            out_tx,
            subs: DashMap::new(),
            next_sid: AtomicU64::new(1),
            connected: AtomicBool::new(true),
            closed,
        });

        tokio::spawn(driver(inner.clone(), addr.to_string(), stream, out_rx, closed_rx));
        Ok(Self { inner })
    }

    /// The delay callers should honor between their own retry attempts.
    pub fn reconnect_delay(&self) -> Duration {
        self.inner.options.reconnect_delay
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed.borrow()
    }

    /// Fire-and-forget publish. Queues while the driver reconnects; fails
    /// only once the client is closed.
    pub async fn publish(&self, subject: &str, data: Vec<u8>) -> Result<(), ClusterError> {
        self.publish_with_reply(subject, None, data).await
    }

    async fn publish_with_reply(
        &self,
        subject: &str,
        reply: Option<String>,
        data: Vec<u8>,
    ) -> Result<(), ClusterError> {
        if self.is_closed() {
            return Err(ClusterError::BusUnavailable);
        }
        self.inner
            .out_tx
            .send(Frame::Pub {
                subject: subject.to_string(),
                reply,
                data,
            })
            .await
            .map_err(|_| ClusterError::BusUnavailable)
    }

    /// Subscribe to a subject. Delivery starts once the broker processes the
    /// subscription; the driver replays it after every reconnect.
    pub async fn subscribe(&self, subject: &str) -> Result<Subscription, ClusterError> {
        if self.is_closed() {
            return Err(ClusterError::BusUnavailable);
        }
        let sid = self.inner.next_sid.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(DELIVERY_BACKLOG);
        self.inner.subs.insert(
            sid,
            SubEntry {
                subject: subject.to_string(),
                tx,
            },
        );
        let subscribed = self
            .inner
            .out_tx
            .send(Frame::Sub {
                sid,
                subject: subject.to_string(),
            })
            .await;
        if subscribed.is_err() {
            self.inner.subs.remove(&sid);
            return Err(ClusterError::BusUnavailable);
        }
        Ok(Subscription {
            sid,
            subject: subject.to_string(),
            rx,
            client: self.clone(),
        })
    }

    /// Request/reply over a throwaway inbox subject.
    pub async fn request(
        &self,
        subject: &str,
        data: Vec<u8>,
        timeout: Duration,
    ) -> Result<Vec<u8>, ClusterError> {
        let inbox = format!("_INBOX.{}", Uuid::new_v4().simple());
        let mut sub = self.subscribe(&inbox).await?;
        self.publish_with_reply(subject, Some(inbox), data).await?;

        match tokio::time::timeout(timeout, sub.next()).await {
            Ok(Some(msg)) => Ok(msg.data),
            Ok(None) => Err(ClusterError::BusUnavailable),
            Err(_) => Err(ClusterError::BusTimeout(timeout)),
        }
    }

    /// Answer a request-style message on its reply subject. No-op for
    /// messages published without one.
    pub async fn respond(&self, msg: &BusMessage, data: Vec<u8>) -> Result<(), ClusterError> {
        match &msg.reply {
            Some(reply) => self.publish(reply, data).await,
            None => Ok(()),
        }
    }

    /// Close the client. Pending requests fail, subscriptions end, and the
    /// driver exits. Idempotent.
    pub fn close(&self) {
        let _ = self.inner.closed.send(true);
        self.inner.connected.store(false, Ordering::Release);
        self.inner.subs.clear();
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    sid: u64,
    subject: String,
    rx: mpsc::Receiver<BusMessage>,
    client: BusClient,
}

impl Subscription {
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Next delivery, or `None` once the client closes.
    pub async fn next(&mut self) -> Option<BusMessage> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.client.inner.subs.remove(&self.sid);
        let _ = self
            .client
            .inner
            .out_tx
            .try_send(Frame::Unsub { sid: self.sid });
    }
}

/// Connection driver: one per client, owns the socket across reconnects.
async fn driver(
    inner: Arc<ClientInner>,
    addr: String,
    first: TcpStream,
    mut out_rx: mpsc::Receiver<Frame>,
    mut closed_rx: watch::Receiver<bool>,
) {
    let mut stream = Some(first);

    'connection: loop {
        let current = match stream.take() {
            Some(s) => s,
            None => match reconnect(&inner, &addr, &mut closed_rx).await {
                Some(s) => s,
                None => return,
            },
        };

        let (rd, mut wr) = current.into_split();

        // Replay live subscriptions before draining queued publishes.
        let replay: Vec<(u64, String)> = inner
            .subs
            .iter()
            .map(|e| (*e.key(), e.subject.clone()))
            .collect();
        for (sid, subject) in replay {
            if write_frame(&mut wr, &Frame::Sub { sid, subject }).await.is_err() {
                continue 'connection;
            }
        }

        inner.connected.store(true, Ordering::Release);
        let mut reader = tokio::spawn(read_loop(rd, inner.clone()));

        loop {
            tokio::select! {
                _ = closed_rx.changed() => {
                    if *closed_rx.borrow() {
                        // Flush already-queued frames (a departing node's
                        // unregister rides here) before tearing down.
                        while let Ok(frame) = out_rx.try_recv() {
                            if write_frame(&mut wr, &frame).await.is_err() {
                                break;
                            }
                        }
                        reader.abort();
                        return;
                    }
                }
                frame = out_rx.recv() => match frame {
                    Some(frame) => {
                        if write_frame(&mut wr, &frame).await.is_err() {
                            reader.abort();
                            inner.connected.store(false, Ordering::Release);
                            continue 'connection;
                        }
                    }
                    // Every handle dropped: nobody can use the bus again.
                    None => {
                        reader.abort();
                        return;
                    }
                },
                _ = &mut reader => {
                    inner.connected.store(false, Ordering::Release);
                    continue 'connection;
                }
            }
        }
    }
}

async fn reconnect(
    inner: &Arc<ClientInner>,
    addr: &str,
    closed_rx: &mut watch::Receiver<bool>,
) -> Option<TcpStream> {
    loop {
        if *closed_rx.borrow() {
            return None;
        }
        tokio::select! {
            _ = closed_rx.changed() => {
                if *closed_rx.borrow() {
                    return None;
                }
            }
            _ = tokio::time::sleep(inner.options.reconnect_delay) => {
                match TcpStream::connect(addr).await {
                    Ok(stream) => {
                        debug!("bus reconnected to {addr}");
                        return Some(stream);
                    }
                    Err(e) => debug!("bus reconnect to {addr} failed: {e}"),
                }
            }
        }
    }
}

async fn read_loop(mut rd: OwnedReadHalf, inner: Arc<ClientInner>) {
    loop {
        match read_frame(&mut rd).await {
            Ok(Frame::Msg {
                sid,
                subject,
                reply,
                data,
            }) => {
                if let Some(entry) = inner.subs.get(&sid) {
                    let delivery = BusMessage {
                        subject,
                        reply,
                        data,
                    };
                    if entry.tx.try_send(delivery).is_err() {
                        warn!("subscription {sid} ({}) backed up, dropping delivery", entry.subject);
                    }
                }
            }
            // The broker only ever sends Msg.
            Ok(other) => debug!("ignoring unexpected bus frame: {other:?}"),
            Err(e) => {
                debug!("bus read loop ended: {e}");
                return;
            }
        }
    }
}
