//! Embeddable subject broker.
//!
//! A minimal fan-out hub: it tracks which connection subscribed to which
//! subject and forwards every publish to the matching subscriptions. It
//! performs no persistence, no redelivery, and no authentication — the
//! cluster trusts its bus.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::bus::frame::{read_frame, write_frame, Frame};
use crate::error::ClusterError;

/// Outbound queue per broker connection. A subscriber that cannot drain this
/// many frames is shedding load; further deliveries to it are dropped.
const CONN_OUTBOX: usize = 1024;

struct BrokerState {
    /// subject -> (connection id, subscription id) fan-out list.
    subs: RwLock<HashMap<String, Vec<(u64, u64)>>>,
    /// connection id -> outbound frame queue.
    conns: dashmap::DashMap<u64, mpsc::Sender<Frame>>,
    next_conn: AtomicU64,
}

/// A running broker bound to a local TCP address.
///
/// Shuts down when dropped; accepting no new connections and letting
/// existing connection tasks end with their sockets.
pub struct Broker {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl Broker {
    /// Bind and start serving. `127.0.0.1:0` picks an ephemeral port for
    /// tests; [`Broker::local_addr`] reports the final address.
    pub async fn bind(addr: &str) -> Result<Self, ClusterError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let state = Arc::new(BrokerState {
            subs: RwLock::new(HashMap::new()),
            conns: dashmap::DashMap::new(),
            next_conn: AtomicU64::new(1),
        });

        tokio::spawn(accept_loop(listener, state, shutdown_rx));
        info!("bus broker listening on {local_addr}");

        Ok(Self {
            local_addr,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    state: Arc<BrokerState>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("broker accept loop stopping");
                    return;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let conn_id = state.next_conn.fetch_add(1, Ordering::Relaxed);
                    debug!("bus connection {conn_id} from {peer}");
                    tokio::spawn(serve_connection(stream, conn_id, state.clone()));
                }
                Err(e) => {
                    warn!("bus accept failed: {e}");
                    return;
                }
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, conn_id: u64, state: Arc<BrokerState>) {
    let (mut rd, mut wr) = stream.into_split();
    let (tx, mut rx) = mpsc::channel::<Frame>(CONN_OUTBOX);
    state.conns.insert(conn_id, tx);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_frame(&mut wr, &frame).await.is_err() {
                return;
            }
        }
    });

    loop {
        match read_frame(&mut rd).await {
            Ok(Frame::Sub { sid, subject }) => {
                state.subs.write().entry(subject).or_default().push((conn_id, sid));
            }
            Ok(Frame::Unsub { sid }) => {
                let mut subs = state.subs.write();
                for list in subs.values_mut() {
                    list.retain(|(c, s)| !(*c == conn_id && *s == sid));
                }
                subs.retain(|_, list| !list.is_empty());
            }
            Ok(Frame::Pub { subject, reply, data }) => {
                let targets = state
                    .subs
                    .read()
                    .get(&subject)
                    .cloned()
                    .unwrap_or_default();
                for (target_conn, sid) in targets {
                    if let Some(outbox) = state.conns.get(&target_conn) {
                        let delivery = Frame::Msg {
                            sid,
                            subject: subject.clone(),
                            reply: reply.clone(),
                            data: data.clone(),
                        };
                        if outbox.try_send(delivery).is_err() {
                            warn!("dropping delivery of {subject}: connection {target_conn} backed up");
                        }
                    }
                }
            }
            // Only clients originate frames; a Msg from a client is garbage.
            Ok(Frame::Msg { .. }) => {
                warn!("connection {conn_id} sent a broker-only frame, closing");
                break;
            }
            Err(e) => {
                debug!("bus connection {conn_id} closed: {e}");
                break;
            }
        }
    }

    state.conns.remove(&conn_id);
    {
        let mut subs = state.subs.write();
        for list in subs.values_mut() {
            list.retain(|(c, _)| *c != conn_id);
        }
        subs.retain(|_, list| !list.is_empty());
    }
    writer.abort();
}
