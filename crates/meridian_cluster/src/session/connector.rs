//! Accept loops feeding connections into agents.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

use meridian_wire::{MessageCodec, Serializer};

use crate::error::ClusterError;
use crate::session::agent::{Agent, AgentOptions};
use crate::session::conn::{tcp_conn, ws_conn, AgentConn};
use crate::session::session::SessionTable;

/// Builds one agent per accepted connection, sharing the node-wide session
/// table, serializer, codec and options.
#[derive(Clone)]
pub struct AgentFactory {
    pub sessions: Arc<SessionTable>,
    pub serializer: Arc<dyn Serializer>,
    pub codec: Arc<MessageCodec>,
    pub options: AgentOptions,
}

impl AgentFactory {
    /// Create the session and agent for `conn` and start its workers.
    pub fn spawn(&self, conn: AgentConn) -> Arc<Agent> {
        let session = self.sessions.create(conn.remote_addr.clone());
        debug!("{session} accepted");
        let agent = Agent::new(
            session,
            self.sessions.clone(),
            self.serializer.clone(),
            self.codec.clone(),
            self.options.clone(),
        );
        agent.run(conn);
        agent
    }
}

/// A listening socket turning connections into agents. Dropping the
/// connector stops the accept loop; live agents run to their own close.
pub struct Connector {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
}

impl Connector {
    /// Serve the raw TCP framing.
    pub async fn bind_tcp(addr: &str, factory: AgentFactory) -> Result<Self, ClusterError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        tokio::spawn(accept_loop(listener, factory, shutdown_rx, false));
        info!("tcp connector listening on {local_addr}");
        Ok(Self {
            local_addr,
            shutdown,
        })
    }

    /// Serve the same packet protocol over binary WebSocket messages.
    pub async fn bind_ws(addr: &str, factory: AgentFactory) -> Result<Self, ClusterError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        tokio::spawn(accept_loop(listener, factory, shutdown_rx, true));
        info!("websocket connector listening on {local_addr}");
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

impl Drop for Connector {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn accept_loop(
    listener: TcpListener,
    factory: AgentFactory,
    mut shutdown: watch::Receiver<bool>,
    websocket: bool,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    debug!("connector stopping");
                    return;
                }
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let factory = factory.clone();
                    tokio::spawn(async move {
                        if websocket {
                            match tokio_tungstenite::accept_async(stream).await {
                                Ok(ws) => {
                                    factory.spawn(ws_conn(ws, peer.to_string()));
                                }
                                Err(e) => debug!("websocket upgrade from {peer} failed: {e}"),
                            }
                        } else {
                            factory.spawn(tcp_conn(stream));
                        }
                    });
                }
                Err(e) => {
                    error!("connector accept failed: {e}");
                    return;
                }
            }
        }
    }
}
