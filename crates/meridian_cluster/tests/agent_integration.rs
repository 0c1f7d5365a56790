//! Agent-level integration: real TCP clients speaking the packet protocol
//! against gate-side agents.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use meridian_cluster::actor::ActorHandler;
use meridian_cluster::app::ApplicationBuilder;
use meridian_cluster::bus::Broker;
use meridian_cluster::config::Profile;
use meridian_cluster::session::{
    tcp_conn, Agent, AgentFactory, AgentOptions, Connector, MessageBody, SessionTable,
};
use meridian_wire::{
    Code, JsonSerializer, Message, MessageCodec, MessageType, Packet, PacketType,
};

async fn write_packet(stream: &mut TcpStream, typ: PacketType, body: Vec<u8>) {
    let frame = Packet::new(typ, body).encode().unwrap();
    stream.write_all(&frame).await.unwrap();
}

/// Read one frame off the socket; `None` on EOF.
async fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await.ok()?;
    let len = ((header[1] as usize) << 16) | ((header[2] as usize) << 8) | header[3] as usize;
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.ok()?;
    Some((header[0], body))
}

async fn handshake(stream: &mut TcpStream) -> serde_json::Value {
    write_packet(stream, PacketType::Handshake, b"{}".to_vec()).await;
    let (typ, body) = read_packet(stream).await.expect("handshake reply");
    assert_eq!(typ, PacketType::Handshake as u8);
    write_packet(stream, PacketType::HandshakeAck, Vec::new()).await;
    serde_json::from_slice(&body).unwrap()
}

struct EchoActor;

#[async_trait]
impl ActorHandler for EchoActor {
    async fn handle(&self, func: &str, payload: &[u8]) -> Result<Vec<u8>, Code> {
        match func {
            "echo" => Ok(payload.to_vec()),
            _ => Err(Code::NotImplement),
        }
    }
}

/// Single-node profile where the gate itself is the discovery master, with a
/// short heartbeat for timeout tests.
fn gate_profile(addr: &str, heartbeat_secs: u64) -> Profile {
    Profile::from_str(&format!(
        r#"
[cluster.bus]
master_node_id = "gate-1"
address = "{addr}"
reconnect_delay_ms = 200

[node.gate-1]
node_type = "gate"
rpc_address = "{addr}"

[node.center-1]
node_type = "center"
rpc_address = "{addr}"

[agent]
heartbeat_secs = {heartbeat_secs}
"#
    ))
    .unwrap()
}

/// A bare factory for tests that drive agents without a cluster behind them.
fn bare_factory(options: AgentOptions) -> AgentFactory {
    AgentFactory {
        sessions: Arc::new(SessionTable::new()),
        serializer: Arc::new(JsonSerializer),
        codec: Arc::new(MessageCodec::new()),
        options,
    }
}

/// Accept exactly one connection and hand back the agent driving it.
async fn accept_one(listener: &TcpListener, factory: &AgentFactory) -> Arc<Agent> {
    let (stream, _) = listener.accept().await.unwrap();
    factory.spawn(tcp_conn(stream))
}

#[tokio::test(flavor = "multi_thread")]
async fn handshake_then_request_hits_local_actor() {
    let broker = Broker::bind("127.0.0.1:0").await.unwrap();
    let profile = gate_profile(&broker.local_addr().to_string(), 60);
    let app = ApplicationBuilder::new(profile, "gate-1").start().await.unwrap();
    app.actor_system().register("echo", Arc::new(EchoActor)).unwrap();

    let connector = Connector::bind_tcp("127.0.0.1:0", app.agent_factory())
        .await
        .unwrap();
    let mut client = TcpStream::connect(connector.local_addr()).await.unwrap();

    let reply = handshake(&mut client).await;
    assert_eq!(reply["sys"]["heartbeat"], 60);

    let codec = MessageCodec::new();
    let request = codec
        .encode(&Message::request(1, "gate.echo.echo", br#"{"x":1}"#.to_vec()))
        .unwrap();
    write_packet(&mut client, PacketType::Data, request).await;

    let (typ, body) = tokio::time::timeout(Duration::from_secs(5), read_packet(&mut client))
        .await
        .unwrap()
        .expect("response frame");
    assert_eq!(typ, PacketType::Data as u8);
    let response = codec.decode(&body).unwrap();
    assert_eq!(response.typ, MessageType::Response);
    assert_eq!(response.id, 1);
    assert!(!response.error);
    assert_eq!(response.data, br#"{"x":1}"#);

    app.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn request_routed_across_the_cluster() {
    let broker = Broker::bind("127.0.0.1:0").await.unwrap();
    let profile = gate_profile(&broker.local_addr().to_string(), 60);

    let gate = ApplicationBuilder::new(profile.clone(), "gate-1").start().await.unwrap();
    let center = ApplicationBuilder::new(profile, "center-1").start().await.unwrap();
    center.actor_system().register("account", Arc::new(EchoActor)).unwrap();

    let connector = Connector::bind_tcp("127.0.0.1:0", gate.agent_factory())
        .await
        .unwrap();
    let mut client = TcpStream::connect(connector.local_addr()).await.unwrap();
    handshake(&mut client).await;

    let codec = MessageCodec::new();
    let request = codec
        .encode(&Message::request(7, "center.account.echo", br#""hi""#.to_vec()))
        .unwrap();
    write_packet(&mut client, PacketType::Data, request).await;

    let (_, body) = tokio::time::timeout(Duration::from_secs(5), read_packet(&mut client))
        .await
        .unwrap()
        .expect("routed response");
    let response = codec.decode(&body).unwrap();
    assert_eq!(response.id, 7);
    assert!(!response.error);
    assert_eq!(response.data, br#""hi""#);

    // A route naming a type with no members fails with the error flag.
    let request = codec
        .encode(&Message::request(8, "game.room.join", b"{}".to_vec()))
        .unwrap();
    write_packet(&mut client, PacketType::Data, request).await;
    let (_, body) = tokio::time::timeout(Duration::from_secs(5), read_packet(&mut client))
        .await
        .unwrap()
        .expect("error response");
    let response = codec.decode(&body).unwrap();
    assert!(response.error);
    let detail: serde_json::Value = serde_json::from_slice(&response.data).unwrap();
    assert_eq!(detail["code"], i32::from(Code::RouteHashError));

    center.stop().await;
    gate.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn heartbeat_silence_closes_the_connection() {
    let broker = Broker::bind("127.0.0.1:0").await.unwrap();
    let profile = gate_profile(&broker.local_addr().to_string(), 1);
    let app = ApplicationBuilder::new(profile, "gate-1").start().await.unwrap();

    let connector = Connector::bind_tcp("127.0.0.1:0", app.agent_factory())
        .await
        .unwrap();
    let mut client = TcpStream::connect(connector.local_addr()).await.unwrap();
    handshake(&mut client).await;
    assert_eq!(app.sessions().count(), 1);

    // Silence for more than the heartbeat: the server must hang up.
    let eof = tokio::time::timeout(Duration::from_secs(4), read_packet(&mut client))
        .await
        .expect("server never closed the idle connection");
    assert!(eof.is_none());

    // And the session is gone from the table.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while app.sessions().count() != 0 {
        assert!(tokio::time::Instant::now() < deadline, "session not reaped");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    app.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pushes_arrive_in_send_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let factory = bare_factory(AgentOptions::default());

    let client_task = tokio::spawn(async move {
        let mut client = TcpStream::connect(addr).await.unwrap();
        let codec = MessageCodec::new();
        let mut seen = Vec::new();
        while seen.len() < 32 {
            let (typ, body) = tokio::time::timeout(Duration::from_secs(5), read_packet(&mut client))
                .await
                .unwrap()
                .expect("push frame");
            assert_eq!(typ, PacketType::Data as u8);
            let message = codec.decode(&body).unwrap();
            assert_eq!(message.typ, MessageType::Push);
            assert_eq!(message.route, "news.feed");
            let n: u32 = serde_json::from_slice(&message.data).unwrap();
            seen.push(n);
        }
        seen
    });

    let agent = accept_one(&listener, &factory).await;
    for n in 0u32..32 {
        // Pace the sends so the 64-slot backlog never drops any.
        while !agent.push("news.feed", MessageBody::Value(json!(n))) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    let seen = client_task.await.unwrap();
    assert_eq!(seen, (0u32..32).collect::<Vec<_>>());
    agent.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn backlog_overflow_drops_and_counts() {
    let table = Arc::new(SessionTable::new());
    let session = table.create("test".into());
    // No writer running, so nothing drains the 4-slot queue.
    let agent = Agent::new(
        session,
        table,
        Arc::new(JsonSerializer),
        Arc::new(MessageCodec::new()),
        AgentOptions {
            write_backlog: 4,
            ..AgentOptions::default()
        },
    );

    for n in 0..4 {
        assert!(agent.push("news.feed", MessageBody::Value(json!(n))));
    }
    assert_eq!(agent.dropped_sends(), 0);

    assert!(!agent.push("news.feed", MessageBody::Value(json!(99))));
    assert!(!agent.push("news.feed", MessageBody::Value(json!(100))));
    assert_eq!(agent.dropped_sends(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn oversize_frame_kills_only_its_connection() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let factory = bare_factory(AgentOptions {
        packet_body_limit: 1024,
        ..AgentOptions::default()
    });

    let mut healthy = TcpStream::connect(addr).await.unwrap();
    let healthy_agent = accept_one(&listener, &factory).await;

    let mut hostile = TcpStream::connect(addr).await.unwrap();
    let hostile_agent = accept_one(&listener, &factory).await;

    // Header claiming a 2 KiB body against a 1 KiB limit.
    hostile.write_all(&[4, 0x00, 0x08, 0x00]).await.unwrap();

    let eof = tokio::time::timeout(Duration::from_secs(3), read_packet(&mut hostile))
        .await
        .expect("oversize frame did not close the connection");
    assert!(eof.is_none());
    assert_eq!(hostile_agent.protocol_errors(), 1);

    // The neighbor session is untouched and still writable.
    assert_eq!(healthy_agent.protocol_errors(), 0);
    assert!(healthy_agent.push("news.feed", MessageBody::Value(json!(1))));
    let (typ, _) = tokio::time::timeout(Duration::from_secs(3), read_packet(&mut healthy))
        .await
        .unwrap()
        .expect("healthy push");
    assert_eq!(typ, PacketType::Data as u8);

    healthy_agent.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn kick_reaches_the_client_immediately() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let factory = bare_factory(AgentOptions::default());

    let mut client = TcpStream::connect(addr).await.unwrap();
    let agent = accept_one(&listener, &factory).await;

    agent.kick(&json!("maintenance")).await;

    let (typ, body) = tokio::time::timeout(Duration::from_secs(3), read_packet(&mut client))
        .await
        .unwrap()
        .expect("kick frame");
    assert_eq!(typ, PacketType::Kick as u8);
    let reason: String = serde_json::from_slice(&body).unwrap();
    assert_eq!(reason, "maintenance");

    agent.close().await;
}
