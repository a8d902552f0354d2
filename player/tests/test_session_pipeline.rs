//! Integration tests for the session pipeline over a real WebSocket.
//!
//! Spins up an in-process server speaking the Sendspin control protocol,
//! connects the full player (session task + playout thread with a null
//! sink), and observes the state store from the outside.

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

use sendspin_common::{CodecTag, MediaFrame};
use sendspin_player::{
    ConnectionState, NullSink, Player, PlayerConfig, RecentServersStore, SinkFactory,
};

/// True server-minus-client clock offset the fake server lives at.
const SERVER_OFFSET_US: i64 = 10_000_000;

const WAIT: Duration = Duration::from_secs(5);

fn null_player() -> Player {
    // ---
    let factory: SinkFactory = Box::new(|| Box::new(NullSink::new()));
    Player::new(PlayerConfig::default(), factory).expect("player failed to start")
}

/// Accepts one client and speaks the server side of the protocol.
async fn spawn_server() -> (SocketAddr, tokio::task::JoinHandle<()>) {
    // ---
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("local_addr failed");

    let handle = tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        serve_client(stream).await;
    });

    (addr, handle)
}

async fn serve_client(stream: TcpStream) {
    // ---
    let mut ws = tokio_tungstenite::accept_async(stream)
        .await
        .expect("websocket accept failed");

    // Handshake: require a player hello before anything else.
    loop {
        let Some(Ok(msg)) = ws.next().await else {
            return;
        };
        if let Message::Text(text) = msg {
            let frame: Value = serde_json::from_str(&text).expect("client sent invalid JSON");
            if frame["type"] == "hello" {
                assert_eq!(frame["roles"][0], "player");
                assert!(frame["client_id"].is_string());
                break;
            }
        }
    }

    let ack = json!({
        "type": "hello_ack",
        "group_name": "integration",
        "supported_commands": ["play", "pause"],
        "stream": {
            "codec": "pcm",
            "sample_rate": 48_000,
            "channels": 2,
            "bit_depth": 16,
            "playback_state": "playing",
            "group_name": "integration"
        }
    });
    ws.send(Message::Text(ack.to_string()))
        .await
        .expect("failed to send hello_ack");

    let metadata = json!({
        "type": "metadata",
        "title": "Test Track",
        "artist": "Integration",
        "progress": { "position_ms": 1_000, "duration_ms": 60_000, "speed_milli": 1_000 },
        "server_ts_us": SERVER_OFFSET_US
    });
    ws.send(Message::Text(metadata.to_string()))
        .await
        .expect("failed to send metadata");

    // Five future-dated 20 ms chunks (960 frames of 16-bit stereo).
    for i in 0..5i64 {
        let chunk = MediaFrame::new(
            SERVER_OFFSET_US + 3_600_000_000 + i * 20_000,
            CodecTag::Pcm,
            vec![0u8; 960 * 2 * 2],
        );
        ws.send(Message::Binary(chunk.encode()))
            .await
            .expect("failed to send chunk");
    }

    // Server-commanded local volume.
    ws.send(Message::Text(
        json!({"type": "player_volume", "volume": 40}).to_string(),
    ))
    .await
    .expect("failed to send player_volume");

    // Answer clock probes until the client goes away.
    while let Some(Ok(msg)) = ws.next().await {
        match msg {
            Message::Text(text) => {
                let Ok(frame) = serde_json::from_str::<Value>(&text) else {
                    continue;
                };
                if frame["type"] == "time_probe" {
                    let t0 = frame["t0_us"].as_i64().expect("t0_us missing");
                    let s1 = t0 + 100 + SERVER_OFFSET_US;
                    let reply = json!({
                        "type": "time_probe_response",
                        "t0_us": t0,
                        "s1_us": s1,
                        "s2_us": s1 + 50
                    });
                    if ws.send(Message::Text(reply.to_string())).await.is_err() {
                        return;
                    }
                }
            }
            Message::Close(_) => return,
            _ => {}
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connect_stream_chunks_and_reset() {
    // ---
    let (addr, _server) = spawn_server().await;
    let mut player = null_player();

    let state = player.state();
    let mut connection = state.subscribe_connection();
    let mut stream_rx = state.subscribe_stream();
    let mut metadata_rx = state.subscribe_metadata();
    let mut buffer_rx = state.subscribe_buffer_stats();
    let mut local_rx = state.subscribe_local_player();

    player.connect(&format!("ws://{addr}/sendspin"));

    timeout(
        WAIT,
        connection.wait_for(|c| *c == ConnectionState::Connected),
    )
    .await
    .expect("never connected")
    .expect("state store closed");

    // The hello_ack carried the active stream.
    timeout(WAIT, stream_rx.wait_for(|s| s.is_some()))
        .await
        .expect("no stream descriptor")
        .expect("state store closed");
    {
        let descriptor = stream_rx.borrow().clone().expect("descriptor vanished");
        assert_eq!(descriptor.codec, "pcm");
        assert_eq!(descriptor.sample_rate, 48_000);
        assert_eq!(descriptor.group_name, "integration");
    }

    timeout(WAIT, metadata_rx.wait_for(|m| m.is_some()))
        .await
        .expect("no metadata")
        .expect("state store closed");
    {
        let metadata = metadata_rx.borrow().clone().expect("metadata vanished");
        assert_eq!(metadata.title.as_deref(), Some("Test Track"));
        assert!(metadata.progress.is_some());
    }

    // All five chunks queue up; the clock has not converged, so nothing
    // drains and the sink stays gated.
    timeout(WAIT, buffer_rx.wait_for(|b| b.queued_chunks >= 5))
        .await
        .expect("chunks never queued")
        .expect("state store closed");

    // The immediate first probe produced at least one clock measurement.
    timeout(WAIT, buffer_rx.wait_for(|b| b.clock_measurements >= 1))
        .await
        .expect("no clock measurement")
        .expect("state store closed");
    assert!(buffer_rx.borrow().round_trip_us >= 0);
    assert!(!buffer_rx.borrow().clock_converged);

    // The server-commanded volume reached the local player state, flagged
    // as server-originated.
    timeout(WAIT, local_rx.wait_for(|l| l.volume == 40 && l.from_server))
        .await
        .expect("volume command not applied")
        .expect("state store closed");

    // Disconnect returns every observable to its initial snapshot.
    player.disconnect();
    timeout(
        WAIT,
        connection.wait_for(|c| *c == ConnectionState::Disconnected),
    )
    .await
    .expect("never disconnected")
    .expect("state store closed");

    timeout(WAIT, stream_rx.wait_for(|s| s.is_none()))
        .await
        .expect("stream not reset")
        .expect("state store closed");
    timeout(WAIT, buffer_rx.wait_for(|b| b.queued_chunks == 0))
        .await
        .expect("buffer not reset")
        .expect("state store closed");

    player.release();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unreachable_server_reports_error() {
    // ---
    // Grab a port, then drop the listener so the connection is refused.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("local_addr failed");
    drop(listener);

    let mut player = null_player();
    let state = player.state();
    let mut connection = state.subscribe_connection();

    player.connect(&format!("ws://{addr}/sendspin"));

    timeout(WAIT, connection.wait_for(|c| *c == ConnectionState::Error))
        .await
        .expect("error state never reported")
        .expect("state store closed");

    // A user disconnect during backoff lands back in DISCONNECTED.
    player.disconnect();
    timeout(
        WAIT,
        connection.wait_for(|c| *c == ConnectionState::Disconnected),
    )
    .await
    .expect("never disconnected")
    .expect("state store closed");

    player.release();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hello_rejection_is_fatal() {
    // ---
    // Server that closes the channel instead of acknowledging the hello.
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().expect("local_addr failed");

    let server = tokio::spawn(async move {
        let Ok((stream, _)) = listener.accept().await else {
            return;
        };
        let mut ws = tokio_tungstenite::accept_async(stream)
            .await
            .expect("websocket accept failed");

        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                let frame: Value = serde_json::from_str(&text).expect("invalid JSON");
                if frame["type"] == "hello" {
                    let _ = ws.close(None).await;
                    return;
                }
            }
        }
    });

    let mut player = null_player();
    let state = player.state();

    player.connect(&format!("ws://{addr}/sendspin"));

    // The server task finishes only after receiving the hello and closing.
    timeout(WAIT, server)
        .await
        .expect("server never saw the hello")
        .expect("server task panicked");

    // Past the first backoff interval a reconnecting client would be in
    // CONNECTING or ERROR; a rejected one settles DISCONNECTED for good.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(state.connection(), ConnectionState::Disconnected);

    player.release();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_recent_servers_recorded_by_policy() {
    // ---
    use sendspin_player::{AutoConnectPolicy, ConnectMode, MemoryRecentServers, ServerInfo};

    let (addr, _server) = spawn_server().await;
    let mut player = null_player();

    let recent = Arc::new(MemoryRecentServers::new());
    let recent_store: Arc<dyn RecentServersStore> = Arc::clone(&recent) as _;
    let mut policy = AutoConnectPolicy::new(player.handle(), recent_store);

    let server = ServerInfo {
        name: "integration._sendspin-server._tcp.local.".to_string(),
        address: addr.to_string(),
        path: "/sendspin".to_string(),
    };
    policy.on_discovered(&server);
    assert_eq!(policy.mode(), ConnectMode::Auto);

    let state = player.state();
    let mut connection = state.subscribe_connection();
    timeout(
        WAIT,
        connection.wait_for(|c| *c == ConnectionState::Connected),
    )
    .await
    .expect("auto-connect never connected")
    .expect("state store closed");

    let entries = recent.load();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].server.address, addr.to_string());

    player.release();
}
