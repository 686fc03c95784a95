//! End-to-end flows against an in-process server.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use realtime_client::{
    AccessTokenProvider, ChannelOptions, ChannelStatus, ClientConfig, ConnectionStatus,
    JsonObject, Message, PostgresAction, PostgresEvent, PostgresFilter, PushStatus,
    RealtimeChannel, RealtimeClient, RealtimeError, RetryConfig, StaticTokenProvider,
};
use realtime_protocol::codec::{decode_broadcast_push, encode_broadcast};
use realtime_protocol::{decode_text, events, BroadcastFrame, BroadcastPayload};
use realtime_transport::{memory_transport, MemoryListener, ServerEnd, WireFrame};

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_config() -> ClientConfig {
    ClientConfig {
        api_key: "anon".into(),
        reconnect_delay_ms: 50,
        timeout_ms: 1_000,
        max_retry_attempts: 2,
        retry: RetryConfig {
            base_delay_ms: 10,
            max_delay_ms: 50,
            multiplier: 2.0,
        },
        ..ClientConfig::default()
    }
}

fn setup(config: ClientConfig) -> (RealtimeClient, MemoryListener) {
    init_tracing();
    let (factory, listener) = memory_transport();
    let client = RealtimeClient::builder("ws://localhost:4000/socket", config)
        .transport(Arc::new(factory))
        .without_fallback()
        .build()
        .unwrap();
    (client, listener)
}

fn setup_with_tokens(
    config: ClientConfig,
    provider: Arc<dyn AccessTokenProvider>,
) -> (RealtimeClient, MemoryListener) {
    init_tracing();
    let (factory, listener) = memory_transport();
    let client = RealtimeClient::builder("ws://localhost:4000/socket", config)
        .transport(Arc::new(factory))
        .token_provider(provider)
        .without_fallback()
        .build()
        .unwrap();
    (client, listener)
}

/// Hands out tokens in order, repeating the last one.
struct ScriptedTokens {
    tokens: Mutex<VecDeque<Option<String>>>,
}

impl ScriptedTokens {
    fn new(tokens: impl IntoIterator<Item = Option<&'static str>>) -> Arc<Self> {
        Arc::new(Self {
            tokens: Mutex::new(tokens.into_iter().map(|t| t.map(String::from)).collect()),
        })
    }
}

#[async_trait]
impl AccessTokenProvider for ScriptedTokens {
    async fn access_token(&self) -> Option<String> {
        let mut tokens = self.tokens.lock();
        if tokens.len() > 1 {
            tokens.pop_front().flatten()
        } else {
            tokens.front().cloned().flatten()
        }
    }
}

fn expired_jwt() -> String {
    format!(
        "{}.{}.sig",
        URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
        URL_SAFE_NO_PAD.encode(r#"{"sub":"user-1","exp":1000}"#)
    )
}

fn object(value: Value) -> JsonObject {
    value.as_object().cloned().unwrap_or_default()
}

async fn accept(listener: &mut MemoryListener) -> ServerEnd {
    tokio::time::timeout(WAIT, listener.accept())
        .await
        .expect("no connection")
        .expect("factory dropped")
}

/// Next client frame that is not a heartbeat.
async fn next_frame(server: &mut ServerEnd) -> WireFrame {
    loop {
        let frame = tokio::time::timeout(WAIT, server.recv())
            .await
            .expect("no frame")
            .expect("client closed");
        if let WireFrame::Text(text) = &frame {
            if decode_text(text).unwrap().event == events::HEARTBEAT {
                continue;
            }
        }
        return frame;
    }
}

async fn next_message(server: &mut ServerEnd) -> Message {
    match next_frame(server).await {
        WireFrame::Text(text) => decode_text(&text).unwrap(),
        WireFrame::Binary(data) => panic!("unexpected binary frame of {} bytes", data.len()),
    }
}

fn reply(server: &ServerEnd, request: &Message, status: &str, response: Value) {
    let frame = json!([
        request.join_ref,
        request.msg_ref,
        request.topic,
        events::REPLY,
        {"status": status, "response": response}
    ]);
    assert!(server.send_text(frame.to_string()));
}

fn push(server: &ServerEnd, topic: &str, event: &str, payload: Value) {
    let frame = json!([null, null, topic, event, payload]);
    assert!(server.send_text(frame.to_string()));
}

/// Subscribe `channel`, answering its join with `response`.
async fn join(channel: &RealtimeChannel, server: &mut ServerEnd, response: Value) -> Message {
    let subscribing = tokio::spawn({
        let channel = channel.clone();
        async move { channel.subscribe().await }
    });
    let join = next_message(server).await;
    assert_eq!(join.event, events::JOIN);
    assert_eq!(join.join_ref, join.msg_ref);
    reply(server, &join, "ok", response);

    tokio::time::timeout(WAIT, subscribing)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(channel.status(), ChannelStatus::Subscribed);
    join
}

async fn wait_status(channel: &RealtimeChannel, target: ChannelStatus) {
    let mut status = channel.subscribe_status();
    tokio::time::timeout(WAIT, status.wait_for(|s| *s == target))
        .await
        .expect("status not reached")
        .unwrap();
}

#[tokio::test]
async fn test_postgres_changes_dispatch_by_confirmed_id() {
    let (client, mut listener) = setup(fast_config());
    let channel = client.channel("public:messages", ChannelOptions::default());

    let (tx, mut inserts) = mpsc::unbounded_channel();
    channel
        .on_postgres_changes(
            PostgresFilter::new(PostgresEvent::Insert, "public").table("messages"),
            move |action| {
                let _ = tx.send(action.clone());
            },
        )
        .unwrap();
    let (tx, mut updates) = mpsc::unbounded_channel();
    channel
        .on_postgres_changes(
            PostgresFilter::new(PostgresEvent::Update, "public").table("messages"),
            move |action| {
                let _ = tx.send(action.clone());
            },
        )
        .unwrap();

    let subscribing = tokio::spawn({
        let channel = channel.clone();
        async move { channel.subscribe().await }
    });
    let mut server = accept(&mut listener).await;
    let join_message = next_message(&mut server).await;
    assert_eq!(join_message.topic, "realtime:public:messages");
    assert_eq!(
        join_message.payload["config"]["postgres_changes"],
        json!([
            {"event": "INSERT", "schema": "public", "table": "messages"},
            {"event": "UPDATE", "schema": "public", "table": "messages"}
        ])
    );
    assert!(join_message.payload["version"]
        .as_str()
        .unwrap()
        .starts_with("realtime-rs/"));

    reply(
        &server,
        &join_message,
        "ok",
        json!({"postgres_changes": [
            {"id": 1, "event": "INSERT", "schema": "public", "table": "messages"},
            {"id": 2, "event": "UPDATE", "schema": "public", "table": "messages"}
        ]}),
    );
    subscribing.await.unwrap().unwrap();

    push(
        &server,
        channel.topic(),
        events::POSTGRES_CHANGES,
        json!({"ids": [1], "data": {
            "type": "INSERT",
            "schema": "public",
            "table": "messages",
            "commit_timestamp": "2024-01-01T00:00:00Z",
            "columns": [{"name": "id", "type": "int8"}],
            "record": {"id": 7}
        }}),
    );

    let action = tokio::time::timeout(WAIT, inserts.recv()).await.unwrap().unwrap();
    match action {
        PostgresAction::Insert { record, meta } => {
            assert_eq!(record["id"], 7);
            assert_eq!(meta.table, "messages");
        }
        other => panic!("expected an insert, got {:?}", other),
    }
    assert!(updates.try_recv().is_err());

    // A filter can no longer be added once joined.
    assert!(matches!(
        channel.on_postgres_changes(PostgresFilter::new(PostgresEvent::Delete, "public"), |_| {}),
        Err(RealtimeError::ContractViolation(_))
    ));
}

#[tokio::test]
async fn test_broadcast_both_directions() {
    let (client, mut listener) = setup(fast_config());
    let channel = client.channel("room", ChannelOptions::default().with_self_broadcast(true));

    let (tx, mut json_rx) = mpsc::unbounded_channel();
    channel.on_broadcast("cursor", move |body| {
        let _ = tx.send(body.clone());
    });
    let (tx, mut data_rx) = mpsc::unbounded_channel();
    channel.on_broadcast_data("*", move |event, data| {
        let _ = tx.send((event.to_string(), data.clone()));
    });

    client.connect().await.unwrap();
    let mut server = accept(&mut listener).await;
    let join_message = join(&channel, &mut server, json!({})).await;
    assert_eq!(join_message.payload["config"]["broadcast"]["self"], true);

    // Client to server, JSON.
    let status = channel
        .send_broadcast("cursor", object(json!({"x": 1})))
        .await
        .unwrap();
    assert_eq!(status, PushStatus::Ok);
    let sent = next_message(&mut server).await;
    assert_eq!(sent.event, events::BROADCAST);
    assert_eq!(sent.join_ref, join_message.join_ref);
    assert_eq!(
        Value::Object(sent.payload.clone()),
        json!({"type": "broadcast", "event": "cursor", "payload": {"x": 1}})
    );

    // Client to server, binary.
    let status = channel
        .send_broadcast_data("blob", Bytes::from_static(b"\x01\x02"))
        .await
        .unwrap();
    assert_eq!(status, PushStatus::Ok);
    let WireFrame::Binary(data) = next_frame(&mut server).await else {
        panic!("expected a binary frame");
    };
    let pushed = decode_broadcast_push(&data).unwrap();
    assert_eq!(pushed.topic, "realtime:room");
    assert_eq!(pushed.event, "blob");
    assert_eq!(pushed.payload, BroadcastPayload::Binary(Bytes::from_static(b"\x01\x02")));

    // Server to client, JSON.
    push(
        &server,
        channel.topic(),
        events::BROADCAST,
        json!({"type": "broadcast", "event": "cursor", "payload": {"x": 2}}),
    );
    let body = tokio::time::timeout(WAIT, json_rx.recv()).await.unwrap().unwrap();
    assert_eq!(body["payload"]["x"], 2);

    // Server to client, binary.
    let frame = BroadcastFrame {
        topic: channel.topic().to_string(),
        event: "blob".into(),
        metadata: Bytes::new(),
        payload: BroadcastPayload::Binary(Bytes::from_static(b"\xff")),
    };
    assert!(server.send_binary(encode_broadcast(&frame).unwrap()));
    let (event, data) = tokio::time::timeout(WAIT, data_rx.recv()).await.unwrap().unwrap();
    assert_eq!(event, "blob");
    assert_eq!(data, Bytes::from_static(b"\xff"));
}

#[tokio::test]
async fn test_acknowledged_broadcast() {
    let (client, mut listener) = setup(fast_config());
    let channel = client.channel("acks", ChannelOptions::default().with_ack(true));

    client.connect().await.unwrap();
    let mut server = accept(&mut listener).await;
    join(&channel, &mut server, json!({})).await;

    let sending = tokio::spawn({
        let channel = channel.clone();
        async move { channel.send_broadcast("ping", JsonObject::new()).await }
    });
    let sent = next_message(&mut server).await;
    assert!(sent.msg_ref.is_some());
    reply(&server, &sent, "ok", json!({}));
    assert_eq!(sending.await.unwrap().unwrap(), PushStatus::Ok);

    // Unanswered: times out.
    let sending = tokio::spawn({
        let channel = channel.clone();
        async move { channel.send_broadcast("ping", JsonObject::new()).await }
    });
    next_message(&mut server).await;
    assert_eq!(sending.await.unwrap().unwrap(), PushStatus::Timeout);
}

#[tokio::test]
async fn test_presence_sync_and_track() {
    let (client, mut listener) = setup(fast_config());
    let channel = client.channel("lobby", ChannelOptions::default().with_presence_key("alice"));

    let (tx, mut changes) = mpsc::unbounded_channel();
    channel.on_presence(move |change| {
        let joins: Vec<String> = change.joins.keys().cloned().collect();
        let leaves: Vec<String> = change.leaves.keys().cloned().collect();
        let _ = tx.send((joins, leaves));
    });

    client.connect().await.unwrap();
    let mut server = accept(&mut listener).await;
    let join_message = join(&channel, &mut server, json!({})).await;
    assert_eq!(
        join_message.payload["config"]["presence"],
        json!({"key": "alice", "enabled": true})
    );

    push(
        &server,
        channel.topic(),
        events::PRESENCE_STATE,
        json!({"alice": {"metas": [{"phx_ref": "a1", "status": "online"}]}}),
    );
    let change = tokio::time::timeout(WAIT, changes.recv()).await.unwrap().unwrap();
    assert_eq!(change, (vec!["alice".to_string()], vec![]));

    push(
        &server,
        channel.topic(),
        events::PRESENCE_DIFF,
        json!({
            "joins": {"bob": {"metas": [{"phx_ref": "b1"}]}},
            "leaves": {"alice": {"metas": [{"phx_ref": "a1"}]}}
        }),
    );
    let change = tokio::time::timeout(WAIT, changes.recv()).await.unwrap().unwrap();
    assert_eq!(change, (vec!["bob".to_string()], vec!["alice".to_string()]));

    let state = channel.presence_state();
    assert_eq!(state.keys().collect::<Vec<_>>(), vec!["bob"]);

    let tracking = tokio::spawn({
        let channel = channel.clone();
        async move { channel.track(object(json!({"status": "away"}))).await }
    });
    let track = next_message(&mut server).await;
    assert_eq!(track.event, events::PRESENCE);
    assert_eq!(
        Value::Object(track.payload.clone()),
        json!({"type": "presence", "event": "track", "payload": {"status": "away"}})
    );
    reply(&server, &track, "ok", json!({}));
    assert_eq!(tracking.await.unwrap().unwrap(), PushStatus::Ok);
}

#[tokio::test]
async fn test_rejoin_after_connection_loss() {
    let (client, mut listener) = setup(fast_config());
    let channel = client.channel("room", ChannelOptions::default());

    client.connect().await.unwrap();
    let mut first = accept(&mut listener).await;
    let first_join = join(&channel, &mut first, json!({})).await;

    assert!(first.fail("connection reset"));
    let mut second = accept(&mut listener).await;

    let rejoin = next_message(&mut second).await;
    assert_eq!(rejoin.event, events::JOIN);
    assert_ne!(rejoin.join_ref, first_join.join_ref);
    reply(&second, &rejoin, "ok", json!({}));

    wait_status(&channel, ChannelStatus::Subscribed).await;
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_join_rejections_exhaust_retries() {
    let (client, mut listener) = setup(fast_config());
    let channel = client.channel("private-room", ChannelOptions::default().private());

    let subscribing = tokio::spawn({
        let channel = channel.clone();
        async move { channel.subscribe().await }
    });
    let mut server = accept(&mut listener).await;

    for _ in 0..2 {
        let join_message = next_message(&mut server).await;
        assert_eq!(join_message.event, events::JOIN);
        assert_eq!(join_message.payload["config"]["private"], true);
        reply(&server, &join_message, "error", json!({"reason": "unauthorized"}));
    }

    let result = tokio::time::timeout(WAIT, subscribing).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Err(RealtimeError::MaxRetryAttemptsReached { attempts: 2 })
    ));
    assert_eq!(channel.status(), ChannelStatus::Unsubscribed);
}

#[tokio::test]
async fn test_unsubscribe_sends_leave() {
    let (client, mut listener) = setup(fast_config());
    let channel = client.channel("room", ChannelOptions::default());

    client.connect().await.unwrap();
    let mut server = accept(&mut listener).await;
    let join_message = join(&channel, &mut server, json!({})).await;

    let leaving = tokio::spawn({
        let channel = channel.clone();
        async move { channel.unsubscribe().await }
    });
    let leave = next_message(&mut server).await;
    assert_eq!(leave.event, events::LEAVE);
    assert_eq!(leave.join_ref, join_message.join_ref);
    reply(&server, &leave, "ok", json!({}));

    assert_eq!(leaving.await.unwrap().unwrap(), PushStatus::Ok);
    assert_eq!(channel.status(), ChannelStatus::Unsubscribed);
    assert_eq!(channel.join_ref(), None);
}

#[tokio::test]
async fn test_disconnect_cancels_subscribe() {
    let (client, _listener) = setup(ClientConfig {
        connect_on_subscribe: false,
        ..fast_config()
    });
    let channel = client.channel("room", ChannelOptions::default());

    let subscribing = tokio::spawn({
        let channel = channel.clone();
        async move { channel.subscribe().await }
    });
    wait_status(&channel, ChannelStatus::Subscribing).await;
    // The join sits in the send buffer.
    assert!(client.buffered() >= 1);

    client.disconnect().await;
    let result = tokio::time::timeout(WAIT, subscribing).await.unwrap().unwrap();
    assert!(matches!(result, Err(RealtimeError::Cancelled)));
    assert_eq!(channel.status(), ChannelStatus::Unsubscribed);
}

#[tokio::test]
async fn test_join_carries_provider_token() {
    let provider = Arc::new(StaticTokenProvider::new(Some("user-token".into())));
    let (client, mut listener) = setup_with_tokens(fast_config(), provider);
    let channel = client.channel("room", ChannelOptions::default());

    client.connect().await.unwrap();
    let mut server = accept(&mut listener).await;
    let join_message = join(&channel, &mut server, json!({})).await;

    assert_eq!(join_message.payload["access_token"], "user-token");
    assert_eq!(client.access_token().as_deref(), Some("user-token"));
}

#[tokio::test]
async fn test_expired_provider_token_is_not_sent() {
    let provider = Arc::new(StaticTokenProvider::new(Some(expired_jwt())));
    let (client, mut listener) = setup_with_tokens(fast_config(), provider);
    let channel = client.channel("room", ChannelOptions::default());

    client.connect().await.unwrap();
    let mut server = accept(&mut listener).await;
    let join_message = join(&channel, &mut server, json!({})).await;

    assert!(join_message.payload.get("access_token").is_none());
    assert_eq!(client.access_token(), None);
}

#[tokio::test]
async fn test_session_loss_joins_without_token() {
    let provider = ScriptedTokens::new([Some("user-token"), None]);
    let (client, mut listener) = setup_with_tokens(fast_config(), provider);

    client.connect().await.unwrap();
    let mut server = accept(&mut listener).await;

    let first = client.channel("first", ChannelOptions::default());
    let first_join = join(&first, &mut server, json!({})).await;
    assert_eq!(first_join.payload["access_token"], "user-token");

    let second = client.channel("second", ChannelOptions::default());
    let second_join = join(&second, &mut server, json!({})).await;
    assert!(second_join.payload.get("access_token").is_none());
    assert_eq!(client.access_token(), None);
    assert!(client.is_connected());
}

#[tokio::test]
async fn test_session_loss_disconnects_when_configured() {
    let provider = ScriptedTokens::new([Some("user-token"), None]);
    let (client, mut listener) = setup_with_tokens(
        ClientConfig {
            disconnect_on_session_loss: true,
            ..fast_config()
        },
        provider,
    );

    client.connect().await.unwrap();
    let mut server = accept(&mut listener).await;
    let first = client.channel("first", ChannelOptions::default());
    join(&first, &mut server, json!({})).await;

    let second = client.channel("second", ChannelOptions::default());
    let result = tokio::time::timeout(WAIT, second.subscribe()).await.unwrap();

    assert!(matches!(result, Err(RealtimeError::Cancelled)));
    assert_eq!(second.status(), ChannelStatus::Unsubscribed);
    assert_eq!(client.status(), ConnectionStatus::Disconnected);
    assert_eq!(client.access_token(), None);
}
