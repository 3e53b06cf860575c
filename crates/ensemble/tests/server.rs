//! Integration tests for the Ensemble server, handler, and full connection flow.

use std::sync::Arc;
use std::time::Duration;

use ensemble::prelude::*;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;

const SECRET: &str = "integration-secret-integration-secret";
const PROJECT: ProjectId = ProjectId(3);
const HOST: UserId = UserId(1);
const GUEST: UserId = UserId(2);

// =========================================================================
// Helpers
// =========================================================================

type ClientWs = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

struct TestServer {
    addr: String,
    coordinator: Arc<Coordinator>,
    session: SessionId,
}

/// Starts a server on a random port with a live, open session.
async fn start_server(idle_timeout: Duration) -> TestServer {
    let directory = StaticDirectory::new()
        .with_member(PROJECT, HOST)
        .with_member(PROJECT, GUEST)
        .with_name(HOST, "Ana")
        .with_name(GUEST, "Mia");
    let server = EnsembleServer::builder(EnsembleConfig::with_secret(SECRET))
        .bind("127.0.0.1:0")
        .directory(directory)
        .idle_timeout(idle_timeout)
        .build()
        .await
        .expect("server should build");

    let addr = server
        .local_addr()
        .expect("should have local addr")
        .to_string();
    let coordinator = Arc::clone(server.coordinator());
    let session = coordinator
        .create_session(
            CreateSessionRequest::new(PROJECT, "Mixdown").with_approval(false),
            HOST,
        )
        .await
        .expect("session should be created")
        .id;
    coordinator
        .start_session(&session, HOST)
        .await
        .expect("session should start");

    tokio::spawn(async move {
        let _ = server.run().await;
    });

    // Give the accept loop a moment to start.
    tokio::time::sleep(Duration::from_millis(10)).await;
    TestServer {
        addr,
        coordinator,
        session,
    }
}

async fn connect(addr: &str, headers: &[(&'static str, String)]) -> ClientWs {
    let mut request = format!("ws://{addr}")
        .into_client_request()
        .expect("valid request");
    for (name, value) in headers {
        request
            .headers_mut()
            .insert(*name, HeaderValue::from_str(value).expect("valid header"));
    }
    let (ws, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("should connect");
    ws
}

/// Connects as `user` to the test session and consumes the ConnectAck.
async fn connect_as(server: &TestServer, user: UserId) -> ClientWs {
    connect_to(&server.addr, user, &server.session).await
}

async fn connect_to(addr: &str, user: UserId, session: &SessionId) -> ClientWs {
    let mut ws = connect(
        addr,
        &[
            (USER_ID_HEADER, user.0.to_string()),
            (SESSION_ID_HEADER, session.as_str().to_string()),
        ],
    )
    .await;
    let ack = recv(&mut ws).await.expect("connect ack");
    assert!(matches!(
        ack.payload,
        ServerEvent::ConnectAck { anonymous: false, subscribed: true, .. }
    ));
    ws
}

async fn send(ws: &mut ClientWs, frame: serde_json::Value) {
    ws.send(Message::Text(frame.to_string().into()))
        .await
        .expect("send frame");
}

/// Next envelope, or `None` once the server closed the socket.
async fn recv(ws: &mut ClientWs) -> Option<Envelope> {
    loop {
        let next = tokio::time::timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("timed out waiting for a frame");
        match next {
            Some(Ok(Message::Text(text))) => {
                return Some(serde_json::from_str(text.as_str()).expect("decode"));
            }
            Some(Ok(Message::Binary(data))) => {
                return Some(serde_json::from_slice(&data).expect("decode"));
            }
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
            Some(Ok(_)) => continue,
        }
    }
}

/// Skips events until one matches.
async fn expect_event(ws: &mut ClientWs, matches: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
    loop {
        let envelope = recv(ws).await.expect("connection closed early");
        if matches(&envelope.payload) {
            return envelope.payload;
        }
    }
}

/// Skips events until the server closes the socket.
async fn expect_closed(ws: &mut ClientWs) {
    while recv(ws).await.is_some() {}
}

/// Asserts nothing arrives for a short while.
async fn expect_quiet(ws: &mut ClientWs) {
    let next = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(next.is_err(), "unexpected frame: {next:?}");
}

/// Skips events until the session reaches `expected`.
async fn expect_state(ws: &mut ClientWs, expected: &str) {
    expect_event(ws, |e| {
        matches!(e, ServerEvent::SessionStateChanged { state, .. } if state == expected)
    })
    .await;
}

async fn expect_error(ws: &mut ClientWs) -> ErrorKind {
    match expect_event(ws, |e| matches!(e, ServerEvent::Error { .. })).await {
        ServerEvent::Error { kind, .. } => kind,
        other => panic!("expected Error, got {other:?}"),
    }
}

async fn join(ws: &mut ClientWs) -> ServerEvent {
    send(ws, json!({ "type": "Join" })).await;
    expect_event(ws, |e| {
        matches!(e, ServerEvent::Joined { .. } | ServerEvent::Error { .. })
    })
    .await
}

// =========================================================================
// Tests
// =========================================================================

#[tokio::test]
async fn test_connect_with_identity_headers_acks_identity() {
    let server = start_server(Duration::from_secs(30)).await;
    let mut ws = connect(
        &server.addr,
        &[
            (USER_ID_HEADER, "1".to_string()),
            (SESSION_ID_HEADER, server.session.as_str().to_string()),
        ],
    )
    .await;

    match recv(&mut ws).await.expect("ack").payload {
        ServerEvent::ConnectAck {
            user_id,
            session_id,
            anonymous,
            subscribed,
        } => {
            assert_eq!(user_id, Some(HOST));
            assert_eq!(session_id, Some(server.session.clone()));
            assert!(!anonymous);
            assert!(subscribed);
        }
        other => panic!("expected ConnectAck, got {other:?}"),
    }
}

#[tokio::test]
async fn test_connect_without_headers_is_anonymous() {
    let server = start_server(Duration::from_secs(30)).await;
    let mut ws = connect(&server.addr, &[]).await;

    match recv(&mut ws).await.expect("ack").payload {
        ServerEvent::ConnectAck {
            user_id, anonymous, ..
        } => {
            assert_eq!(user_id, None);
            assert!(anonymous);
        }
        other => panic!("expected ConnectAck, got {other:?}"),
    }

    send(&mut ws, json!({ "type": "Join" })).await;
    match recv(&mut ws).await.expect("error").payload {
        ServerEvent::Error { code, kind, .. } => {
            assert_eq!(code, 401);
            assert_eq!(kind, ErrorKind::Unauthenticated);
        }
        other => panic!("expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_join_replies_with_host_credential() {
    let server = start_server(Duration::from_secs(30)).await;
    let mut ws = connect_as(&server, HOST).await;

    match join(&mut ws).await {
        ServerEvent::Joined {
            user_id,
            role,
            credential,
            ..
        } => {
            assert_eq!(user_id, HOST);
            assert_eq!(role, Role::Host);
            assert!(!credential.token.is_empty());
            assert!(credential.expires_at > credential.issued_at);
        }
        other => panic!("expected Joined, got {other:?}"),
    }

    let online = server
        .coordinator
        .get_online_participants(&server.session)
        .await
        .unwrap();
    assert_eq!(online.len(), 1);
    assert_eq!(online[0].user_id, HOST);
}

#[tokio::test]
async fn test_heartbeat_response() {
    let server = start_server(Duration::from_secs(30)).await;
    let mut ws = connect_as(&server, HOST).await;

    send(&mut ws, json!({ "type": "Heartbeat", "client_time": 12345 })).await;
    match expect_event(&mut ws, |e| matches!(e, ServerEvent::HeartbeatAck { .. })).await {
        ServerEvent::HeartbeatAck {
            client_time,
            server_time,
        } => {
            assert_eq!(client_time, 12345);
            assert!(server_time > 0);
        }
        other => panic!("expected HeartbeatAck, got {other:?}"),
    }
}

#[tokio::test]
async fn test_chat_fans_out_with_stamped_sender() {
    let server = start_server(Duration::from_secs(30)).await;
    let mut host = connect_as(&server, HOST).await;
    let mut guest = connect_as(&server, GUEST).await;
    join(&mut host).await;
    join(&mut guest).await;

    send(
        &mut guest,
        json!({ "type": "Chat", "content": "  take two?  ", "sender_id": 1, "sender_name": "Ana" }),
    )
    .await;

    for ws in [&mut host, &mut guest] {
        match expect_event(ws, |e| matches!(e, ServerEvent::Chat(_))).await {
            ServerEvent::Chat(chat) => {
                assert_eq!(chat.sender_id, Some(GUEST));
                assert_eq!(chat.sender_name, "Mia");
                assert_eq!(chat.content, "take two?");
            }
            other => panic!("expected Chat, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_anonymous_chat_is_tagged_anonymous() {
    let server = start_server(Duration::from_secs(30)).await;
    let mut host = connect_as(&server, HOST).await;
    let mut anon = connect(
        &server.addr,
        &[(SESSION_ID_HEADER, server.session.as_str().to_string())],
    )
    .await;
    recv(&mut anon).await.expect("ack");

    send(&mut anon, json!({ "type": "Chat", "content": "hello from the booth" })).await;

    match expect_event(&mut host, |e| matches!(e, ServerEvent::Chat(_))).await {
        ServerEvent::Chat(chat) => {
            assert_eq!(chat.sender_id, None);
            assert_eq!(chat.sender_name, "Anonymous");
        }
        other => panic!("expected Chat, got {other:?}"),
    }
}

#[tokio::test]
async fn test_client_disconnect_takes_participant_offline() {
    let server = start_server(Duration::from_secs(30)).await;
    let mut host = connect_as(&server, HOST).await;
    let mut guest = connect_as(&server, GUEST).await;
    join(&mut host).await;
    join(&mut guest).await;

    guest.close(None).await.expect("close");
    drop(guest);

    match expect_event(&mut host, |e| {
        matches!(e, ServerEvent::Presence { online: false, .. })
    })
    .await
    {
        ServerEvent::Presence { user_id, .. } => assert_eq!(user_id, GUEST),
        other => panic!("expected Presence, got {other:?}"),
    }

    let online = server
        .coordinator
        .get_online_participants(&server.session)
        .await
        .unwrap();
    assert_eq!(online.iter().map(|p| p.user_id).collect::<Vec<_>>(), vec![HOST]);
}

#[tokio::test]
async fn test_disconnect_frame_is_acknowledged_then_closed() {
    let server = start_server(Duration::from_secs(30)).await;
    let mut ws = connect_as(&server, HOST).await;
    join(&mut ws).await;

    send(&mut ws, json!({ "type": "Disconnect", "reason": "done for today" })).await;

    match expect_event(&mut ws, |e| matches!(e, ServerEvent::DisconnectAck { .. })).await {
        ServerEvent::DisconnectAck { reason } => assert_eq!(reason, "done for today"),
        other => panic!("expected DisconnectAck, got {other:?}"),
    }
    expect_closed(&mut ws).await;
}

#[tokio::test]
async fn test_malformed_frame_gets_error_and_connection_survives() {
    let server = start_server(Duration::from_secs(30)).await;
    let mut ws = connect_as(&server, HOST).await;

    ws.send(Message::Text("{not json".to_string().into())).await.expect("send");
    match recv(&mut ws).await.expect("error").payload {
        ServerEvent::Error { kind, .. } => assert_eq!(kind, ErrorKind::InvalidRequest),
        other => panic!("expected Error, got {other:?}"),
    }

    assert!(matches!(join(&mut ws).await, ServerEvent::Joined { .. }));
}

#[tokio::test]
async fn test_end_session_closes_every_connection() {
    let server = start_server(Duration::from_secs(30)).await;
    let mut host = connect_as(&server, HOST).await;
    let mut guest = connect_as(&server, GUEST).await;
    join(&mut host).await;
    join(&mut guest).await;

    let summary = server
        .coordinator
        .end_session(&server.session, HOST)
        .await
        .unwrap();
    assert_eq!(summary.total_participants, 2);

    for ws in [&mut host, &mut guest] {
        match expect_event(ws, |e| matches!(e, ServerEvent::SessionStateChanged { .. })).await {
            ServerEvent::SessionStateChanged { state, changed_by } => {
                assert_eq!(state, "ENDED");
                assert_eq!(changed_by, HOST);
            }
            other => panic!("expected SessionStateChanged, got {other:?}"),
        }
        expect_closed(ws).await;
    }
}

#[tokio::test]
async fn test_removed_participant_is_disconnected() {
    let server = start_server(Duration::from_secs(30)).await;
    let mut host = connect_as(&server, HOST).await;
    let mut guest = connect_as(&server, GUEST).await;
    join(&mut host).await;
    join(&mut guest).await;

    server
        .coordinator
        .remove_participant(&server.session, GUEST, HOST)
        .await
        .unwrap();

    match expect_event(&mut host, |e| matches!(e, ServerEvent::ParticipantRemoved { .. })).await {
        ServerEvent::ParticipantRemoved {
            user_id,
            removed_by,
        } => {
            assert_eq!(user_id, GUEST);
            assert_eq!(removed_by, HOST);
        }
        other => panic!("expected ParticipantRemoved, got {other:?}"),
    }
    expect_closed(&mut guest).await;

    let participants = server
        .coordinator
        .get_participants(&server.session)
        .await
        .unwrap();
    assert!(participants.iter().all(|p| p.user_id != GUEST));
}

#[tokio::test]
async fn test_idle_connection_is_closed() {
    let server = start_server(Duration::from_millis(150)).await;
    let mut ws = connect_as(&server, HOST).await;
    join(&mut ws).await;

    expect_closed(&mut ws).await;

    let online = server
        .coordinator
        .get_online_participants(&server.session)
        .await
        .unwrap();
    assert!(online.is_empty());
}

#[tokio::test]
async fn test_kicked_user_reconnect_is_not_subscribed() {
    let server = start_server(Duration::from_secs(30)).await;
    let mut host = connect_as(&server, HOST).await;
    let mut guest = connect_as(&server, GUEST).await;
    join(&mut host).await;
    join(&mut guest).await;

    send(&mut host, json!({ "type": "Kick", "user_id": GUEST.0 })).await;
    expect_event(&mut host, |e| matches!(e, ServerEvent::ParticipantRemoved { .. })).await;
    expect_closed(&mut guest).await;

    let mut again = connect(
        &server.addr,
        &[
            (USER_ID_HEADER, GUEST.0.to_string()),
            (SESSION_ID_HEADER, server.session.as_str().to_string()),
        ],
    )
    .await;
    match recv(&mut again).await.expect("ack").payload {
        ServerEvent::ConnectAck {
            anonymous,
            subscribed,
            ..
        } => {
            assert!(!anonymous);
            assert!(!subscribed);
        }
        other => panic!("expected ConnectAck, got {other:?}"),
    }

    send(&mut again, json!({ "type": "Chat", "content": "still here" })).await;
    expect_error(&mut again).await;
    send(&mut again, json!({ "type": "Playback", "action": "stop" })).await;
    expect_error(&mut again).await;
    send(&mut again, json!({ "type": "Join" })).await;
    assert_eq!(expect_error(&mut again).await, ErrorKind::PermissionDenied);

    send(&mut host, json!({ "type": "Chat", "content": "private" })).await;
    match expect_event(&mut host, |e| {
        matches!(e, ServerEvent::Chat(_) | ServerEvent::Playback(_))
    })
    .await
    {
        ServerEvent::Chat(chat) => assert_eq!(chat.content, "private"),
        other => panic!("expected the host's own chat, got {other:?}"),
    }
    expect_quiet(&mut again).await;
}

#[tokio::test]
async fn test_host_creates_and_steers_session_over_socket() {
    let server = start_server(Duration::from_secs(30)).await;
    let mut lobby = connect(&server.addr, &[(USER_ID_HEADER, HOST.0.to_string())]).await;
    recv(&mut lobby).await.expect("ack");

    send(
        &mut lobby,
        json!({ "type": "CreateSession", "project_id": PROJECT.0, "title": "Overdubs", "requires_approval": true }),
    )
    .await;
    let session = match expect_event(&mut lobby, |e| matches!(e, ServerEvent::SessionCreated { .. })).await {
        ServerEvent::SessionCreated {
            session_id,
            project_id,
            state,
        } => {
            assert_eq!(project_id, PROJECT);
            assert_eq!(state, "SCHEDULED");
            session_id
        }
        other => panic!("expected SessionCreated, got {other:?}"),
    };

    let mut host = connect_to(&server.addr, HOST, &session).await;
    let mut guest = connect_to(&server.addr, GUEST, &session).await;
    send(&mut host, json!({ "type": "StartSession" })).await;
    expect_state(&mut host, "LIVE").await;
    expect_state(&mut guest, "LIVE").await;
    join(&mut host).await;

    // Approval handshake.
    send(&mut guest, json!({ "type": "Join" })).await;
    assert_eq!(expect_error(&mut guest).await, ErrorKind::ApprovalRequired);
    expect_event(&mut host, |e| matches!(e, ServerEvent::JoinRequested { user_id: GUEST, .. })).await;
    send(
        &mut host,
        json!({ "type": "ResolveJoinRequest", "user_id": GUEST.0, "approve": true }),
    )
    .await;
    expect_event(&mut guest, |e| {
        matches!(e, ServerEvent::JoinResolved { user_id: GUEST, approved: true })
    })
    .await;
    assert!(matches!(join(&mut guest).await, ServerEvent::Joined { user_id: GUEST, .. }));

    // Guests cannot steer.
    send(&mut guest, json!({ "type": "PauseSession" })).await;
    assert_eq!(expect_error(&mut guest).await, ErrorKind::PermissionDenied);

    send(
        &mut host,
        json!({ "type": "UpdatePermissions", "user_id": GUEST.0, "permissions": { "canShareVideo": false } }),
    )
    .await;
    match expect_event(&mut guest, |e| matches!(e, ServerEvent::PermissionsUpdated { .. })).await {
        ServerEvent::PermissionsUpdated {
            user_id,
            permissions,
        } => {
            assert_eq!(user_id, GUEST);
            assert!(!permissions.can_share_video);
        }
        other => panic!("expected PermissionsUpdated, got {other:?}"),
    }

    send(&mut host, json!({ "type": "PauseSession" })).await;
    expect_state(&mut guest, "PAUSED").await;
    send(&mut host, json!({ "type": "ResumeSession" })).await;
    expect_state(&mut guest, "LIVE").await;

    send(&mut host, json!({ "type": "EndSession" })).await;
    for ws in [&mut host, &mut guest] {
        expect_state(ws, "ENDED").await;
        expect_closed(ws).await;
    }
    let ended = server.coordinator.get_session(&session).await.unwrap();
    assert_eq!(ended.state, SessionState::Ended);
}

#[tokio::test]
async fn test_cancel_session_frame_closes_subscribers() {
    let server = start_server(Duration::from_secs(30)).await;
    let mut host = connect_as(&server, HOST).await;
    let mut guest = connect_as(&server, GUEST).await;

    send(&mut host, json!({ "type": "CancelSession", "reason": "studio flooded" })).await;

    for ws in [&mut host, &mut guest] {
        expect_state(ws, "CANCELLED").await;
        expect_closed(ws).await;
    }
    let cancelled = server.coordinator.get_session(&server.session).await.unwrap();
    assert_eq!(cancelled.cancel_reason.as_deref(), Some("studio flooded"));
}
