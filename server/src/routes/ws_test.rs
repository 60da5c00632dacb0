use super::*;
use std::time::Duration as StdDuration;
use tokio::time::{Duration, sleep, timeout};

use crate::services::token::TokenClaims;
use crate::state::test_helpers::{open_room_record, test_app_state};

const SECRET: &str = "test-secret";
const BLUE: &str = "#3B82F6";

struct Harness {
    session: Session,
    out_rx: mpsc::Receiver<ServerMessage>,
    ctrl_tx: mpsc::UnboundedSender<ConnCtrl>,
    ctrl_rx: mpsc::UnboundedReceiver<ConnCtrl>,
}

fn harness() -> Harness {
    let (out_tx, out_rx) = mpsc::channel(OUTBOUND_QUEUE);
    let (ctrl_tx, ctrl_rx) = mpsc::unbounded_channel();
    Harness {
        session: Session {
            conn: ConnHandle { id: Uuid::new_v4(), tx: out_tx },
            identity: None,
            attachment: None,
            limiter: CommandLimiter::new(),
        },
        out_rx,
        ctrl_tx,
        ctrl_rx,
    }
}

impl Harness {
    async fn send(&mut self, state: &AppState, text: &str) -> Vec<ServerMessage> {
        process_message(state, &mut self.session, &self.ctrl_tx, text).await
    }

    async fn recv(&mut self) -> ServerMessage {
        timeout(Duration::from_millis(500), self.out_rx.recv())
            .await
            .expect("frame receive timed out")
            .expect("outbound channel closed")
    }

    async fn assert_silent(&mut self) {
        assert!(
            timeout(Duration::from_millis(80), self.out_rx.recv()).await.is_err(),
            "expected no broadcast frame"
        );
    }
}

fn valid_token(pid: Uuid, name: &str) -> String {
    token::mint(SECRET, pid, name, BLUE, StdDuration::from_secs(600))
}

fn auth_json(token: &str) -> String {
    format!(r#"{{"type":"auth","token":"{token}"}}"#)
}

async fn authed_joined(state: &AppState, slug: &str, pid: Uuid, name: &str) -> Harness {
    let mut h = harness();
    let frames = h.send(state, &auth_json(&valid_token(pid, name))).await;
    assert!(matches!(frames.as_slice(), [ServerMessage::AuthOk { .. }]));
    let frames = h.send(state, &format!(r#"{{"type":"join","roomId":"{slug}"}}"#)).await;
    assert!(frames.is_empty(), "join replies arrive via the room engine");
    assert!(matches!(h.recv().await, ServerMessage::RoomState { .. }));
    h
}

// =============================================================================
// HANDSHAKE (scenario 1, R4)
// =============================================================================

#[tokio::test]
async fn auth_then_join_lobby_delivers_snapshot_with_self() {
    let state = test_app_state();
    state.registry.seed_room(&open_room_record("lobby", 14)).await;
    let pid = Uuid::new_v4();
    let mut h = harness();

    let frames = h.send(&state, &auth_json(&valid_token(pid, "Alice"))).await;
    match frames.as_slice() {
        [ServerMessage::AuthOk { agent_id, name, avatar }] => {
            assert_eq!(*agent_id, pid);
            assert_eq!(name, "Alice");
            assert_eq!(avatar.agent_id, pid);
            assert_eq!(avatar.body_color, BLUE);
        }
        other => panic!("expected auth_ok, got {other:?}"),
    }

    let frames = h.send(&state, r#"{"type":"join","roomId":"lobby"}"#).await;
    assert!(frames.is_empty());
    match h.recv().await {
        ServerMessage::RoomState { room, agents, messages } => {
            assert_eq!(room.slug, "lobby");
            assert!(messages.is_empty());
            assert_eq!(agents.len(), 1);
            assert_eq!(agents[0].id, pid);
            assert_eq!((agents[0].x, agents[0].y), (0, 0));
        }
        other => panic!("expected room_state, got {other:?}"),
    }
}

#[tokio::test]
async fn expired_token_leaves_the_socket_unauthenticated() {
    let state = test_app_state();
    let claims = TokenClaims { sub: Uuid::new_v4(), name: "Alice".into(), color: BLUE.into(), exp: 1_000 };
    let stale = token::sign(SECRET, &claims);
    let mut h = harness();

    let frames = h.send(&state, &auth_json(&stale)).await;
    match frames.as_slice() {
        [ServerMessage::AuthError { error }] => assert_eq!(error, "token expired"),
        other => panic!("expected auth_error, got {other:?}"),
    }
    assert!(h.session.identity.is_none(), "failed handshake must not set an identity");

    // The socket stays open and responsive.
    let frames = h.send(&state, r#"{"type":"ping"}"#).await;
    assert!(matches!(frames.as_slice(), [ServerMessage::Pong]));
}

#[tokio::test]
async fn forged_token_is_rejected() {
    let state = test_app_state();
    let forged = token::mint("wrong-secret", Uuid::new_v4(), "Mallory", BLUE, StdDuration::from_secs(600));
    let mut h = harness();

    let frames = h.send(&state, &auth_json(&forged)).await;
    assert!(matches!(frames.as_slice(), [ServerMessage::AuthError { .. }]));
}

// =============================================================================
// PROTOCOL ERRORS
// =============================================================================

#[tokio::test]
async fn malformed_and_unknown_frames_yield_invalid_message() {
    let state = test_app_state();
    let mut h = harness();

    for bad in ["{nonsense", r#"{"token":"x"}"#, r#"{"type":7}"#, r#"{"type":"fly","x":1}"#] {
        let frames = h.send(&state, bad).await;
        match frames.as_slice() {
            [ServerMessage::Error { code, .. }] => assert_eq!(code, "INVALID_MESSAGE", "frame: {bad}"),
            other => panic!("expected error for {bad}, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn room_commands_before_joining_are_rejected() {
    let state = test_app_state();
    let mut h = harness();

    for cmd in [r#"{"type":"move","x":1,"y":1}"#, r#"{"type":"chat","message":"hi"}"#, r#"{"type":"leave"}"#] {
        let frames = h.send(&state, cmd).await;
        match frames.as_slice() {
            [ServerMessage::Error { code, .. }] => assert_eq!(code, "NOT_IN_ROOM", "frame: {cmd}"),
            other => panic!("expected error for {cmd}, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn registry_errors_map_to_wire_codes() {
    match registry_error_frame(&RegistryError::NotFound("atrium".into())) {
        ServerMessage::Error { code, message } => {
            assert_eq!(code, "ROOM_NOT_FOUND");
            assert!(message.contains("atrium"));
        }
        other => panic!("expected error, got {other:?}"),
    }
    match registry_error_frame(&RegistryError::EngineGone(Uuid::new_v4())) {
        ServerMessage::Error { code, .. } => assert_eq!(code, "INTERNAL_ERROR"),
        other => panic!("expected error, got {other:?}"),
    }
}

// =============================================================================
// SPECTATORS (scenario 5)
// =============================================================================

#[tokio::test]
async fn unauthenticated_join_attaches_as_spectator() {
    let state = test_app_state();
    state.registry.seed_room(&open_room_record("lobby", 14)).await;
    let mut h = harness();

    let frames = h.send(&state, r#"{"type":"join","roomId":"lobby"}"#).await;
    assert!(frames.is_empty());
    assert!(matches!(h.recv().await, ServerMessage::RoomState { .. }));
    assert!(matches!(h.session.attachment, Some(Attachment::Spectator(_))));

    for cmd in [r#"{"type":"move","x":1,"y":1}"#, r#"{"type":"chat","message":"hi"}"#] {
        let frames = h.send(&state, cmd).await;
        match frames.as_slice() {
            [ServerMessage::Error { code, message }] => {
                assert_eq!(code, "NOT_IN_ROOM");
                assert_eq!(message, "not joined as a participant");
            }
            other => panic!("expected error for {cmd}, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn spectator_disconnect_decrements_count_without_broadcast() {
    let state = test_app_state();
    state.registry.seed_room(&open_room_record("lobby", 14)).await;
    let mut alice = authed_joined(&state, "lobby", Uuid::new_v4(), "Alice").await;

    let mut spec = harness();
    let _ = spec.send(&state, r#"{"type":"join","roomId":"lobby"}"#).await;
    assert!(matches!(spec.recv().await, ServerMessage::RoomState { .. }));

    let handle = match &spec.session.attachment {
        Some(attachment) => attachment.handle().clone(),
        None => panic!("spectator should be attached"),
    };
    assert_eq!(handle.spectators(), 1);

    // Transport close.
    cleanup(&state, &mut spec.session).await;

    for _ in 0..100 {
        if handle.spectators() == 0 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handle.spectators(), 0);
    alice.assert_silent().await;
}

// =============================================================================
// MOVEMENT (scenarios 3, 4)
// =============================================================================

#[tokio::test]
async fn move_fans_out_one_path_frame() {
    let state = test_app_state();
    state.registry.seed_room(&open_room_record("lobby", 14)).await;
    let pid = Uuid::new_v4();
    let mut alice = authed_joined(&state, "lobby", pid, "Alice").await;
    let mut bob = authed_joined(&state, "lobby", Uuid::new_v4(), "Bob").await;
    assert!(matches!(alice.recv().await, ServerMessage::AgentJoined { .. }));

    let frames = alice.send(&state, r#"{"type":"move","x":3,"y":2}"#).await;
    assert!(frames.is_empty());

    for h in [&mut alice, &mut bob] {
        match h.recv().await {
            ServerMessage::AgentPath { agent_id, path, speed } => {
                assert_eq!(agent_id, pid);
                assert_eq!(path.len(), 3);
                assert_eq!(path.last().copied(), Some(wire::PathPoint { x: 3, y: 2 }));
                assert!((speed - 4.0).abs() < f64::EPSILON);
            }
            other => panic!("expected agent_path, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn invalid_move_error_reaches_only_the_mover() {
    let state = test_app_state();
    state.registry.seed_room(&open_room_record("lobby", 14)).await;
    let mut alice = authed_joined(&state, "lobby", Uuid::new_v4(), "Alice").await;
    let mut bob = authed_joined(&state, "lobby", Uuid::new_v4(), "Bob").await;
    assert!(matches!(alice.recv().await, ServerMessage::AgentJoined { .. }));

    let frames = alice.send(&state, r#"{"type":"move","x":99,"y":0}"#).await;
    assert!(frames.is_empty());

    match alice.recv().await {
        ServerMessage::Error { code, message } => {
            assert_eq!(code, "INVALID_MOVE");
            assert_eq!(message, "position (99,0) out of bounds; room is 14x14");
        }
        other => panic!("expected error, got {other:?}"),
    }
    bob.assert_silent().await;
}

#[tokio::test]
async fn move_rate_ceiling_trips_at_twenty_per_second() {
    let state = test_app_state();
    state.registry.seed_room(&open_room_record("lobby", 14)).await;
    let mut alice = authed_joined(&state, "lobby", Uuid::new_v4(), "Alice").await;

    for i in 0..20 {
        let frames = alice.send(&state, r#"{"type":"move","x":1,"y":1}"#).await;
        assert!(frames.is_empty(), "move {i} should be accepted");
    }
    let frames = alice.send(&state, r#"{"type":"move","x":1,"y":1}"#).await;
    match frames.as_slice() {
        [ServerMessage::Error { code, .. }] => assert_eq!(code, "RATE_LIMITED"),
        other => panic!("expected rate-limit error, got {other:?}"),
    }
}

// =============================================================================
// ROOM SWITCHING AND UNLOAD (scenario 6, R3)
// =============================================================================

#[tokio::test]
async fn leave_then_empty_room_is_unloaded() {
    let state = test_app_state();
    state.registry.seed_room(&open_room_record("atrium", 8)).await;
    let mut alice = authed_joined(&state, "atrium", Uuid::new_v4(), "Alice").await;

    let frames = alice.send(&state, r#"{"type":"leave"}"#).await;
    assert!(frames.is_empty());
    assert!(alice.session.attachment.is_none());

    for _ in 0..100 {
        if !state.registry.is_loaded("atrium").await {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(!state.registry.is_loaded("atrium").await, "empty room must unload");
}

#[tokio::test]
async fn join_switches_rooms_atomically() {
    let state = test_app_state();
    state.registry.seed_room(&open_room_record("atrium", 8)).await;
    state.registry.seed_room(&open_room_record("annex", 8)).await;
    let mut alice = authed_joined(&state, "atrium", Uuid::new_v4(), "Alice").await;
    let atrium = match &alice.session.attachment {
        Some(attachment) => attachment.handle().clone(),
        None => panic!("alice should be attached"),
    };

    let frames = alice.send(&state, r#"{"type":"join","roomId":"annex"}"#).await;
    assert!(frames.is_empty());
    match alice.recv().await {
        ServerMessage::RoomState { room, .. } => assert_eq!(room.slug, "annex"),
        other => panic!("expected room_state, got {other:?}"),
    }

    for _ in 0..100 {
        if atrium.participants() == 0 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(atrium.participants(), 0, "old room seat must be released");
}

#[tokio::test]
async fn rejoining_the_same_room_keeps_occupancy_stable() {
    let state = test_app_state();
    state.registry.seed_room(&open_room_record("lobby", 14)).await;
    let mut alice = authed_joined(&state, "lobby", Uuid::new_v4(), "Alice").await;
    let handle = match &alice.session.attachment {
        Some(attachment) => attachment.handle().clone(),
        None => panic!("alice should be attached"),
    };

    let frames = alice.send(&state, r#"{"type":"join","roomId":"lobby"}"#).await;
    assert!(frames.is_empty());
    match alice.recv().await {
        ServerMessage::RoomState { agents, .. } => assert_eq!(agents.len(), 1),
        other => panic!("expected fresh room_state, got {other:?}"),
    }
    assert_eq!(handle.participants(), 1);
}

#[tokio::test]
async fn join_to_a_missing_room_keeps_the_current_attachment() {
    let state = test_app_state();
    state.registry.seed_room(&open_room_record("lobby", 14)).await;
    let mut alice = authed_joined(&state, "lobby", Uuid::new_v4(), "Alice").await;

    // Unknown UUID: the registry resolves it against storage, which is down
    // for unit tests, so the join fails before any detach happens.
    let frames = alice
        .send(&state, &format!(r#"{{"type":"join","roomId":"{}"}}"#, Uuid::new_v4()))
        .await;
    match frames.as_slice() {
        [ServerMessage::Error { code, .. }] => assert_eq!(code, "INTERNAL_ERROR"),
        other => panic!("expected error, got {other:?}"),
    }
    assert!(alice.session.attachment.is_some(), "failed join must not detach");
}

// =============================================================================
// DISPLACEMENT
// =============================================================================

#[tokio::test]
async fn second_socket_with_same_pid_displaces_the_first() {
    let state = test_app_state();
    state.registry.seed_room(&open_room_record("lobby", 14)).await;
    let pid = Uuid::new_v4();

    let mut first = authed_joined(&state, "lobby", pid, "Alice").await;
    let handle = match &first.session.attachment {
        Some(attachment) => attachment.handle().clone(),
        None => panic!("first socket should be attached"),
    };

    let mut second = harness();
    let frames = second.send(&state, &auth_json(&valid_token(pid, "Alice"))).await;
    assert!(matches!(frames.as_slice(), [ServerMessage::AuthOk { .. }]));

    let kick = timeout(Duration::from_millis(500), first.ctrl_rx.recv())
        .await
        .expect("kick timed out")
        .expect("ctrl channel closed");
    assert_eq!(kick, ConnCtrl::Displaced);

    for _ in 0..100 {
        if handle.participants() == 0 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(handle.participants(), 0, "displaced seat must be released");

    // The displaced socket's own teardown must not disturb the new binding.
    cleanup(&state, &mut first.session).await;
    let frames = second.send(&state, r#"{"type":"join","roomId":"lobby"}"#).await;
    assert!(frames.is_empty());
    assert!(matches!(second.recv().await, ServerMessage::RoomState { .. }));
}

// =============================================================================
// LIVE DATABASE TESTS (scenario 2, R2)
// =============================================================================

#[cfg(feature = "live-db-tests")]
mod live {
    use super::*;
    use crate::services::chat;
    use crate::state::test_helpers::integration_app_state;

    async fn register_user(state: &AppState, name: &str, color: &str) -> Uuid {
        let (id,) = sqlx::query_as::<_, (Uuid,)>(
            "INSERT INTO users (id, username, body_color) VALUES ($1, $2, $3) RETURNING id",
        )
        .bind(Uuid::new_v4())
        .bind(name)
        .bind(color)
        .fetch_one(&state.pool)
        .await
        .expect("user insert should succeed");
        id
    }

    #[tokio::test]
    async fn chat_fans_out_to_every_attached_socket() {
        let state = integration_app_state().await;
        state.registry.ensure_canonical().await.unwrap();

        let alice_id = register_user(&state, "alice", "#3B82F6").await;
        let bob_id = register_user(&state, "bob", "#10B981").await;

        let mut alice = authed_joined(&state, "lobby", alice_id, "Alice").await;
        let mut bob = authed_joined(&state, "lobby", bob_id, "Bob").await;
        assert!(matches!(alice.recv().await, ServerMessage::AgentJoined { .. }));

        let frames = bob.send(&state, r#"{"type":"chat","message":"hi"}"#).await;
        assert!(frames.is_empty());

        for h in [&mut alice, &mut bob] {
            match h.recv().await {
                ServerMessage::ChatMessage(msg) => {
                    assert_eq!(msg.agent_id, Some(bob_id));
                    assert_eq!(msg.agent_name, "Bob");
                    assert_eq!(msg.content, "hi");
                }
                other => panic!("expected chat_message, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn overlong_chat_is_truncated_in_broadcast_and_storage() {
        let state = integration_app_state().await;
        state.registry.ensure_canonical().await.unwrap();

        let alice_id = register_user(&state, "alice", "#3B82F6").await;
        let mut alice = authed_joined(&state, "lobby", alice_id, "Alice").await;

        let long = "y".repeat(600);
        let frames = alice
            .send(&state, &format!(r#"{{"type":"chat","message":"{long}"}}"#))
            .await;
        assert!(frames.is_empty());

        let room_id = match &alice.session.attachment {
            Some(attachment) => attachment.handle().room_id,
            None => panic!("alice should be attached"),
        };

        match alice.recv().await {
            ServerMessage::ChatMessage(msg) => assert_eq!(msg.content.chars().count(), 500),
            other => panic!("expected chat_message, got {other:?}"),
        }

        let stored = chat::recent_messages(&state.pool, room_id, 1).await.unwrap();
        assert_eq!(stored[0].content.chars().count(), 500);
    }
}
