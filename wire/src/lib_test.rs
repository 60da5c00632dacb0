use super::*;
use serde_json::json;
use time::macros::datetime;

// =============================================================================
// CLIENT DECODE
// =============================================================================

#[test]
fn decodes_every_client_command() {
    assert_eq!(
        decode_client(r#"{"type":"auth","token":"t0k"}"#).unwrap(),
        ClientMessage::Auth { token: "t0k".into() }
    );
    assert_eq!(
        decode_client(r#"{"type":"join","roomId":"lobby"}"#).unwrap(),
        ClientMessage::Join { room_id: "lobby".into() }
    );
    assert_eq!(decode_client(r#"{"type":"leave"}"#).unwrap(), ClientMessage::Leave);
    assert_eq!(
        decode_client(r#"{"type":"move","x":3,"y":2}"#).unwrap(),
        ClientMessage::Move { x: 3, y: 2 }
    );
    assert_eq!(
        decode_client(r#"{"type":"chat","message":"hi"}"#).unwrap(),
        ClientMessage::Chat { message: "hi".into() }
    );
    assert_eq!(decode_client(r#"{"type":"ping"}"#).unwrap(), ClientMessage::Ping);
}

#[test]
fn decodes_negative_move_coordinates() {
    assert_eq!(
        decode_client(r#"{"type":"move","x":-1,"y":0}"#).unwrap(),
        ClientMessage::Move { x: -1, y: 0 }
    );
}

#[test]
fn tolerates_unknown_extra_fields() {
    let msg = decode_client(r#"{"type":"chat","message":"hi","clientVersion":"2.1","seq":44}"#)
        .expect("extra fields must not reject the frame");
    assert_eq!(msg, ClientMessage::Chat { message: "hi".into() });
}

#[test]
fn rejects_missing_type() {
    assert!(matches!(decode_client(r#"{"token":"abc"}"#), Err(DecodeError::MissingType)));
}

#[test]
fn rejects_non_string_type() {
    assert!(matches!(decode_client(r#"{"type":7}"#), Err(DecodeError::MissingType)));
}

#[test]
fn rejects_unknown_type() {
    let err = decode_client(r#"{"type":"teleport","x":1}"#).unwrap_err();
    match err {
        DecodeError::UnknownType(kind) => assert_eq!(kind, "teleport"),
        other => panic!("expected UnknownType, got {other:?}"),
    }
}

#[test]
fn rejects_malformed_json() {
    assert!(matches!(decode_client("{nope"), Err(DecodeError::Json(_))));
}

#[test]
fn rejects_wrong_field_types() {
    assert!(matches!(
        decode_client(r#"{"type":"move","x":"east","y":0}"#),
        Err(DecodeError::Json(_))
    ));
    assert!(matches!(decode_client(r#"{"type":"join"}"#), Err(DecodeError::Json(_))));
}

// =============================================================================
// SERVER ENCODE
// =============================================================================

fn sample_agent() -> Agent {
    Agent {
        id: Uuid::new_v4(),
        name: "Alice".into(),
        avatar: AvatarConfig { body_color: "#3B82F6".into() },
        x: 0,
        y: 0,
    }
}

#[test]
fn auth_ok_uses_wire_field_names() {
    let pid = Uuid::new_v4();
    let msg = ServerMessage::AuthOk {
        agent_id: pid,
        name: "Alice".into(),
        avatar: Avatar { id: pid, agent_id: pid, body_color: "#3B82F6".into() },
    };
    let value: Value = serde_json::from_str(&encode_server(&msg).unwrap()).unwrap();

    assert_eq!(value["type"], "auth_ok");
    assert_eq!(value["agentId"], json!(pid));
    assert_eq!(value["avatar"]["agentId"], json!(pid));
    assert_eq!(value["avatar"]["bodyColor"], "#3B82F6");
}

#[test]
fn agent_path_carries_path_and_speed() {
    let pid = Uuid::new_v4();
    let msg = ServerMessage::AgentPath {
        agent_id: pid,
        path: vec![PathPoint { x: 1, y: 1 }, PathPoint { x: 2, y: 1 }],
        speed: 4.0,
    };
    let value: Value = serde_json::from_str(&encode_server(&msg).unwrap()).unwrap();

    assert_eq!(value["type"], "agent_path");
    assert_eq!(value["path"], json!([{"x": 1, "y": 1}, {"x": 2, "y": 1}]));
    assert_eq!(value["speed"], json!(4.0));
}

#[test]
fn chat_message_serializes_snapshot_and_rfc3339_timestamp() {
    let msg = ServerMessage::ChatMessage(ChatMessage {
        id: Uuid::new_v4(),
        room_id: Uuid::new_v4(),
        agent_id: None,
        agent_name: "Bob".into(),
        avatar_config: AvatarConfig { body_color: "#10B981".into() },
        content: "hi".into(),
        timestamp: datetime!(2025-06-01 12:30:00 UTC),
    });
    let value: Value = serde_json::from_str(&encode_server(&msg).unwrap()).unwrap();

    assert_eq!(value["type"], "chat_message");
    assert_eq!(value["agentId"], Value::Null);
    assert_eq!(value["agentName"], "Bob");
    assert_eq!(value["avatarConfig"]["bodyColor"], "#10B981");
    assert_eq!(value["timestamp"], "2025-06-01T12:30:00Z");
}

#[test]
fn room_state_omits_absent_optional_fields() {
    let msg = ServerMessage::RoomState {
        room: RoomInfo {
            id: Uuid::new_v4(),
            name: "Lobby".into(),
            slug: "lobby".into(),
            description: None,
            owner_id: None,
            owner_username: None,
            width: 5,
            height: 5,
            tiles: vec![vec![0; 5]; 5],
            created_at: datetime!(2025-01-01 00:00:00 UTC),
            is_public: true,
        },
        agents: vec![sample_agent()],
        messages: vec![],
    };
    let value: Value = serde_json::from_str(&encode_server(&msg).unwrap()).unwrap();

    assert_eq!(value["room"]["slug"], "lobby");
    assert!(value["room"].get("description").is_none());
    assert!(value["room"].get("ownerId").is_none());
    assert_eq!(value["room"]["isPublic"], json!(true));
    assert_eq!(value["room"]["createdAt"], "2025-01-01T00:00:00Z");
    assert_eq!(value["agents"][0]["avatar"]["bodyColor"], "#3B82F6");
}

#[test]
fn pong_is_a_bare_tag() {
    assert_eq!(encode_server(&ServerMessage::Pong).unwrap(), r#"{"type":"pong"}"#);
}

#[test]
fn error_helper_stamps_the_code() {
    let msg = ServerMessage::error(ErrorCode::InvalidMove, "tile (2,2) is not walkable");
    let value: Value = serde_json::from_str(&encode_server(&msg).unwrap()).unwrap();

    assert_eq!(value["type"], "error");
    assert_eq!(value["code"], "INVALID_MOVE");
    assert_eq!(value["message"], "tile (2,2) is not walkable");
}

#[test]
fn server_messages_round_trip() {
    let original = ServerMessage::AgentMoved { agent_id: Uuid::new_v4(), x: 7, y: 3 };
    let text = encode_server(&original).unwrap();
    let restored: ServerMessage = serde_json::from_str(&text).unwrap();
    assert_eq!(restored, original);
}
