//! WebSocket connection handler — the per-socket driver.
//!
//! DESIGN
//! ======
//! On upgrade each socket gets a task running a `select!` loop over three
//! sources: inbound frames, the per-connection outbound queue (fed by room
//! engines), and a control channel the registry uses to kick a socket when
//! its participant id is claimed by a newer connection.
//!
//! LIFECYCLE
//! =========
//! 1. `CONNECTED` — accepts `auth` (in-band handshake, socket stays open on
//!    failure) or `join` (attaches as a spectator).
//! 2. Authenticated sockets `join` as participants; a later `join` switches
//!    rooms (detach old engine, attach new).
//! 3. In a room: `move` and `chat` forward to the engine under per-socket
//!    rate ceilings; `leave` detaches; `ping` answers `pong` in any state.
//! 4. Close or displacement → exactly-once detach + binding cleanup.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;
use wire::{Avatar, ClientMessage, ErrorCode, ServerMessage};

use crate::engine::{ConnHandle, RoomCommand, RoomHandle};
use crate::rate_limit::CommandLimiter;
use crate::registry::{ConnCtrl, RegistryError};
use crate::services::{rooms, token};
use crate::state::AppState;

/// Outbound frames queued per socket; engines drop frames beyond this.
const OUTBOUND_QUEUE: usize = 256;

// =============================================================================
// SESSION
// =============================================================================

struct Identity {
    pid: Uuid,
    name: String,
    color: String,
}

enum Attachment {
    Participant(RoomHandle),
    Spectator(RoomHandle),
}

impl Attachment {
    fn handle(&self) -> &RoomHandle {
        match self {
            Self::Participant(handle) | Self::Spectator(handle) => handle,
        }
    }
}

/// Everything the connection task knows about one socket.
struct Session {
    conn: ConnHandle,
    identity: Option<Identity>,
    attachment: Option<Attachment>,
    limiter: CommandLimiter,
}

// =============================================================================
// UPGRADE AND CONNECTION LOOP
// =============================================================================

pub async fn handle_ws(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_ws(socket, state))
}

async fn run_ws(mut socket: WebSocket, state: AppState) {
    let conn_id = Uuid::new_v4();
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE);
    let (ctrl_tx, mut ctrl_rx) = mpsc::unbounded_channel::<ConnCtrl>();

    let mut session = Session {
        conn: ConnHandle { id: conn_id, tx: out_tx },
        identity: None,
        attachment: None,
        limiter: CommandLimiter::new(),
    };
    info!(%conn_id, "ws: client connected");

    'conn: loop {
        tokio::select! {
            inbound = socket.recv() => {
                let Some(Ok(msg)) = inbound else { break };
                match msg {
                    Message::Text(text) => {
                        for frame in process_message(&state, &mut session, &ctrl_tx, &text).await {
                            if send_frame(&mut socket, &frame).await.is_err() {
                                break 'conn;
                            }
                        }
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Some(frame) = out_rx.recv() => {
                if send_frame(&mut socket, &frame).await.is_err() {
                    break;
                }
            }
            Some(ctrl) = ctrl_rx.recv() => {
                let ConnCtrl::Displaced = ctrl;
                info!(%conn_id, "ws: displaced by a newer socket for the same participant");
                break;
            }
        }
    }

    cleanup(&state, &mut session).await;
    info!(%conn_id, "ws: client disconnected");
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Decode and process one inbound frame, returning frames for the sender.
///
/// Split from the socket loop so tests can drive the full command surface
/// without a live websocket; engine broadcasts land on the session's
/// outbound channel either way.
async fn process_message(
    state: &AppState,
    session: &mut Session,
    ctrl: &mpsc::UnboundedSender<ConnCtrl>,
    text: &str,
) -> Vec<ServerMessage> {
    let msg = match wire::decode_client(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!(conn_id = %session.conn.id, error = %e, "ws: rejected inbound frame");
            return vec![ServerMessage::error(ErrorCode::InvalidMessage, e.to_string())];
        }
    };

    match msg {
        ClientMessage::Ping => vec![ServerMessage::Pong],
        ClientMessage::Auth { token } => handle_auth(state, session, ctrl, &token).await,
        ClientMessage::Join { room_id } => handle_join(state, session, &room_id).await,
        ClientMessage::Leave => handle_leave(state, session).await,
        ClientMessage::Move { x, y } => handle_move(session, x, y).await,
        ClientMessage::Chat { message } => handle_chat(session, message).await,
    }
}

// =============================================================================
// HANDSHAKE
// =============================================================================

async fn handle_auth(
    state: &AppState,
    session: &mut Session,
    ctrl: &mpsc::UnboundedSender<ConnCtrl>,
    raw_token: &str,
) -> Vec<ServerMessage> {
    let claims = match token::verify(&state.config.token_secret, raw_token) {
        Ok(claims) => claims,
        // Failed handshake leaves the socket connected and unauthenticated.
        Err(e) => return vec![ServerMessage::AuthError { error: e.to_string() }],
    };

    // Re-auth as a different participant: the old identity leaves its room
    // and releases its binding before the new one takes over.
    if let Some(prev) = &session.identity {
        if prev.pid != claims.sub {
            if matches!(session.attachment, Some(Attachment::Participant(_))) {
                if let Some(attachment) = session.attachment.take() {
                    state.registry.detach(attachment.handle(), session.conn.id, Some(prev.pid)).await;
                }
            }
            state.registry.unbind_connection(prev.pid, session.conn.id).await;
        }
    }

    // Claim the participant id; any other socket holding it gets kicked.
    state.registry.bind_connection(claims.sub, session.conn.id, ctrl.clone()).await;

    if let Err(e) = rooms::touch_last_seen(&state.pool, claims.sub).await {
        warn!(pid = %claims.sub, error = %e, "last-seen update failed");
    }

    session.identity = Some(Identity { pid: claims.sub, name: claims.name.clone(), color: claims.color.clone() });
    info!(conn_id = %session.conn.id, pid = %claims.sub, "ws: authenticated");

    vec![ServerMessage::AuthOk {
        agent_id: claims.sub,
        name: claims.name,
        avatar: Avatar { id: claims.sub, agent_id: claims.sub, body_color: claims.color },
    }]
}

// =============================================================================
// ROOM MEMBERSHIP
// =============================================================================

async fn handle_join(state: &AppState, session: &mut Session, room_ref: &str) -> Vec<ServerMessage> {
    // Validate the target before leaving the current room, so a bad join
    // leaves the session where it was.
    if let Err(e) = state.registry.resolve(room_ref).await {
        return vec![registry_error_frame(&e)];
    }

    if let Some(attachment) = session.attachment.take() {
        let pid = detached_pid(&attachment, session.identity.as_ref());
        state.registry.detach(attachment.handle(), session.conn.id, pid).await;
    }

    let attached = match &session.identity {
        Some(id) => state
            .registry
            .join_participant(room_ref, id.pid, &id.name, &id.color, session.conn.clone())
            .await
            .map(Attachment::Participant),
        None => state
            .registry
            .join_spectator(room_ref, session.conn.clone())
            .await
            .map(Attachment::Spectator),
    };

    match attached {
        Ok(attachment) => {
            session.attachment = Some(attachment);
            // The engine delivers `room_state` on the outbound channel.
            Vec::new()
        }
        Err(e) => vec![registry_error_frame(&e)],
    }
}

async fn handle_leave(state: &AppState, session: &mut Session) -> Vec<ServerMessage> {
    let Some(attachment) = session.attachment.take() else {
        return vec![ServerMessage::error(ErrorCode::NotInRoom, "not in a room")];
    };
    let pid = detached_pid(&attachment, session.identity.as_ref());
    state.registry.detach(attachment.handle(), session.conn.id, pid).await;
    Vec::new()
}

// =============================================================================
// ROOM COMMANDS
// =============================================================================

async fn handle_move(session: &mut Session, x: i32, y: i32) -> Vec<ServerMessage> {
    let (handle, pid) = match (&session.attachment, &session.identity) {
        (Some(Attachment::Participant(handle)), Some(id)) => (handle.clone(), id.pid),
        (Some(Attachment::Spectator(_)), _) => {
            return vec![ServerMessage::error(ErrorCode::NotInRoom, "not joined as a participant")];
        }
        _ => return vec![ServerMessage::error(ErrorCode::NotInRoom, "join a room first")],
    };

    if let Err(e) = session.limiter.check_move() {
        return vec![ServerMessage::error(ErrorCode::RateLimited, e.to_string())];
    }

    match handle.send(RoomCommand::Move { pid, x, y }).await {
        Ok(()) => Vec::new(),
        Err(e) => {
            error!(conn_id = %session.conn.id, error = %e, "move command lost");
            vec![ServerMessage::error(ErrorCode::InternalError, "room is unavailable")]
        }
    }
}

async fn handle_chat(session: &mut Session, message: String) -> Vec<ServerMessage> {
    let (handle, pid) = match (&session.attachment, &session.identity) {
        (Some(Attachment::Participant(handle)), Some(id)) => (handle.clone(), id.pid),
        (Some(Attachment::Spectator(_)), _) => {
            return vec![ServerMessage::error(ErrorCode::NotInRoom, "not joined as a participant")];
        }
        _ => return vec![ServerMessage::error(ErrorCode::NotInRoom, "join a room first")],
    };

    if let Err(e) = session.limiter.check_chat() {
        return vec![ServerMessage::error(ErrorCode::RateLimited, e.to_string())];
    }

    match handle.send(RoomCommand::Chat { pid, content: message }).await {
        Ok(()) => Vec::new(),
        Err(e) => {
            error!(conn_id = %session.conn.id, error = %e, "chat command lost");
            vec![ServerMessage::error(ErrorCode::InternalError, "room is unavailable")]
        }
    }
}

// =============================================================================
// TEARDOWN AND HELPERS
// =============================================================================

/// Exactly-once detach on close. Safe after displacement: the engine detach
/// is idempotent and the binding removal is guarded by connection id.
async fn cleanup(state: &AppState, session: &mut Session) {
    if let Some(attachment) = session.attachment.take() {
        let pid = detached_pid(&attachment, session.identity.as_ref());
        state.registry.detach(attachment.handle(), session.conn.id, pid).await;
    }
    if let Some(id) = &session.identity {
        state.registry.unbind_connection(id.pid, session.conn.id).await;
    }
}

fn detached_pid(attachment: &Attachment, identity: Option<&Identity>) -> Option<Uuid> {
    match (attachment, identity) {
        (Attachment::Participant(_), Some(id)) => Some(id.pid),
        _ => None,
    }
}

fn registry_error_frame(e: &RegistryError) -> ServerMessage {
    match e {
        RegistryError::NotFound(room_ref) => {
            ServerMessage::error(ErrorCode::RoomNotFound, format!("room not found: {room_ref}"))
        }
        other => {
            error!(error = %other, "room load failed");
            ServerMessage::error(ErrorCode::InternalError, "failed to load room")
        }
    }
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerMessage) -> Result<(), ()> {
    let json = match wire::encode_server(frame) {
        Ok(json) => json,
        Err(e) => {
            warn!(error = %e, "ws: failed to serialize frame");
            return Err(());
        }
    };
    if let ServerMessage::Error { code, message } = frame {
        warn!(code, message, "ws: send error frame");
    }
    socket.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
#[path = "ws_test.rs"]
mod tests;
