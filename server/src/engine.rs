//! Room engine — the single-writer actor owning one room's live state.
//!
//! ARCHITECTURE
//! ============
//! Every loaded room runs one engine task consuming a bounded command
//! channel. All mutation of room state (occupants, positions, chat history)
//! happens inside that task, so per-room event ordering needs no locks: an
//! event enqueued on an attached socket's channel is delivered in the order
//! the engine emitted it.
//!
//! The engine publishes participant/spectator counts through shared atomics
//! so discovery queries never enter the command loop, and reports itself to
//! the registry's reaper when the last occupant detaches.
//!
//! ERROR HANDLING
//! ==============
//! A failed command replies to its originating socket only; it never aborts
//! the engine or touches other occupants. A chat whose insert fails is
//! dropped with `INTERNAL_ERROR` to the author.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use sqlx::PgPool;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use wire::{Agent, AvatarConfig, ChatMessage, ErrorCode, PathPoint, RoomInfo, ServerMessage};

use crate::config::ServerConfig;
use crate::grid::Grid;
use crate::services::chat;
use crate::services::rooms::RoomRecord;

/// Command channel depth per engine; senders await when the room is saturated.
pub const COMMAND_CHANNEL_SIZE: usize = 64;

// =============================================================================
// SOCKET HANDLE
// =============================================================================

/// Clonable handle to a connected socket's outbound queue.
///
/// The connection task owns the socket itself (and its closing); engines
/// hold only this sender and drop it on detach.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    pub id: Uuid,
    pub tx: mpsc::Sender<ServerMessage>,
}

impl ConnHandle {
    /// Best-effort delivery: a slow client's full queue drops the frame
    /// rather than stalling the room.
    fn deliver(&self, msg: ServerMessage) {
        if let Err(e) = self.tx.try_send(msg) {
            warn!(conn_id = %self.id, error = %e, "outbound queue rejected frame");
        }
    }
}

// =============================================================================
// COMMANDS AND EVENTS
// =============================================================================

/// Commands accepted by a room engine.
pub enum RoomCommand {
    /// Place a participant at a spawn point and announce them.
    AttachParticipant {
        pid: Uuid,
        name: String,
        color: String,
        conn: ConnHandle,
    },
    /// Add a read-only socket.
    AttachSpectator { conn: ConnHandle },
    /// Release whatever attachment this socket holds. Idempotent.
    Detach { conn_id: Uuid },
    /// Walk a participant to a target tile.
    Move { pid: Uuid, x: i32, y: i32 },
    /// Broadcast a chat message.
    Chat { pid: Uuid, content: String },
    /// Reaper probe: reply whether the room is still empty. Sent under the
    /// registry write lock so no attach can race the reply.
    ConfirmIdle { reply: oneshot::Sender<bool> },
}

/// Live presence counters published by the engine.
#[derive(Debug, Default)]
pub struct RoomCounters {
    participants: AtomicUsize,
    spectators: AtomicUsize,
}

impl RoomCounters {
    pub fn participants(&self) -> usize {
        self.participants.load(Ordering::Relaxed)
    }

    pub fn spectators(&self) -> usize {
        self.spectators.load(Ordering::Relaxed)
    }
}

/// Notifications from engines to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    /// The room has zero participants and zero spectators.
    Idle(Uuid),
}

#[derive(Debug, thiserror::Error)]
#[error("room engine {0} is gone")]
pub struct EngineGone(pub Uuid);

// =============================================================================
// HANDLE
// =============================================================================

/// Handle to a running engine. Cheap to clone; held by the registry and by
/// every attached connection task.
#[derive(Clone)]
pub struct RoomHandle {
    pub room_id: Uuid,
    pub slug: String,
    pub name: String,
    pub is_public: bool,
    pub owner_id: Option<Uuid>,
    counters: Arc<RoomCounters>,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    /// Enqueue a command for the engine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineGone`] when the engine task has stopped.
    pub async fn send(&self, cmd: RoomCommand) -> Result<(), EngineGone> {
        self.tx.send(cmd).await.map_err(|_| EngineGone(self.room_id))
    }

    #[must_use]
    pub fn participants(&self) -> usize {
        self.counters.participants()
    }

    #[must_use]
    pub fn spectators(&self) -> usize {
        self.counters.spectators()
    }
}

// =============================================================================
// SETTINGS
// =============================================================================

/// The subset of server configuration an engine needs.
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub history_limit: usize,
    pub message_max_len: usize,
    pub walk_speed: f64,
}

impl From<&ServerConfig> for EngineSettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            history_limit: config.history_limit,
            message_max_len: config.message_max_len,
            walk_speed: config.walk_speed,
        }
    }
}

// =============================================================================
// ENGINE
// =============================================================================

struct Seat {
    name: String,
    color: String,
    x: i32,
    y: i32,
    conn: ConnHandle,
}

struct RoomEngine {
    info: RoomInfo,
    grid: Grid,
    settings: EngineSettings,
    pool: PgPool,
    participants: HashMap<Uuid, Seat>,
    spectators: HashMap<Uuid, ConnHandle>,
    history: VecDeque<ChatMessage>,
    counters: Arc<RoomCounters>,
    events: mpsc::UnboundedSender<EngineEvent>,
    rx: mpsc::Receiver<RoomCommand>,
}

/// Spawn an engine for a loaded room and return its handle.
///
/// `history` is the rehydrated recent chat in chronological order. The grid
/// carries the normalized (border-walkable) tiles; `room_state` payloads are
/// built from it rather than the persisted rows.
pub fn spawn_engine(
    record: &RoomRecord,
    owner_username: Option<String>,
    grid: Grid,
    history: Vec<ChatMessage>,
    pool: PgPool,
    settings: EngineSettings,
    events: mpsc::UnboundedSender<EngineEvent>,
) -> RoomHandle {
    let (tx, rx) = mpsc::channel(COMMAND_CHANNEL_SIZE);
    let counters = Arc::new(RoomCounters::default());

    let info = RoomInfo {
        id: record.id,
        name: record.name.clone(),
        slug: record.slug.clone(),
        description: record.description.clone(),
        owner_id: record.owner_id,
        owner_username,
        width: record.width,
        height: record.height,
        tiles: grid.tiles().to_vec(),
        created_at: record.created_at,
        is_public: record.is_public,
    };

    let engine = RoomEngine {
        info,
        grid,
        settings,
        pool,
        participants: HashMap::new(),
        spectators: HashMap::new(),
        history: history.into(),
        counters: Arc::clone(&counters),
        events,
        rx,
    };

    let handle = RoomHandle {
        room_id: record.id,
        slug: record.slug.clone(),
        name: record.name.clone(),
        is_public: record.is_public,
        owner_id: record.owner_id,
        counters,
        tx,
    };

    tokio::spawn(engine.run());
    handle
}

impl RoomEngine {
    async fn run(mut self) {
        info!(room_id = %self.info.id, slug = %self.info.slug, "room engine started");

        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                RoomCommand::AttachParticipant { pid, name, color, conn } => {
                    self.attach_participant(pid, name, color, conn);
                }
                RoomCommand::AttachSpectator { conn } => self.attach_spectator(conn),
                RoomCommand::Detach { conn_id } => self.detach(conn_id),
                RoomCommand::Move { pid, x, y } => self.handle_move(pid, x, y),
                RoomCommand::Chat { pid, content } => self.handle_chat(pid, content).await,
                RoomCommand::ConfirmIdle { reply } => {
                    let _ = reply.send(self.participants.is_empty() && self.spectators.is_empty());
                }
            }
        }

        info!(room_id = %self.info.id, slug = %self.info.slug, "room engine stopped");
    }

    // -------------------------------------------------------------------------
    // ATTACH / DETACH
    // -------------------------------------------------------------------------

    fn attach_participant(&mut self, pid: Uuid, name: String, color: String, conn: ConnHandle) {
        // Same-room re-join is detach + attach; observers see left then joined.
        if self.participants.remove(&pid).is_some() {
            self.broadcast(ServerMessage::AgentLeft { agent_id: pid });
        }

        let (x, y) = self.grid.spawn_point();
        let seat = Seat { name, color, x, y, conn: conn.clone() };
        let joined = self.agent_for(pid, &seat);
        self.participants.insert(pid, seat);
        self.publish_counts();

        // The joiner's snapshot includes themselves; everyone else learns of
        // them through `agent_joined`.
        conn.deliver(self.room_state());
        self.broadcast_except(conn.id, ServerMessage::AgentJoined { agent: joined });
        info!(room_id = %self.info.id, %pid, occupants = self.participants.len(), "participant attached");
    }

    fn attach_spectator(&mut self, conn: ConnHandle) {
        conn.deliver(self.room_state());
        info!(room_id = %self.info.id, conn_id = %conn.id, "spectator attached");
        self.spectators.insert(conn.id, conn);
        self.publish_counts();
    }

    fn detach(&mut self, conn_id: Uuid) {
        let pid = self
            .participants
            .iter()
            .find(|(_, seat)| seat.conn.id == conn_id)
            .map(|(pid, _)| *pid);

        if let Some(pid) = pid {
            self.participants.remove(&pid);
            self.broadcast(ServerMessage::AgentLeft { agent_id: pid });
            info!(room_id = %self.info.id, %pid, remaining = self.participants.len(), "participant detached");
        } else if self.spectators.remove(&conn_id).is_some() {
            info!(room_id = %self.info.id, %conn_id, "spectator detached");
        } else {
            return;
        }

        self.publish_counts();
        if self.participants.is_empty() && self.spectators.is_empty() {
            let _ = self.events.send(EngineEvent::Idle(self.info.id));
        }
    }

    // -------------------------------------------------------------------------
    // MOVE
    // -------------------------------------------------------------------------

    fn handle_move(&mut self, pid: Uuid, x: i32, y: i32) {
        let Some(seat) = self.participants.get(&pid) else {
            // Stale command from a socket displaced mid-flight.
            debug!(room_id = %self.info.id, %pid, "move for unattached participant dropped");
            return;
        };

        if !self.grid.in_bounds(x, y) {
            let reason = format!(
                "position ({x},{y}) out of bounds; room is {}x{}",
                self.info.width, self.info.height
            );
            seat.conn.deliver(ServerMessage::error(ErrorCode::InvalidMove, reason));
            return;
        }
        if !self.grid.walkable(x, y) {
            seat.conn
                .deliver(ServerMessage::error(ErrorCode::InvalidMove, format!("tile ({x},{y}) is not walkable")));
            return;
        }

        let from = (seat.x, seat.y);
        if from == (x, y) {
            // Zero-length walk: acknowledge with a snap instead of a path.
            self.broadcast(ServerMessage::AgentMoved { agent_id: pid, x, y });
            return;
        }

        let path = self.grid.find_path(from, (x, y));
        if path.is_empty() {
            let reason = format!("no walkable path from ({},{}) to ({x},{y})", from.0, from.1);
            seat.conn.deliver(ServerMessage::error(ErrorCode::InvalidMove, reason));
            return;
        }

        // Logical position commits immediately; clients animate the path. A
        // fresh move while a client is still animating replans from here.
        if let Some(seat) = self.participants.get_mut(&pid) {
            seat.x = x;
            seat.y = y;
        }

        let path = path.into_iter().map(|(x, y)| PathPoint { x, y }).collect();
        self.broadcast(ServerMessage::AgentPath { agent_id: pid, path, speed: self.settings.walk_speed });
    }

    // -------------------------------------------------------------------------
    // CHAT
    // -------------------------------------------------------------------------

    async fn handle_chat(&mut self, pid: Uuid, content: String) {
        let Some(seat) = self.participants.get(&pid) else {
            debug!(room_id = %self.info.id, %pid, "chat for unattached participant dropped");
            return;
        };

        let trimmed = content.trim();
        if trimmed.is_empty() {
            return;
        }
        let text = truncate_chars(trimmed, self.settings.message_max_len);

        let message =
            match chat::insert_message(&self.pool, self.info.id, pid, &seat.name, &seat.color, text).await {
                Ok(message) => message,
                Err(e) => {
                    error!(room_id = %self.info.id, %pid, error = %e, "chat insert failed; message dropped");
                    seat.conn
                        .deliver(ServerMessage::error(ErrorCode::InternalError, "message could not be delivered"));
                    return;
                }
            };

        self.history.push_back(message.clone());
        while self.history.len() > self.settings.history_limit {
            self.history.pop_front();
        }

        self.broadcast(ServerMessage::ChatMessage(message));
    }

    // -------------------------------------------------------------------------
    // FAN-OUT
    // -------------------------------------------------------------------------

    fn broadcast(&self, msg: ServerMessage) {
        for seat in self.participants.values() {
            seat.conn.deliver(msg.clone());
        }
        for conn in self.spectators.values() {
            conn.deliver(msg.clone());
        }
    }

    fn broadcast_except(&self, skip_conn: Uuid, msg: ServerMessage) {
        for seat in self.participants.values() {
            if seat.conn.id != skip_conn {
                seat.conn.deliver(msg.clone());
            }
        }
        for conn in self.spectators.values() {
            if conn.id != skip_conn {
                conn.deliver(msg.clone());
            }
        }
    }

    fn room_state(&self) -> ServerMessage {
        let agents = self
            .participants
            .iter()
            .map(|(pid, seat)| self.agent_for(*pid, seat))
            .collect();
        ServerMessage::RoomState {
            room: self.info.clone(),
            agents,
            messages: self.history.iter().cloned().collect(),
        }
    }

    fn agent_for(&self, pid: Uuid, seat: &Seat) -> Agent {
        Agent {
            id: pid,
            name: seat.name.clone(),
            avatar: AvatarConfig { body_color: seat.color.clone() },
            x: seat.x,
            y: seat.y,
        }
    }

    fn publish_counts(&self) {
        self.counters
            .participants
            .store(self.participants.len(), Ordering::Relaxed);
        self.counters
            .spectators
            .store(self.spectators.len(), Ordering::Relaxed);
    }
}

/// Truncate to at most `max` characters without splitting a code point.
fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

#[cfg(test)]
#[path = "engine_test.rs"]
mod tests;
