//! Room registry — lazy load, idle unload, discovery, identity bindings.
//!
//! ARCHITECTURE
//! ============
//! The registry is the process-wide map from room id to engine handle, with
//! a secondary slug index, guarded by one coarse `RwLock`. Engines are
//! spawned on first attach (room row + recent chat fetched outside the
//! lock) and reaped when idle — except the canonical room, which is created
//! at startup if missing and kept resident.
//!
//! Attach goes through the registry so it can serialize against the reaper:
//! attaches enqueue while holding the table lock, and the reaper confirms a
//! room is still empty via a `ConfirmIdle` round-trip under the write lock
//! before removing it. An engine therefore never disappears underneath an
//! in-flight attach.
//!
//! The binding table maps each authenticated participant id to its single
//! live socket; a fresh auth for the same id displaces the previous socket
//! (detach from its room, then a kick on its control channel).

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use sqlx::PgPool;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::engine::{ConnHandle, EngineEvent, EngineSettings, RoomCommand, RoomHandle, spawn_engine};
use crate::grid::Grid;
use crate::services::{chat, rooms};

/// Side length of the canonical room created when none exists.
const DEFAULT_CANONICAL_SIDE: u32 = 20;
const DEFAULT_CANONICAL_NAME: &str = "Lobby";

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("room not found: {0}")]
    NotFound(String),
    #[error("room engine {0} is gone")]
    EngineGone(Uuid),
    #[error(transparent)]
    Rooms(#[from] rooms::RoomsError),
}

/// One discovery row.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub participants: usize,
    pub spectators: usize,
    pub is_public: bool,
}

impl RoomSummary {
    fn from_handle(handle: &RoomHandle) -> Self {
        Self {
            id: handle.room_id,
            slug: handle.slug.clone(),
            name: handle.name.clone(),
            participants: handle.participants(),
            spectators: handle.spectators(),
            is_public: handle.is_public,
        }
    }
}

/// Kick signals sent to a connection's control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnCtrl {
    /// Another socket authenticated as this participant; close this one.
    Displaced,
}

struct Binding {
    conn_id: Uuid,
    ctrl: mpsc::UnboundedSender<ConnCtrl>,
    room: Option<RoomHandle>,
}

#[derive(Default)]
struct RoomTable {
    by_id: HashMap<Uuid, RoomHandle>,
    by_slug: HashMap<String, Uuid>,
}

struct RegistryInner {
    pool: PgPool,
    config: Arc<ServerConfig>,
    rooms: RwLock<RoomTable>,
    bindings: RwLock<HashMap<Uuid, Binding>>,
    events_tx: mpsc::UnboundedSender<EngineEvent>,
}

/// Process-wide registry of loaded room engines. Clone freely.
#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<RegistryInner>,
}

impl RoomRegistry {
    /// Create the registry and start its idle reaper task.
    #[must_use]
    pub fn new(pool: PgPool, config: Arc<ServerConfig>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Self {
            inner: Arc::new(RegistryInner {
                pool,
                config,
                rooms: RwLock::new(RoomTable::default()),
                bindings: RwLock::new(HashMap::new()),
                events_tx,
            }),
        };
        tokio::spawn(registry.clone().reap_loop(events_rx));
        registry
    }

    // -------------------------------------------------------------------------
    // LOAD
    // -------------------------------------------------------------------------

    /// Ensure the canonical room exists (creating the default one when
    /// missing) and load it resident.
    ///
    /// # Errors
    ///
    /// Returns a persistence error; startup treats this as fatal.
    pub async fn ensure_canonical(&self) -> Result<(), RegistryError> {
        let slug = self.inner.config.canonical_slug.clone();
        if rooms::find_room_by_slug(&self.inner.pool, &slug).await?.is_none() {
            info!(%slug, "canonical room missing; creating default");
            rooms::create_default_room(&self.inner.pool, &slug, DEFAULT_CANONICAL_NAME, DEFAULT_CANONICAL_SIDE)
                .await?;
        }
        self.load_by_slug(&slug).await?;
        Ok(())
    }

    /// Return the engine for a room id, loading it on demand.
    ///
    /// # Errors
    ///
    /// `NotFound` when no such room is persisted; persistence errors
    /// otherwise.
    pub async fn load_by_id(&self, id: Uuid) -> Result<RoomHandle, RegistryError> {
        if let Some(handle) = self.inner.rooms.read().await.by_id.get(&id) {
            return Ok(handle.clone());
        }
        let record = rooms::find_room_by_id(&self.inner.pool, id)
            .await?
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        self.install(record).await
    }

    /// Return the engine for a room slug, loading it on demand.
    ///
    /// # Errors
    ///
    /// `NotFound` when no such room is persisted; persistence errors
    /// otherwise.
    pub async fn load_by_slug(&self, slug: &str) -> Result<RoomHandle, RegistryError> {
        {
            let table = self.inner.rooms.read().await;
            if let Some(handle) = table.by_slug.get(slug).and_then(|id| table.by_id.get(id)) {
                return Ok(handle.clone());
            }
        }
        let record = rooms::find_room_by_slug(&self.inner.pool, slug)
            .await?
            .ok_or_else(|| RegistryError::NotFound(slug.to_owned()))?;
        self.install(record).await
    }

    /// Resolve a `join` target: a UUID loads by id, anything else by slug.
    /// A UUID that matches no room id is retried as a slug.
    ///
    /// # Errors
    ///
    /// `NotFound` when neither resolution succeeds.
    pub async fn resolve(&self, room_ref: &str) -> Result<RoomHandle, RegistryError> {
        if let Ok(id) = Uuid::parse_str(room_ref) {
            match self.load_by_id(id).await {
                Err(RegistryError::NotFound(_)) => {}
                other => return other,
            }
        }
        self.load_by_slug(room_ref).await
    }

    /// Hydrate and register an engine for `record`, rechecking the table
    /// under the write lock so two racing loads converge on one engine.
    async fn install(&self, record: rooms::RoomRecord) -> Result<RoomHandle, RegistryError> {
        // Hydration I/O stays outside the table lock.
        let owner_username = match record.owner_id {
            Some(owner_id) => rooms::find_username(&self.inner.pool, owner_id).await?,
            None => None,
        };
        let limit = self.inner.config.history_limit;
        let mut history = chat::recent_messages(&self.inner.pool, record.id, limit as i64)
            .await
            .map_err(rooms::RoomsError::Database)?;
        history.reverse(); // newest-first from storage, chronological in memory

        let mut table = self.inner.rooms.write().await;
        if let Some(existing) = table.by_id.get(&record.id) {
            return Ok(existing.clone());
        }

        let grid = Grid::new(record.width, record.height, record.tiles.clone());
        let handle = spawn_engine(
            &record,
            owner_username,
            grid,
            history,
            self.inner.pool.clone(),
            EngineSettings::from(&*self.inner.config),
            self.inner.events_tx.clone(),
        );
        table.by_id.insert(record.id, handle.clone());
        table.by_slug.insert(record.slug.clone(), record.id);
        info!(room_id = %record.id, slug = %record.slug, "room loaded");
        Ok(handle)
    }

    // -------------------------------------------------------------------------
    // ATTACH / DETACH
    // -------------------------------------------------------------------------

    /// Attach an authenticated participant to a room, loading it on demand.
    ///
    /// The attach command is enqueued while the table read lock is held, so
    /// the reaper (which confirms idleness under the write lock) can never
    /// remove the engine with this attach in flight.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown rooms, `EngineGone` if the engine stopped.
    pub async fn join_participant(
        &self,
        room_ref: &str,
        pid: Uuid,
        name: &str,
        color: &str,
        conn: ConnHandle,
    ) -> Result<RoomHandle, RegistryError> {
        let conn_id = conn.id;
        let handle = self.attach(room_ref, |handle_conn| RoomCommand::AttachParticipant {
            pid,
            name: name.to_owned(),
            color: color.to_owned(),
            conn: handle_conn,
        }, conn)
        .await?;

        // Record the room on this socket's binding only; a displacement that
        // raced this join must not inherit the seat.
        let mut bindings = self.inner.bindings.write().await;
        if let Some(binding) = bindings.get_mut(&pid) {
            if binding.conn_id == conn_id {
                binding.room = Some(handle.clone());
            }
        }
        Ok(handle)
    }

    /// Attach an unauthenticated spectator to a room, loading it on demand.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown rooms, `EngineGone` if the engine stopped.
    pub async fn join_spectator(&self, room_ref: &str, conn: ConnHandle) -> Result<RoomHandle, RegistryError> {
        self.attach(room_ref, |handle_conn| RoomCommand::AttachSpectator { conn: handle_conn }, conn)
            .await
    }

    async fn attach(
        &self,
        room_ref: &str,
        make_cmd: impl FnOnce(ConnHandle) -> RoomCommand,
        conn: ConnHandle,
    ) -> Result<RoomHandle, RegistryError> {
        // Resolve (may load + insert), then re-look-up and enqueue under the
        // read lock so reaping cannot interleave. A reap landing between the
        // two steps just sends us around again to reload.
        let mut last_room = Uuid::nil();
        for _ in 0..3 {
            let handle = self.resolve(room_ref).await?;
            last_room = handle.room_id;
            let table = self.inner.rooms.read().await;
            if let Some(live) = table.by_id.get(&handle.room_id) {
                live.send(make_cmd(conn))
                    .await
                    .map_err(|gone| RegistryError::EngineGone(gone.0))?;
                return Ok(live.clone());
            }
        }
        // The failed attach may have left a freshly loaded engine with no
        // occupants; let the reaper collect it.
        let _ = self.inner.events_tx.send(EngineEvent::Idle(last_room));
        Err(RegistryError::EngineGone(last_room))
    }

    /// Detach a socket from an engine and clear its binding's room slot.
    pub async fn detach(&self, handle: &RoomHandle, conn_id: Uuid, pid: Option<Uuid>) {
        if handle.send(RoomCommand::Detach { conn_id }).await.is_err() {
            warn!(room_id = %handle.room_id, "detach raced engine shutdown");
        }
        if let Some(pid) = pid {
            let mut bindings = self.inner.bindings.write().await;
            if let Some(binding) = bindings.get_mut(&pid) {
                if binding.conn_id == conn_id {
                    binding.room = None;
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // IDENTITY BINDINGS
    // -------------------------------------------------------------------------

    /// Bind a participant id to a socket, displacing any previous socket:
    /// the old socket is detached from its room and told to close.
    pub async fn bind_connection(&self, pid: Uuid, conn_id: Uuid, ctrl: mpsc::UnboundedSender<ConnCtrl>) {
        let displaced = {
            let mut bindings = self.inner.bindings.write().await;
            let same_socket = bindings.get(&pid).is_some_and(|b| b.conn_id == conn_id);
            if same_socket {
                // Same socket refreshing its identity keeps its room slot.
                if let Some(binding) = bindings.get_mut(&pid) {
                    binding.ctrl = ctrl;
                }
                None
            } else {
                bindings.insert(pid, Binding { conn_id, ctrl, room: None })
            }
        };

        if let Some(displaced) = displaced {
            info!(%pid, old_conn = %displaced.conn_id, new_conn = %conn_id, "displacing previous socket");
            if let Some(room) = displaced.room {
                self.detach(&room, displaced.conn_id, None).await;
            }
            let _ = displaced.ctrl.send(ConnCtrl::Displaced);
        }
    }

    /// Drop a binding, but only if it still belongs to this socket — a
    /// displaced socket's cleanup must not evict its successor.
    pub async fn unbind_connection(&self, pid: Uuid, conn_id: Uuid) {
        let mut bindings = self.inner.bindings.write().await;
        if bindings.get(&pid).is_some_and(|b| b.conn_id == conn_id) {
            bindings.remove(&pid);
        }
    }

    // -------------------------------------------------------------------------
    // REAPER
    // -------------------------------------------------------------------------

    async fn reap_loop(self, mut events_rx: mpsc::UnboundedReceiver<EngineEvent>) {
        while let Some(event) = events_rx.recv().await {
            let EngineEvent::Idle(room_id) = event;
            self.reap_if_idle(room_id).await;
        }
    }

    async fn reap_if_idle(&self, room_id: Uuid) {
        let mut table = self.inner.rooms.write().await;
        let Some(handle) = table.by_id.get(&room_id) else {
            return;
        };
        if handle.slug == self.inner.config.canonical_slug {
            return;
        }

        // Confirm under the write lock: queued attaches are ordered before
        // this probe, and no new attach can enqueue until the lock drops.
        let (reply_tx, reply_rx) = oneshot::channel();
        if handle.send(RoomCommand::ConfirmIdle { reply: reply_tx }).await.is_err() {
            return;
        }
        let Ok(true) = reply_rx.await else {
            return;
        };

        let slug = handle.slug.clone();
        table.by_id.remove(&room_id);
        table.by_slug.remove(&slug);
        info!(%room_id, %slug, "idle room unloaded");
    }

    // -------------------------------------------------------------------------
    // DISCOVERY
    // -------------------------------------------------------------------------

    /// Rooms worth showing on the "active" shelf: the canonical room always,
    /// plus every loaded room with participants. Canonical-but-empty sorts
    /// first; the rest by participant count descending.
    ///
    /// # Errors
    ///
    /// Returns a persistence error only when the canonical room must be
    /// synthesized from storage and that read fails.
    pub async fn active_rooms(&self) -> Result<Vec<RoomSummary>, RegistryError> {
        let canonical = &self.inner.config.canonical_slug;
        let handles = self.snapshot().await;

        let mut out: Vec<RoomSummary> = handles
            .iter()
            .filter(|h| h.slug == *canonical || h.participants() > 0)
            .map(RoomSummary::from_handle)
            .collect();

        // The canonical room is resident in nominal operation, but a cold
        // registry can still answer discovery from storage.
        if !out.iter().any(|s| s.slug == *canonical) {
            if let Some(record) = rooms::find_room_by_slug(&self.inner.pool, canonical).await? {
                out.push(RoomSummary {
                    id: record.id,
                    slug: record.slug,
                    name: record.name,
                    participants: 0,
                    spectators: 0,
                    is_public: record.is_public,
                });
            }
        }

        out.sort_by_key(|s| {
            let canonical_empty = s.slug == *canonical && s.participants == 0;
            (if canonical_empty { 0 } else { 1 }, std::cmp::Reverse(s.participants))
        });
        Ok(out)
    }

    /// Loaded rooms with at least one spectator, most watched first.
    pub async fn most_watched_rooms(&self) -> Vec<RoomSummary> {
        let mut out: Vec<RoomSummary> = self
            .snapshot()
            .await
            .iter()
            .filter(|h| h.spectators() > 0)
            .map(RoomSummary::from_handle)
            .collect();
        out.sort_by_key(|s| std::cmp::Reverse(s.spectators));
        out
    }

    /// Every public room, newest first, with live counts for loaded ones.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the listing query fails.
    pub async fn public_rooms(&self) -> Result<Vec<RoomSummary>, RegistryError> {
        let hits = rooms::list_public_rooms(&self.inner.pool).await?;
        Ok(self.merge_live_counts(hits).await)
    }

    /// Case-insensitive substring search over public rooms by room name or
    /// owner display name. Every loaded room is also persisted, so one
    /// storage query covers both; live counts are merged in for loaded hits.
    ///
    /// # Errors
    ///
    /// Returns a persistence error if the search query fails.
    pub async fn search(&self, query: &str) -> Result<Vec<RoomSummary>, RegistryError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let hits = rooms::search_public_rooms(&self.inner.pool, query).await?;
        Ok(self.merge_live_counts(hits).await)
    }

    async fn merge_live_counts(&self, hits: Vec<rooms::RoomHit>) -> Vec<RoomSummary> {
        let table = self.inner.rooms.read().await;
        hits.into_iter()
            .map(|hit| match table.by_id.get(&hit.id) {
                Some(handle) => RoomSummary::from_handle(handle),
                None => RoomSummary {
                    id: hit.id,
                    slug: hit.slug,
                    name: hit.name,
                    participants: 0,
                    spectators: 0,
                    is_public: hit.is_public,
                },
            })
            .collect()
    }

    async fn snapshot(&self) -> Vec<RoomHandle> {
        self.inner.rooms.read().await.by_id.values().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // TEST SEEDING
    // -------------------------------------------------------------------------

    /// Whether a slug currently maps to a loaded engine.
    #[cfg(test)]
    pub(crate) async fn is_loaded(&self, slug: &str) -> bool {
        self.inner.rooms.read().await.by_slug.contains_key(slug)
    }

    /// Register an engine for a hand-built record without touching storage.
    #[cfg(test)]
    pub(crate) async fn seed_room(&self, record: &rooms::RoomRecord) -> RoomHandle {
        let grid = Grid::new(record.width, record.height, record.tiles.clone());
        let handle = spawn_engine(
            record,
            None,
            grid,
            Vec::new(),
            self.inner.pool.clone(),
            EngineSettings::from(&*self.inner.config),
            self.inner.events_tx.clone(),
        );
        let mut table = self.inner.rooms.write().await;
        table.by_id.insert(record.id, handle.clone());
        table.by_slug.insert(record.slug.clone(), record.id);
        handle
    }
}

#[cfg(test)]
#[path = "registry_test.rs"]
mod tests;
