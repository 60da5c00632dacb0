//! Room persistence service — lookup, listing, search, canonical bootstrap.
//!
//! DESIGN
//! ======
//! Rooms are created through the REST surface (out of process here) and read
//! by the registry on first attach. Tile maps are stored as a jsonb H×W array
//! of 0/1; decoding failures surface as a typed error rather than a panic so
//! one corrupt row cannot take a handler down.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::grid::Grid;

#[derive(Debug, thiserror::Error)]
pub enum RoomsError {
    #[error("room {0} has a corrupt tile map")]
    CorruptTiles(Uuid),
    #[error("room `{0}` vanished during bootstrap")]
    BootstrapRace(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// A persisted room row, tiles decoded.
#[derive(Debug, Clone)]
pub struct RoomRecord {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub width: u32,
    pub height: u32,
    /// Row-major H×W, `0` walkable / `1` blocked, exactly as persisted.
    pub tiles: Vec<Vec<u8>>,
    pub owner_id: Option<Uuid>,
    pub is_public: bool,
    pub created_at: OffsetDateTime,
}

/// A lightweight search/listing hit.
#[derive(Debug, Clone)]
pub struct RoomHit {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub is_public: bool,
}

type RoomRow = (
    Uuid,
    String,
    String,
    Option<String>,
    i32,
    i32,
    serde_json::Value,
    Option<Uuid>,
    bool,
    OffsetDateTime,
);

const ROOM_COLUMNS: &str = "id, slug, name, description, width, height, tiles, owner_id, is_public, created_at";

fn record_from_row(row: RoomRow) -> Result<RoomRecord, RoomsError> {
    let (id, slug, name, description, width, height, tiles, owner_id, is_public, created_at) = row;
    let tiles: Vec<Vec<u8>> = serde_json::from_value(tiles).map_err(|_| RoomsError::CorruptTiles(id))?;
    Ok(RoomRecord {
        id,
        slug,
        name,
        description,
        width: width.max(0) as u32,
        height: height.max(0) as u32,
        tiles,
        owner_id,
        is_public,
        created_at,
    })
}

/// Fetch a room by slug.
///
/// # Errors
///
/// Returns a database error or `CorruptTiles` if the tile map fails to decode.
pub async fn find_room_by_slug(pool: &PgPool, slug: &str) -> Result<Option<RoomRecord>, RoomsError> {
    let row = sqlx::query_as::<_, RoomRow>(&format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE slug = $1"))
        .bind(slug)
        .fetch_optional(pool)
        .await?;
    row.map(record_from_row).transpose()
}

/// Fetch a room by id.
///
/// # Errors
///
/// Returns a database error or `CorruptTiles` if the tile map fails to decode.
pub async fn find_room_by_id(pool: &PgPool, id: Uuid) -> Result<Option<RoomRecord>, RoomsError> {
    let row = sqlx::query_as::<_, RoomRow>(&format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(record_from_row).transpose()
}

/// List all public rooms, newest first.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn list_public_rooms(pool: &PgPool) -> Result<Vec<RoomHit>, RoomsError> {
    let rows = sqlx::query_as::<_, (Uuid, String, String, bool)>(
        "SELECT id, slug, name, is_public FROM rooms WHERE is_public ORDER BY created_at DESC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(id, slug, name, is_public)| RoomHit { id, slug, name, is_public })
        .collect())
}

/// Case-insensitive substring search over public room names and their
/// owners' display names.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn search_public_rooms(pool: &PgPool, query: &str) -> Result<Vec<RoomHit>, RoomsError> {
    let pattern = format!("%{}%", escape_like(query));
    let rows = sqlx::query_as::<_, (Uuid, String, String, bool)>(
        r"SELECT r.id, r.slug, r.name, r.is_public
          FROM rooms r
          LEFT JOIN users u ON u.id = r.owner_id
          WHERE r.is_public
            AND (r.name ILIKE $1 ESCAPE '\' OR u.username ILIKE $1 ESCAPE '\')
          ORDER BY r.name ASC",
    )
    .bind(pattern)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|(id, slug, name, is_public)| RoomHit { id, slug, name, is_public })
        .collect())
}

/// Create the default canonical room (all-walkable square) if no room with
/// this slug exists yet, and return the persisted record either way.
///
/// # Errors
///
/// Returns a database error if the insert or re-read fails.
pub async fn create_default_room(
    pool: &PgPool,
    slug: &str,
    name: &str,
    side: u32,
) -> Result<RoomRecord, RoomsError> {
    let tiles = Grid::open(side, side).tiles().to_vec();
    let tiles_json = serde_json::to_value(&tiles).map_err(|_| RoomsError::CorruptTiles(Uuid::nil()))?;

    sqlx::query(
        "INSERT INTO rooms (id, slug, name, width, height, tiles, is_public)
         VALUES ($1, $2, $3, $4, $5, $6, true)
         ON CONFLICT (slug) DO NOTHING",
    )
    .bind(Uuid::new_v4())
    .bind(slug)
    .bind(name)
    .bind(side as i32)
    .bind(side as i32)
    .bind(&tiles_json)
    .execute(pool)
    .await?;

    find_room_by_slug(pool, slug)
        .await?
        .ok_or_else(|| RoomsError::BootstrapRace(slug.to_owned()))
}

/// Resolve a user's display name for discovery and `room_state` payloads.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn find_username(pool: &PgPool, id: Uuid) -> Result<Option<String>, RoomsError> {
    let row = sqlx::query_as::<_, (String,)>("SELECT username FROM users WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(username,)| username))
}

/// Stamp a participant's `last_seen_at` on successful handshake.
///
/// # Errors
///
/// Returns a database error if the update fails.
pub async fn touch_last_seen(pool: &PgPool, participant_id: Uuid) -> Result<(), RoomsError> {
    sqlx::query("UPDATE users SET last_seen_at = now() WHERE id = $1")
        .bind(participant_id)
        .execute(pool)
        .await?;
    Ok(())
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}
