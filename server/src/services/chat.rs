//! Chat persistence service — insert with author snapshots, history fetch.
//!
//! DESIGN
//! ======
//! Author name and body color are captured at insert time and never
//! back-filled, so history renders with the avatar the author had when the
//! message was sent. Only chat is durable; movement is not.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;
use wire::{AvatarConfig, ChatMessage};

/// Insert one message and return the wire-ready record with the assigned
/// id and database timestamp.
///
/// # Errors
///
/// Returns a database error if the insert fails; the caller drops the
/// message in that case.
pub async fn insert_message(
    pool: &PgPool,
    room_id: Uuid,
    author_id: Uuid,
    author_name: &str,
    author_color: &str,
    content: &str,
) -> Result<ChatMessage, sqlx::Error> {
    let id = Uuid::new_v4();
    let (created_at,) = sqlx::query_as::<_, (OffsetDateTime,)>(
        "INSERT INTO messages (id, room_id, author_id, author_name, author_color, content)
         VALUES ($1, $2, $3, $4, $5, $6)
         RETURNING created_at",
    )
    .bind(id)
    .bind(room_id)
    .bind(author_id)
    .bind(author_name)
    .bind(author_color)
    .bind(content)
    .fetch_one(pool)
    .await?;

    Ok(ChatMessage {
        id,
        room_id,
        agent_id: Some(author_id),
        agent_name: author_name.to_owned(),
        avatar_config: AvatarConfig { body_color: author_color.to_owned() },
        content: content.to_owned(),
        timestamp: created_at,
    })
}

/// Fetch the most recent messages for a room, newest first. The registry
/// reverses them into chronological order when rehydrating an engine.
///
/// # Errors
///
/// Returns a database error if the query fails.
pub async fn recent_messages(pool: &PgPool, room_id: Uuid, limit: i64) -> Result<Vec<ChatMessage>, sqlx::Error> {
    let rows = sqlx::query_as::<_, (Uuid, Uuid, Option<Uuid>, String, String, String, OffsetDateTime)>(
        "SELECT id, room_id, author_id, author_name, author_color, content, created_at
         FROM messages
         WHERE room_id = $1
         ORDER BY created_at DESC, id DESC
         LIMIT $2",
    )
    .bind(room_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|(id, room_id, author_id, name, color, content, created_at)| ChatMessage {
            id,
            room_id,
            agent_id: author_id,
            agent_name: name,
            avatar_config: AvatarConfig { body_color: color },
            content,
            timestamp: created_at,
        })
        .collect())
}
