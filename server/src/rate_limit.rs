//! Per-socket command rate ceilings.
//!
//! DESIGN
//! ======
//! Sliding-window counters backed by `VecDeque<Instant>`, one limiter owned
//! by each connection task (no sharing, no locks). Two ceilings:
//! - Chat: 10 messages/sec
//! - Move: 20 walks/sec
//! Excess commands are dropped with `RATE_LIMITED`; the socket stays open.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

const CHAT_LIMIT: usize = 10;
const CHAT_WINDOW: Duration = Duration::from_secs(1);

const MOVE_LIMIT: usize = 20;
const MOVE_WINDOW: Duration = Duration::from_secs(1);

// =============================================================================
// ERROR TYPE
// =============================================================================

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("chat rate limit exceeded (max {CHAT_LIMIT}/sec)")]
    ChatExceeded,
    #[error("move rate limit exceeded (max {MOVE_LIMIT}/sec)")]
    MoveExceeded,
}

// =============================================================================
// LIMITER
// =============================================================================

/// Sliding-window limiter for one socket's chat and move commands.
#[derive(Debug, Default)]
pub struct CommandLimiter {
    chats: VecDeque<Instant>,
    moves: VecDeque<Instant>,
}

impl CommandLimiter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Check the chat ceiling, recording the command when allowed.
    pub fn check_chat(&mut self) -> Result<(), RateLimitError> {
        self.check_chat_at(Instant::now())
    }

    /// Check the move ceiling, recording the command when allowed.
    pub fn check_move(&mut self) -> Result<(), RateLimitError> {
        self.check_move_at(Instant::now())
    }

    /// Internal: check + record with explicit timestamp (for testing).
    fn check_chat_at(&mut self, now: Instant) -> Result<(), RateLimitError> {
        prune_window(&mut self.chats, now, CHAT_WINDOW);
        if self.chats.len() >= CHAT_LIMIT {
            return Err(RateLimitError::ChatExceeded);
        }
        self.chats.push_back(now);
        Ok(())
    }

    fn check_move_at(&mut self, now: Instant) -> Result<(), RateLimitError> {
        prune_window(&mut self.moves, now, MOVE_WINDOW);
        if self.moves.len() >= MOVE_LIMIT {
            return Err(RateLimitError::MoveExceeded);
        }
        self.moves.push_back(now);
        Ok(())
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn prune_window(deque: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&front) = deque.front() {
        if now.duration_since(front) > window {
            deque.pop_front();
        } else {
            break;
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
