//! Domain services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own persistence and crypto concerns so the connection
//! handler, engines, and registry stay focused on protocol and state.

pub mod chat;
pub mod rooms;
pub mod token;
