//! Session and message state.
//!
//! [`SessionManager`] owns the session lifecycle (get-or-create, status
//! transitions, config merges) on top of a [`StateStore`]. The SQLite store
//! enforces at most one active session per `(channel, conversation)` with a
//! partial unique index and deletes messages together with their session.
//!
//! The store does not coordinate concurrent writes to the same session;
//! callers process one message per session at a time.

pub mod error;
pub mod manager;
pub mod sqlite;
pub mod store;
pub mod types;

pub use {
    error::SessionError,
    manager::SessionManager,
    sqlite::{SqliteStateStore, StateConfig},
    store::StateStore,
    types::{
        Message, MessageRole, NewMessage, NewSession, Session, SessionFilter, SessionStatus,
    },
};
