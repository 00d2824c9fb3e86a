//! `ProjChat`: conversation sync engine for in-app project chat.
//!
//! [`sync`] keeps one consistent, ordered timeline per conversation while
//! merging optimistic local sends, push events and periodic history
//! fetches. [`backend`] defines the transport boundary and ships an
//! in-memory and a WebSocket relay implementation.

pub mod backend;
pub mod config;
pub mod sync;
