//! `ProjChat` relay server library.
//!
//! A development chat server: persists messages per project, answers
//! history requests, and pushes new messages to subscribed clients over
//! WebSocket. Exposed as a library for tests and embedding.

pub mod config;
pub mod relay;
pub mod store;
