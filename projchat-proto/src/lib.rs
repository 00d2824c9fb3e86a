//! Shared protocol definitions for the `ProjChat` wire format.

pub mod message;
pub mod relay;
pub mod timestamp;
