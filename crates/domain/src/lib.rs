//! Shared types for the skill invocation orchestrator.
//!
//! Everything that crosses a crate boundary lives here: engine events,
//! ledger and tool-call records, token usage, live output events,
//! configuration, errors, and structured trace events.

pub mod config;
pub mod error;
pub mod event;
pub mod invocation;
pub mod message;
pub mod stream;
pub mod trace;
pub mod usage;
