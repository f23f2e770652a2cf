//! Skill invocation orchestrator.
//!
//! Drives one execution-engine event stream per invocation into live
//! output, a periodically persisted message ledger, tool-call tracking and
//! a single terminal commit. The `skillrun` binary wraps it in a CLI.

pub mod bootstrap;
pub mod cli;
pub mod runtime;
pub mod state;
