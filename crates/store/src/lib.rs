//! Durable storage for skill invocations.
//!
//! The orchestrator only talks to the traits in [`traits`]. Two backends
//! implement all of them: [`MemoryStore`] (process-local, with hooks for
//! tests) and [`JsonlStore`] (append-only files, shared by every process on
//! one host so an abort requested from one process reaches another).

pub mod jsonl;
pub mod memory;
mod tables;
pub mod traits;

pub use jsonl::JsonlStore;
pub use memory::MemoryStore;
pub use traits::{AbortStore, InvocationStore, LedgerStore, ToolCallStore};
