//! Pulse backfill crate - offline replay of agent transcripts.
//!
//! Walks `*.jsonl` transcript files, pairs tool calls with their results,
//! classifies each pair and forwards the activities the store does not hold
//! yet. Per-file line offsets are persisted so a run resumes where the last
//! one stopped.

pub mod dedup;
pub mod discovery;
pub mod scanner;
pub mod state;
pub mod transcript;

pub use scanner::{ScanOptions, ScanReport, Scanner};
pub use state::BackfillState;
