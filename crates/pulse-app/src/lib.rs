//! Shared pieces of the `pulse-relay` and `pulse-backfill` binaries.

pub mod cli;
pub mod logging;
