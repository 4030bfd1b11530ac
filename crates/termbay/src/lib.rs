//! Termbay library.
//!
//! Provisions ephemeral containerized development sessions, each exposing a
//! primary and a manual terminal on a dedicated host port pair.

pub mod container;
pub mod db;
pub mod events;
pub mod git;
pub mod ports;
pub mod session;
pub mod settings;
pub mod watcher;
