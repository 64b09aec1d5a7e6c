//! Restriction evaluation and screen-time accounting.
//!
//! The engine runs a single evaluation loop: once a second it advances the
//! usage counters and resolves the active restriction from the current
//! settings, blocklist, foreground app and inactivity clock; decisions are
//! applied through the enforcement surface and mirrored to the parent.

pub mod blocklist;
pub mod resolver;
pub mod runtime;
pub mod schedule;
pub mod settings;
pub mod sink;
pub mod sync;
pub mod usage;

pub use runtime::{Engine, EngineEvent};
