//! Session orchestration modules.
//!
//! Covers the attach decision, idle teardown, orphan recovery at startup,
//! and the live-session supervisor that ties them to agent processes.

pub mod idle;
pub mod idle_monitor;
pub mod process_tree;
pub mod reaper;
pub mod resolver;
pub mod supervisor;
