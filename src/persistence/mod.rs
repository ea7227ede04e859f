//! Persistence layer modules.
//!
//! Everything here is flat files: the crash-recovery record list, its
//! debounced writer, and the per-folder transcript and handoff store.

pub mod debounce;
pub mod history;
pub mod record_store;
