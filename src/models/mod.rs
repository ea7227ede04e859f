//! Domain model module declarations.

pub mod record;
pub mod session;
