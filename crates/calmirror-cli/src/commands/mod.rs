//! Command handlers

pub mod config;
pub mod query;
pub mod status;
pub mod sync;
pub mod watch;
