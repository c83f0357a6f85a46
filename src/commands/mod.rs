//! CLI command handlers.

pub mod auth;
pub mod process;
