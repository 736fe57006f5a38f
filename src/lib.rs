//! Bailiff - strike ledger and escalating enforcement for community moderation
//!
//! Moderators record strikes against members through chat commands. The
//! strike total maps to an enforcement tier which is mirrored onto the
//! member's roles.
//!
//! ## Components
//!
//! - **Ledger**: atomic, clamped strike deltas with an audit history
//! - **Guard**: event deduplication, per-command cooldowns, in-flight tracking
//! - **Confirm**: reaction-driven approval and selection prompts
//! - **Batch**: season reset, strike decay, role resync, bulk penalties
//! - **Recovery**: heartbeats and resumption of interrupted batch operations

pub mod batch;
pub mod chat;
pub mod commands;
pub mod config;
pub mod confirm;
pub mod db;
pub mod gamestats;
pub mod guard;
pub mod ledger;
pub mod recovery;
pub mod roles;
pub mod server;
pub mod store;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{BailiffError, Result};
