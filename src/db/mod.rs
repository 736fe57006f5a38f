//! MongoDB access layer
//!
//! Typed collections plus the document schemas for the strike ledger and
//! batch operation recovery points.

pub mod mongo;
pub mod schemas;

pub use mongo::{is_duplicate_key, IntoIndexes, MongoClient, MongoCollection};
