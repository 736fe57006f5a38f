//! Database schemas for Bailiff
//!
//! Defines MongoDB document structures for the strike ledger and for
//! batch operation recovery points.

mod operation;
mod strike;

pub use operation::{
    CompletedOperation, OperationKind, OperationMetadata, OperationRecord, RecoveryDoc,
    OPERATION_COLLECTION,
};
pub use strike::{StrikeDoc, StrikeEvent, Warning, SYSTEM_MODERATOR, STRIKE_COLLECTION};
