//! Accord Core - Fundamental types for federated state resolution
//!
//! This crate defines the core types used throughout Accord:
//! - Identifiers (RoomId, ServerId, UserId, PduId) and event references
//! - The PDU record and the state-slot key
//! - Ancestry branches
//! - Error taxonomy

pub mod error;
pub mod id;
pub mod pdu;

pub use error::*;
pub use id::*;
pub use pdu::*;
