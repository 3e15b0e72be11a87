//! Accord State Engine - Conflict resolution for federated room state
//!
//! This crate implements the state resolution core:
//! - Per-slot asynchronous mutual exclusion
//! - Admission of locally authored events into the state graph
//! - Branch-walk conflict resolution with on-demand ancestor backfill
//! - The ordered deterministic tiebreak pipeline

pub mod handler;
pub mod lock;
pub mod resolve;
pub mod service;

pub use handler::*;
pub use lock::*;
pub use resolve::*;
pub use service::*;
