//! Error types for Accord

use thiserror::Error;

use crate::{PduId, ServerId};

/// Core Accord errors
#[derive(Error, Debug)]
pub enum AccordError {
    // Admission errors
    #[error("admission rejected: {0}")]
    AdmissionRejected(String),

    // Collaborator errors
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("replication error: {0}")]
    Replication(String),

    // Gap-fill errors
    #[error("fetch of {pdu_id} from {destination} timed out")]
    FetchTimeout {
        destination: ServerId,
        pdu_id: PduId,
    },

    #[error("ancestry of {0} is incomplete and names no earlier state")]
    AncestryExhausted(PduId),

    #[error("resolution exceeded {0} ancestor fetch rounds")]
    FetchRoundsExceeded(u32),

    // Invariant violations
    #[error("state graph inconsistency: {0}")]
    Inconsistent(&'static str),
}

impl AccordError {
    /// True for failures that signal a defect in branch construction or
    /// tiebreak invariants rather than an ordinary rejection. These should
    /// alert operators, not be silently retried.
    pub fn is_fatal(&self) -> bool {
        matches!(self, AccordError::Inconsistent(_))
    }
}

/// Result type for Accord operations
pub type AccordResult<T> = Result<T, AccordError>;
