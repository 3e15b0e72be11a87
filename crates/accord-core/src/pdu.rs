//! PDU definitions
//!
//! The PDU (persistent data unit) is the replicated event record this
//! system reasons about. State-carrying PDUs compete for a state slot,
//! identified by a [`StateKey`]; conflicting ancestry chains are walked as
//! [`Branch`]es.

use bytes::Bytes;

use crate::{EventRef, PduId, RoomId, ServerId, UserId};

/// Identity of one logical state slot within a room.
///
/// At most one PDU is current for a given key at any instant; the resolver
/// enforces this, storage does not.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StateKey {
    pub room: RoomId,
    pub pdu_type: String,
    pub state_key: String,
}

impl StateKey {
    pub fn new(room: RoomId, pdu_type: impl Into<String>, state_key: impl Into<String>) -> Self {
        StateKey {
            room,
            pdu_type: pdu_type.into(),
            state_key: state_key.into(),
        }
    }
}

/// The replicated event record.
///
/// Immutable once constructed; ownership transfers to persistence when the
/// PDU is admitted. `depth` is the distance from the room's root and drives
/// both causal ordering and gap-fill side selection. `content` is the opaque
/// application payload; the resolver never inspects it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pdu {
    pub pdu_id: PduId,
    pub origin: ServerId,
    pub room_id: RoomId,
    pub pdu_type: String,
    pub state_key: String,
    pub depth: u64,
    pub sender: UserId,
    pub power_level: i64,
    pub content: Bytes,
    /// Reference to the state value this PDU supersedes, if any.
    pub prev_state: Option<EventRef>,
    /// Graph tips this PDU was authored on top of.
    pub prev_events: Vec<EventRef>,
}

impl Pdu {
    /// Create a PDU with empty payload and no graph links yet.
    pub fn new(
        pdu_id: PduId,
        origin: ServerId,
        room_id: RoomId,
        pdu_type: impl Into<String>,
        state_key: impl Into<String>,
        sender: UserId,
    ) -> Self {
        Pdu {
            pdu_id,
            origin,
            room_id,
            pdu_type: pdu_type.into(),
            state_key: state_key.into(),
            depth: 0,
            sender,
            power_level: 0,
            content: Bytes::new(),
            prev_state: None,
            prev_events: Vec::new(),
        }
    }

    /// The state slot this PDU targets.
    pub fn state_slot(&self) -> StateKey {
        StateKey {
            room: self.room_id.clone(),
            pdu_type: self.pdu_type.clone(),
            state_key: self.state_key.clone(),
        }
    }

    /// Globally unique reference to this PDU.
    #[inline]
    pub fn reference(&self) -> EventRef {
        EventRef::new(self.pdu_id.clone(), self.origin.clone())
    }
}

/// Summary row for a room's latest PDUs, as reported by persistence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PduTip {
    pub pdu_id: PduId,
    pub origin: ServerId,
    pub depth: u64,
}

impl PduTip {
    #[inline]
    pub fn reference(&self) -> EventRef {
        EventRef::new(self.pdu_id.clone(), self.origin.clone())
    }
}

/// One side's ancestry chain for a state slot, ordered newest (index 0) to
/// oldest (last).
///
/// By construction the walk stops either at a PDU shared with the other
/// branch or at the oldest PDU persistence currently holds.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Branch(Vec<Pdu>);

impl Branch {
    pub fn new(pdus: Vec<Pdu>) -> Self {
        Branch(pdus)
    }

    /// The newest element, the PDU this branch argues for.
    #[inline]
    pub fn tip(&self) -> Option<&Pdu> {
        self.0.first()
    }

    /// The oldest element persistence could walk back to.
    #[inline]
    pub fn oldest(&self) -> Option<&Pdu> {
        self.0.last()
    }

    /// All elements above the shared tail.
    ///
    /// Only meaningful once the branches are known to converge; the last
    /// element is then the common ancestor and carries no claim of its own.
    pub fn contested(&self) -> &[Pdu] {
        match self.0.split_last() {
            Some((_, rest)) => rest,
            None => &[],
        }
    }

    #[inline]
    pub fn pdus(&self) -> &[Pdu] {
        &self.0
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<Pdu>> for Branch {
    fn from(pdus: Vec<Pdu>) -> Self {
        Branch(pdus)
    }
}
