//! Boundary traits for the storage and federation collaborators
//!
//! The engine consumes these seams; it never owns durable storage or a
//! network stack. Methods return `Send` futures so handler tasks can run on
//! a multi-threaded runtime.

use std::future::Future;

use accord_core::{AccordResult, Branch, EventRef, Pdu, PduId, PduTip, RoomId, ServerId, StateKey};

/// The divergent history persistence holds for a contested slot: one
/// ancestry chain for the incoming PDU and one for the existing current
/// state, each walked back as far as locally available.
#[derive(Clone, Debug, Default)]
pub struct StateTree {
    pub new_branch: Branch,
    pub current_branch: Branch,
}

/// Durable storage of PDUs and current state, consumed by the engine.
pub trait PersistenceService: Send + Sync {
    /// The latest known PDU tips in a room.
    fn latest_pdus_in_room(
        &self,
        room: &RoomId,
    ) -> impl Future<Output = AccordResult<Vec<PduTip>>> + Send;

    /// The presently-winning PDU for a slot, if any.
    fn current_state(
        &self,
        key: &StateKey,
    ) -> impl Future<Output = AccordResult<Option<EventRef>>> + Send;

    /// Both ancestry chains for the slot `pdu` targets, walked back until a
    /// shared element or local knowledge runs out. An empty current branch
    /// means the slot has no current value.
    fn unresolved_state_tree(
        &self,
        pdu: &Pdu,
    ) -> impl Future<Output = AccordResult<StateTree>> + Send;

    /// Record `winner` as the current state for `key`.
    fn update_current_state(
        &self,
        key: &StateKey,
        winner: EventRef,
    ) -> impl Future<Output = AccordResult<()>> + Send;
}

/// The federation transport, consumed for gap-filling only.
pub trait ReplicationLayer: Send + Sync {
    /// Fetch the PDU minted as `pdu_id` by `origin` from `destination`, and
    /// persist it locally. `outlier` marks a fetch that completes local
    /// ancestry knowledge rather than normal forward delivery.
    fn fetch_pdu(
        &self,
        destination: &ServerId,
        origin: &ServerId,
        pdu_id: &PduId,
        outlier: bool,
    ) -> impl Future<Output = AccordResult<Pdu>> + Send;
}
