//! Accord Testkit - In-memory collaborators for exercising the state engine
//!
//! Provides a [`MemoryStore`] persistence service, a scriptable
//! [`MemoryFederation`] replication layer with fetch logging and failure
//! injection, and PDU fixtures. Nothing here is suitable for production; it
//! exists so resolution behavior can be driven deterministically from tests
//! and benches.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use accord_core::{
    AccordError, AccordResult, Branch, EventRef, Pdu, PduId, PduTip, RoomId, ServerId, StateKey,
    UserId,
};
use accord_state::{PersistenceService, ReplicationLayer, StateTree};

/// Build a state PDU targeting the shared fixture slot.
///
/// Graph links, depth, and power level start empty; tests poke the public
/// fields directly.
pub fn state_pdu(id: &str, origin: &str) -> Pdu {
    Pdu::new(
        PduId::from(id),
        ServerId::from(origin),
        RoomId::from("!ops:alpha.example"),
        "room.control",
        "",
        UserId::from(format!("@carol:{origin}")),
    )
}

/// Chain `pdu` onto `prev`: records the state link and bumps depth.
pub fn chained(mut pdu: Pdu, prev: &Pdu) -> Pdu {
    pdu.prev_state = Some(prev.reference());
    pdu.depth = prev.depth + 1;
    pdu
}

#[derive(Default)]
struct StoreInner {
    pdus: HashMap<EventRef, Pdu>,
    current: HashMap<StateKey, EventRef>,
    tips: HashMap<RoomId, Vec<PduTip>>,
    updates: u64,
}

/// In-memory [`PersistenceService`].
///
/// Tracks room tips forward-style (a newly stored PDU becomes a tip and
/// retires the tips it references) and answers the unresolved-tree query by
/// walking both state-ancestry chains and trimming their common suffix down
/// to one shared element.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<StoreInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    /// Store a PDU delivered through normal forward sync, updating the
    /// room's tip set.
    pub fn insert_pdu(&self, pdu: Pdu) {
        let inner = &mut *self.inner.lock();
        let room_tips = inner.tips.entry(pdu.room_id.clone()).or_default();
        room_tips.retain(|tip| !pdu.prev_events.contains(&tip.reference()));
        room_tips.push(PduTip {
            pdu_id: pdu.pdu_id.clone(),
            origin: pdu.origin.clone(),
            depth: pdu.depth,
        });
        inner.pdus.insert(pdu.reference(), pdu);
    }

    /// Store a PDU fetched for gap-filling; historical, so tips are left
    /// untouched.
    pub fn insert_outlier(&self, pdu: Pdu) {
        self.inner.lock().pdus.insert(pdu.reference(), pdu);
    }

    /// Seed the current-state record directly.
    pub fn seed_current(&self, key: StateKey, current: EventRef) {
        self.inner.lock().current.insert(key, current);
    }

    /// The current-state record for a slot, if any.
    pub fn current(&self, key: &StateKey) -> Option<EventRef> {
        self.inner.lock().current.get(key).cloned()
    }

    pub fn contains(&self, reference: &EventRef) -> bool {
        self.inner.lock().pdus.contains_key(reference)
    }

    /// How many times `update_current_state` has been called.
    pub fn update_count(&self) -> u64 {
        self.inner.lock().updates
    }

    fn walk_chain(inner: &StoreInner, start: &EventRef) -> Vec<Pdu> {
        let mut chain = Vec::new();
        let mut cursor = Some(start.clone());
        while let Some(reference) = cursor {
            let Some(pdu) = inner.pdus.get(&reference) else {
                break;
            };
            cursor = pdu.prev_state.clone();
            chain.push(pdu.clone());
        }
        chain
    }

    fn build_tree(&self, pdu: &Pdu) -> StateTree {
        let inner = self.inner.lock();

        let mut new_chain = vec![pdu.clone()];
        if let Some(prev) = &pdu.prev_state {
            new_chain.extend(Self::walk_chain(&inner, prev));
        }

        let Some(current_ref) = inner.current.get(&pdu.state_slot()) else {
            return StateTree {
                new_branch: Branch::new(new_chain),
                current_branch: Branch::default(),
            };
        };
        let mut current_chain = Self::walk_chain(&inner, current_ref);

        // Chains are single-parent, so shared elements form a common
        // suffix; keep exactly one shared element on each side.
        let mut shared = 0;
        while shared < new_chain.len() && shared < current_chain.len() {
            let n = &new_chain[new_chain.len() - 1 - shared];
            let c = &current_chain[current_chain.len() - 1 - shared];
            if n.reference() != c.reference() {
                break;
            }
            shared += 1;
        }
        if shared > 0 {
            new_chain.truncate(new_chain.len() - shared + 1);
            current_chain.truncate(current_chain.len() - shared + 1);
        }

        StateTree {
            new_branch: Branch::new(new_chain),
            current_branch: Branch::new(current_chain),
        }
    }
}

impl PersistenceService for MemoryStore {
    fn latest_pdus_in_room(
        &self,
        room: &RoomId,
    ) -> impl Future<Output = AccordResult<Vec<PduTip>>> + Send {
        let tips = self.inner.lock().tips.get(room).cloned().unwrap_or_default();
        async move { Ok(tips) }
    }

    fn current_state(
        &self,
        key: &StateKey,
    ) -> impl Future<Output = AccordResult<Option<EventRef>>> + Send {
        let current = self.inner.lock().current.get(key).cloned();
        async move { Ok(current) }
    }

    fn unresolved_state_tree(
        &self,
        pdu: &Pdu,
    ) -> impl Future<Output = AccordResult<StateTree>> + Send {
        let tree = self.build_tree(pdu);
        async move { Ok(tree) }
    }

    fn update_current_state(
        &self,
        key: &StateKey,
        winner: EventRef,
    ) -> impl Future<Output = AccordResult<()>> + Send {
        let inner = &mut *self.inner.lock();
        inner.updates += 1;
        inner.current.insert(key.clone(), winner);
        async move { Ok(()) }
    }
}

/// One request observed by [`MemoryFederation`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchRequest {
    pub destination: ServerId,
    pub origin: ServerId,
    pub pdu_id: PduId,
    pub outlier: bool,
}

#[derive(Default)]
struct FederationInner {
    remote: HashMap<EventRef, Pdu>,
    unreachable: HashSet<EventRef>,
    log: Vec<FetchRequest>,
}

/// Scriptable in-memory [`ReplicationLayer`].
///
/// Fetched PDUs are persisted into the backing store as outliers, matching
/// the replication contract. Every request is logged for assertions, and
/// individual PDUs can be made unreachable to exercise failure paths.
pub struct MemoryFederation {
    store: Arc<MemoryStore>,
    inner: Mutex<FederationInner>,
}

impl MemoryFederation {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        MemoryFederation {
            store,
            inner: Mutex::new(FederationInner::default()),
        }
    }

    /// Make a PDU available for fetching, clearing any earlier outage.
    pub fn host(&self, pdu: Pdu) {
        let mut inner = self.inner.lock();
        inner.unreachable.remove(&pdu.reference());
        inner.remote.insert(pdu.reference(), pdu);
    }

    /// Make a hosted PDU fail to fetch until [`host`](Self::host)ed again.
    pub fn set_unreachable(&self, reference: EventRef) {
        let mut inner = self.inner.lock();
        inner.remote.remove(&reference);
        inner.unreachable.insert(reference);
    }

    /// Every fetch observed so far.
    pub fn requests(&self) -> Vec<FetchRequest> {
        self.inner.lock().log.clone()
    }
}

impl ReplicationLayer for MemoryFederation {
    fn fetch_pdu(
        &self,
        destination: &ServerId,
        origin: &ServerId,
        pdu_id: &PduId,
        outlier: bool,
    ) -> impl Future<Output = AccordResult<Pdu>> + Send {
        let reference = EventRef::new(pdu_id.clone(), origin.clone());
        let result = {
            let mut inner = self.inner.lock();
            inner.log.push(FetchRequest {
                destination: destination.clone(),
                origin: origin.clone(),
                pdu_id: pdu_id.clone(),
                outlier,
            });

            if inner.unreachable.contains(&reference) {
                Err(AccordError::Replication(format!(
                    "{destination} has no copy of {reference}"
                )))
            } else {
                inner.remote.get(&reference).cloned().ok_or_else(|| {
                    AccordError::Replication(format!("{reference} is not hosted anywhere"))
                })
            }
        };

        let result = result.map(|pdu| {
            if outlier {
                self.store.insert_outlier(pdu.clone());
            } else {
                self.store.insert_pdu(pdu.clone());
            }
            pdu
        });

        async move { result }
    }
}

/// A replication layer whose fetches never complete; drives deadline tests.
#[derive(Default)]
pub struct HangingFederation;

impl ReplicationLayer for HangingFederation {
    fn fetch_pdu(
        &self,
        _destination: &ServerId,
        _origin: &ServerId,
        _pdu_id: &PduId,
        _outlier: bool,
    ) -> impl Future<Output = AccordResult<Pdu>> + Send {
        std::future::pending()
    }
}
