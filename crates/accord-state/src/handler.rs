//! State handler - admission entry points
//!
//! Composes the keyed lock, the conflict resolver, and the persistence seam.
//! `handle_new_event` admits locally authored events; `handle_new_state`
//! admits replicated PDUs. Both serialize per state slot.

use std::future::Future;
use std::sync::Arc;

use accord_core::{AccordResult, EventRef, Pdu, PduTip, ServerId};

use crate::{
    ConflictResolver, KeyedLock, PersistenceService, ReplicationLayer, ResolutionStats,
    ResolverConfig,
};

/// Entry point for state conflict resolution.
pub struct StateHandler<P, R> {
    server_name: ServerId,
    persistence: Arc<P>,
    resolver: ConflictResolver<P, R>,
    locks: KeyedLock,
}

impl<P, R> StateHandler<P, R>
where
    P: PersistenceService,
    R: ReplicationLayer,
{
    pub fn new(server_name: ServerId, persistence: Arc<P>, replication: Arc<R>) -> Self {
        Self::with_config(
            server_name,
            persistence,
            replication,
            ResolverConfig::default(),
        )
    }

    pub fn with_config(
        server_name: ServerId,
        persistence: Arc<P>,
        replication: Arc<R>,
        config: ResolverConfig,
    ) -> Self {
        StateHandler {
            server_name,
            resolver: ConflictResolver::new(Arc::clone(&persistence), replication, config),
            persistence,
            locks: KeyedLock::new(),
        }
    }

    /// Admit a locally authored, not-yet-persisted event.
    ///
    /// Fills the draft's graph links (`prev_events`, `depth`, `prev_state`)
    /// from the store, then runs `admit` - the caller's room-level
    /// authorization hook - and records the draft as current state only if
    /// it accepts. A rejection propagates with nothing persisted.
    pub async fn handle_new_event<F, Fut>(&self, draft: &mut Pdu, admit: F) -> AccordResult<()>
    where
        F: FnOnce(Pdu) -> Fut,
        Fut: Future<Output = AccordResult<()>>,
    {
        let key = draft.state_slot();
        let _guard = self.locks.acquire(key.clone()).await;

        let tips = self.persistence.latest_pdus_in_room(&draft.room_id).await?;
        draft.prev_events = tips.iter().map(PduTip::reference).collect();
        draft.depth = tips.iter().map(|t| t.depth).max().map_or(0, |d| d + 1);
        draft.prev_state = self.persistence.current_state(&key).await?;

        admit(draft.clone()).await?;

        tracing::debug!("admitted local event {} for {:?}", draft.pdu_id, key);
        self.persistence
            .update_current_state(
                &key,
                EventRef::new(draft.pdu_id.clone(), self.server_name.clone()),
            )
            .await
    }

    /// Apply conflict resolution to a replicated PDU.
    ///
    /// Call this for every new state PDU, whether or not a conflict is
    /// visible; it is safe under concurrent calls for the same slot. Returns
    /// true iff the PDU is (or becomes) the slot's current state.
    pub async fn handle_new_state(&self, pdu: &Pdu) -> AccordResult<bool> {
        self.handle_new_state_with(pdu, |_| async {}).await
    }

    /// Like [`handle_new_state`](Self::handle_new_state), additionally
    /// invoking `on_win` when the PDU became the winning state.
    pub async fn handle_new_state_with<F, Fut>(&self, pdu: &Pdu, on_win: F) -> AccordResult<bool>
    where
        F: FnOnce(Pdu) -> Fut,
        Fut: Future<Output = ()>,
    {
        let _guard = self.locks.acquire(pdu.state_slot()).await;

        let new_wins = self.resolver.resolve(pdu).await?;
        if new_wins {
            on_win(pdu.clone()).await;
        }

        Ok(new_wins)
    }

    /// Snapshot of the resolver's verdict counters.
    pub fn stats(&self) -> ResolutionStats {
        self.resolver.stats()
    }
}
