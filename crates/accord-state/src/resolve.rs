//! Conflict resolution
//!
//! Given a replicated PDU that targets a state slot, decide whether it
//! supersedes the slot's current value. The resolver walks both ancestry
//! branches back to a common ancestor, backfilling missing ancestors over
//! replication when the branches have not yet met, and applies an ordered
//! tiebreak once they do. Every participant running this against the same
//! inputs reaches the same verdict.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use accord_core::{AccordError, AccordResult, EventRef, Pdu, ServerId};

use crate::{PersistenceService, ReplicationLayer, StateTree};

/// Resolver tuning knobs.
#[derive(Clone, Debug)]
pub struct ResolverConfig {
    /// Upper bound on ancestor fetch rounds for a single resolution. Each
    /// successful fetch strictly extends one branch toward the room root, so
    /// this bounds work on rooms with long divergent histories.
    pub max_fetch_rounds: u32,
    /// Deadline for each individual replication fetch.
    pub fetch_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            max_fetch_rounds: 32,
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

/// Counters over resolver verdicts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResolutionStats {
    pub resolutions: u64,
    pub first_writes: u64,
    pub direct_clobbers: u64,
    pub power_level_verdicts: u64,
    pub chain_length_verdicts: u64,
    pub digest_verdicts: u64,
    pub ancestor_fetches: u64,
}

/// Which rule decided a resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecidedBy {
    /// The slot had no current value.
    FirstWrite,
    /// The current value is the new PDU's direct ancestor.
    DirectClobber,
    /// Maximum power level across the contested elements.
    PowerLevel,
    /// Contested chain length.
    ChainLength,
    /// Byte order of the chain digests.
    Digest,
}

/// Outcome of a finished resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Verdict {
    pub new_wins: bool,
    pub decided_by: DecidedBy,
}

impl Verdict {
    fn win(decided_by: DecidedBy) -> Self {
        Verdict {
            new_wins: true,
            decided_by,
        }
    }
}

/// One examination of the state tree either decides, or names the ancestor
/// that must be fetched before the branches can meet.
enum Step {
    Decided(Verdict),
    NeedAncestor {
        destination: ServerId,
        target: EventRef,
    },
}

/// The branch-walk resolver.
///
/// Holds no per-slot state of its own; callers must serialize invocations
/// per slot (the handler does this with its keyed lock).
pub struct ConflictResolver<P, R> {
    persistence: Arc<P>,
    replication: Arc<R>,
    config: ResolverConfig,
    stats: Mutex<ResolutionStats>,
}

impl<P, R> ConflictResolver<P, R>
where
    P: PersistenceService,
    R: ReplicationLayer,
{
    pub fn new(persistence: Arc<P>, replication: Arc<R>, config: ResolverConfig) -> Self {
        ConflictResolver {
            persistence,
            replication,
            config,
            stats: Mutex::new(ResolutionStats::default()),
        }
    }

    /// Decide whether `new_pdu` supersedes the current state of its slot.
    ///
    /// Re-queries the state tree after every ancestor fetch, since each
    /// fetch may let persistence walk the branches further back. The loop is
    /// bounded by [`ResolverConfig::max_fetch_rounds`].
    pub async fn resolve(&self, new_pdu: &Pdu) -> AccordResult<bool> {
        for round in 0..self.config.max_fetch_rounds {
            let tree = self.persistence.unresolved_state_tree(new_pdu).await?;

            match self.examine(&tree)? {
                Step::Decided(verdict) => {
                    self.record(verdict);
                    tracing::debug!(
                        "resolved {}: new_wins={} via {:?}",
                        new_pdu.pdu_id,
                        verdict.new_wins,
                        verdict.decided_by
                    );
                    return Ok(verdict.new_wins);
                }
                Step::NeedAncestor {
                    destination,
                    target,
                } => {
                    tracing::warn!(
                        "branch gap while resolving {}: fetching {} from {} (round {})",
                        new_pdu.pdu_id,
                        target,
                        destination,
                        round
                    );
                    self.fetch_ancestor(&destination, &target).await?;
                    self.stats.lock().ancestor_fetches += 1;
                }
            }
        }

        Err(AccordError::FetchRoundsExceeded(self.config.max_fetch_rounds))
    }

    /// Snapshot of the verdict counters.
    pub fn stats(&self) -> ResolutionStats {
        self.stats.lock().clone()
    }

    fn examine(&self, tree: &StateTree) -> AccordResult<Step> {
        let StateTree {
            new_branch,
            current_branch,
        } = tree;

        let Some(current_oldest) = current_branch.oldest() else {
            // The slot has no current value; the first writer always wins.
            return Ok(Step::Decided(Verdict::win(DecidedBy::FirstWrite)));
        };

        let Some(new_oldest) = new_branch.oldest() else {
            return Err(AccordError::Inconsistent("new branch is empty"));
        };

        if new_oldest.reference() == current_oldest.reference() {
            // The branches converged on a common ancestor.
            if current_branch.len() == 1 {
                // The current value is itself that ancestor; a direct
                // successor clobbers its predecessor without a tiebreak.
                return Ok(Step::Decided(Verdict::win(DecidedBy::DirectClobber)));
            }

            let verdict = tiebreak(new_branch.contested(), current_branch.contested())?;
            return Ok(Step::Decided(verdict));
        }

        // Diverged: at least one side is missing history. The branch whose
        // oldest element sits deeper walked back the least for its depth, so
        // its predecessor is the gap to fill. Depth ties select the new
        // branch.
        let anchor = if current_oldest.depth > new_oldest.depth {
            current_oldest
        } else {
            new_oldest
        };

        let Some(target) = anchor.prev_state.clone() else {
            return Err(AccordError::AncestryExhausted(anchor.pdu_id.clone()));
        };

        Ok(Step::NeedAncestor {
            destination: anchor.origin.clone(),
            target,
        })
    }

    async fn fetch_ancestor(
        &self,
        destination: &ServerId,
        target: &EventRef,
    ) -> AccordResult<()> {
        let fetch = self
            .replication
            .fetch_pdu(destination, &target.origin, &target.pdu_id, true);

        match tokio::time::timeout(self.config.fetch_timeout, fetch).await {
            Ok(fetched) => fetched.map(|_| ()),
            Err(_) => Err(AccordError::FetchTimeout {
                destination: destination.clone(),
                pdu_id: target.pdu_id.clone(),
            }),
        }
    }

    fn record(&self, verdict: Verdict) {
        let mut stats = self.stats.lock();
        stats.resolutions += 1;
        match verdict.decided_by {
            DecidedBy::FirstWrite => stats.first_writes += 1,
            DecidedBy::DirectClobber => stats.direct_clobbers += 1,
            DecidedBy::PowerLevel => stats.power_level_verdicts += 1,
            DecidedBy::ChainLength => stats.chain_length_verdicts += 1,
            DecidedBy::Digest => stats.digest_verdicts += 1,
        }
    }
}

/// Apply the ordered comparators to the contested portions of two branches
/// (shared tail already excluded). The first comparator producing an unequal
/// pair decides; the new branch wins iff its score is strictly greater.
pub fn tiebreak(new: &[Pdu], current: &[Pdu]) -> AccordResult<Verdict> {
    let (new_power, current_power) = (max_power(new), max_power(current));
    if new_power != current_power {
        return Ok(Verdict {
            new_wins: new_power > current_power,
            decided_by: DecidedBy::PowerLevel,
        });
    }

    if new.len() != current.len() {
        return Ok(Verdict {
            new_wins: new.len() > current.len(),
            decided_by: DecidedBy::ChainLength,
        });
    }

    let (new_digest, current_digest) = (chain_digest(new), chain_digest(current));
    if new_digest != current_digest {
        return Ok(Verdict {
            new_wins: new_digest > current_digest,
            decided_by: DecidedBy::Digest,
        });
    }

    // Distinct concurrent writes can never produce byte-identical contested
    // chains; reaching this means branch construction is broken.
    tracing::error!("tiebreak could not distinguish two branches");
    Err(AccordError::Inconsistent("indistinguishable branches"))
}

/// The strongest authority seen along a contested chain. An empty chain
/// scores `i64::MIN`: a branch that is itself the common ancestor carries no
/// claim of its own.
fn max_power(branch: &[Pdu]) -> i64 {
    branch
        .iter()
        .map(|p| p.power_level)
        .max()
        .unwrap_or(i64::MIN)
}

/// Deterministic digest over a chain's (pdu_id, origin) pairs in branch
/// order. Compared as byte strings this totally orders any two distinct
/// chains, which makes it the tiebreak of last resort.
pub fn chain_digest(branch: &[Pdu]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for pdu in branch {
        hasher.update(pdu.pdu_id.as_str().as_bytes());
        hasher.update(pdu.origin.as_str().as_bytes());
    }
    hasher.finalize().into()
}
