//! Conflict detection and deterministic resolution
//!
//! `reconcile` only reads: it compares the local copy with an incoming version
//! and returns what to commit together with the audit record for whatever lost.
//! `settle` commits that outcome, guarded against writes that landed meanwhile.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::merge::merge_payloads;
use super::ResolveError;
use crate::crypto::{ContentHash, ShardId};
use crate::storage::{ConflictRecord, MergeMode, ResolutionStrategy, Shard, ShardStore};
use crate::unix_millis;

/// Proposed way to settle two differing versions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    LastWriteWins,
    Merged,
    /// Versions disagree on how their group merges; needs operator review
    Unresolved,
}

/// Result of comparing an incoming version against the local copy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictCheck {
    /// Nothing held locally under that id
    Absent,
    /// Same content as the local copy
    Identical,
    /// Additive group only: the incoming version was derived from the local one
    FastForward,
    /// Additive group only: the local version was derived from the incoming one
    Subsumed,
    Conflict(ConflictResolution),
}

/// Outcome of last-write-wins over a set of versions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    pub winner: Shard,
    /// Distinct losing versions, in canonical order
    pub discarded: Vec<Shard>,
}

/// What the caller should commit after reconciling an incoming version
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciled {
    /// Local copy `held` stands; `record` is set when the incoming version lost a conflict
    Keep {
        held: ContentHash,
        record: Option<ConflictRecord>,
    },
    /// Commit `shard` over the local copy hashed `base` (`None` if there was none);
    /// `record` is the audit entry, if anything was discarded
    Commit {
        shard: Shard,
        base: Option<ContentHash>,
        record: Option<ConflictRecord>,
    },
}

/// What the store holds after settling an incoming version.
/// `resolved` is set when a conflict was settled and audited on the way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settled {
    /// A new version with this hash was committed
    Committed { hash: ContentHash, resolved: bool },
    /// The local version with this hash stands
    Kept { hash: ContentHash, resolved: bool },
}

impl Settled {
    pub fn held(&self) -> ContentHash {
        match self {
            Settled::Committed { hash, .. } | Settled::Kept { hash, .. } => *hash,
        }
    }

    pub fn resolved(&self) -> bool {
        match self {
            Settled::Committed { resolved, .. } | Settled::Kept { resolved, .. } => *resolved,
        }
    }
}

/// Resolution reruns at most this often when local writes keep racing it
const SETTLE_ATTEMPTS: usize = 8;

// Total order used for last-write-wins: timestamp, then content hash bytes.
fn lww_order(a: &Shard, b: &Shard) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.hash.cmp(&b.hash))
}

pub struct ConflictResolver {
    store: Arc<ShardStore>,
}

impl ConflictResolver {
    pub fn new(store: Arc<ShardStore>) -> Self {
        Self { store }
    }

    /// Compare an incoming version with the local shard `local_id`
    pub fn detect_conflict(&self, local_id: &ShardId, incoming: &Shard) -> Result<ConflictCheck, ResolveError> {
        let Some(local) = self.store.find(local_id)? else {
            return Ok(ConflictCheck::Absent);
        };
        Ok(Self::classify(&local, incoming, self.store.group_mode(&local.group.id)?))
    }

    fn classify(local: &Shard, incoming: &Shard, declared: Option<MergeMode>) -> ConflictCheck {
        if local.group.id != incoming.group.id {
            return ConflictCheck::Absent;
        }
        if local.hash == incoming.hash {
            return ConflictCheck::Identical;
        }

        let mode = declared.unwrap_or(local.group.mode);
        if incoming.group.mode != mode || local.group.mode != mode {
            return ConflictCheck::Conflict(ConflictResolution::Unresolved);
        }

        match mode {
            MergeMode::Overwrite => ConflictCheck::Conflict(ConflictResolution::LastWriteWins),
            MergeMode::Additive if incoming.descends_from(local) => ConflictCheck::FastForward,
            MergeMode::Additive if local.descends_from(incoming) => ConflictCheck::Subsumed,
            MergeMode::Additive => ConflictCheck::Conflict(ConflictResolution::Merged),
        }
    }

    /// Last-write-wins over overwrite-mode versions. Independent of input order.
    pub fn resolve_conflicts(&self, versions: &[Shard]) -> Result<Resolved, ResolveError> {
        resolve_last_write_wins(versions)
    }

    /// Merge additive-mode versions of one shard into a new version
    pub fn merge_shards(&self, shards: &[Shard]) -> Result<Shard, ResolveError> {
        merge_additive(shards)
    }

    /// Decide what to commit for `incoming`. Invalid shards never get this far.
    pub fn reconcile(&self, incoming: &Shard) -> Result<Reconciled, ResolveError> {
        let Some(local) = self.store.find(&incoming.id)? else {
            return Ok(Reconciled::Commit {
                shard: incoming.clone(),
                base: None,
                record: None,
            });
        };
        let base = Some(local.hash);

        // A corrupt local copy is never a contender
        if !local.is_valid() {
            warn!("Replacing corrupt local copy of {}", local.id);
            return Ok(Reconciled::Commit {
                shard: incoming.clone(),
                base,
                record: None,
            });
        }

        if local.group.id != incoming.group.id {
            return Err(ResolveError::ConflictAnomaly {
                shard_id: incoming.id,
                reason: format!(
                    "held in group {}, offered in group {}",
                    local.group.id, incoming.group.id
                ),
            });
        }

        let declared = self.store.group_mode(&local.group.id)?;
        match Self::classify(&local, incoming, declared) {
            ConflictCheck::Absent | ConflictCheck::FastForward => Ok(Reconciled::Commit {
                shard: incoming.clone(),
                base,
                record: None,
            }),
            ConflictCheck::Identical | ConflictCheck::Subsumed => Ok(Reconciled::Keep {
                held: local.hash,
                record: None,
            }),
            ConflictCheck::Conflict(ConflictResolution::Unresolved) => Err(ResolveError::ConflictAnomaly {
                shard_id: incoming.id,
                reason: format!(
                    "local {:?} version meets incoming {:?} version",
                    local.group.mode, incoming.group.mode
                ),
            }),
            ConflictCheck::Conflict(ConflictResolution::LastWriteWins) => {
                let resolved = resolve_last_write_wins(&[local.clone(), incoming.clone()])?;
                info!(
                    "Shard {} resolved by last-write-wins to {}",
                    incoming.id, resolved.winner.hash
                );
                let record = audit_record(&resolved.winner, resolved.discarded, ResolutionStrategy::LastWriteWins);
                if resolved.winner.hash == local.hash {
                    return Ok(Reconciled::Keep {
                        held: local.hash,
                        record: Some(record),
                    });
                }
                Ok(Reconciled::Commit {
                    shard: resolved.winner,
                    base,
                    record: Some(record),
                })
            }
            ConflictCheck::Conflict(ConflictResolution::Merged) => {
                let merged = merge_additive(&[local.clone(), incoming.clone()])?;
                info!("Shard {} merged to version {}", incoming.id, merged.version);
                Ok(Reconciled::Commit {
                    record: Some(audit_record(&merged, vec![local, incoming.clone()], ResolutionStrategy::Merged)),
                    shard: merged,
                    base,
                })
            }
        }
    }

    /// Reconcile `incoming` and commit the outcome.
    ///
    /// The commit lands only while the local copy is still the one reconciled
    /// against. Otherwise resolution runs again on the newer copy.
    pub fn settle(&self, incoming: &Shard) -> Result<Settled, ResolveError> {
        for _ in 0..SETTLE_ATTEMPTS {
            match self.reconcile(incoming)? {
                Reconciled::Keep { held, record } => {
                    return Ok(Settled::Kept {
                        hash: held,
                        resolved: self.audit(record),
                    });
                }
                Reconciled::Commit { shard, base, record } => {
                    if self.store.commit_if(base, &shard)? {
                        return Ok(Settled::Committed {
                            hash: shard.hash,
                            resolved: self.audit(record),
                        });
                    }
                    debug!("Local copy of {} changed while resolving", shard.id);
                }
            }
        }
        Err(ResolveError::Contended(incoming.id))
    }

    // True when there was a conflict to record
    fn audit(&self, record: Option<ConflictRecord>) -> bool {
        let Some(record) = record else {
            return false;
        };
        if let Err(e) = self.store.record_conflict(&record) {
            warn!("Failed to audit conflict on {}: {}", record.shard_id, e);
        }
        true
    }
}

fn audit_record(winner: &Shard, discarded: Vec<Shard>, strategy: ResolutionStrategy) -> ConflictRecord {
    ConflictRecord {
        shard_id: winner.id,
        group: winner.group.id.clone(),
        strategy,
        winner: winner.hash,
        discarded,
        resolved_at: unix_millis(),
    }
}

fn check_same_group(shards: &[Shard]) -> Result<&Shard, ResolveError> {
    let first = shards.first().ok_or(ResolveError::Empty)?;
    for shard in &shards[1..] {
        if shard.group.id != first.group.id || shard.group.mode != first.group.mode {
            return Err(ResolveError::ConflictAnomaly {
                shard_id: shard.id,
                reason: format!(
                    "{:?} in group {} mixed with {:?} in group {}",
                    shard.group.mode, shard.group.id, first.group.mode, first.group.id
                ),
            });
        }
    }
    Ok(first)
}

/// Pick the version with the greatest timestamp; ties go to the greater hash
pub fn resolve_last_write_wins(versions: &[Shard]) -> Result<Resolved, ResolveError> {
    let first = check_same_group(versions)?;
    if first.group.mode != MergeMode::Overwrite {
        return Err(ResolveError::NotOverwrite(first.group.id.clone()));
    }

    let mut ordered: Vec<Shard> = versions.to_vec();
    ordered.sort_by(|a, b| lww_order(b, a));
    let mut seen = HashSet::new();
    ordered.retain(|shard| seen.insert(shard.hash));

    let mut ordered = ordered.into_iter();
    let winner = ordered.next().ok_or(ResolveError::Empty)?;
    let discarded = ordered.collect();

    debug!("Last-write-wins picked {} at {}", winner.hash, winner.timestamp);
    Ok(Resolved { winner, discarded })
}

/// Merge additive versions of a single shard.
///
/// The result carries version max + 1, the latest input timestamp and the
/// union of the inputs' ancestry, so two peers merging the same inputs produce
/// the same record.
pub fn merge_additive(shards: &[Shard]) -> Result<Shard, ResolveError> {
    let first = check_same_group(shards)?;
    if first.group.mode != MergeMode::Additive {
        return Err(ResolveError::NotAdditive(first.group.id.clone()));
    }
    if let Some(other) = shards.iter().find(|shard| shard.id != first.id) {
        return Err(ResolveError::ConflictAnomaly {
            shard_id: other.id,
            reason: format!("cannot merge into foreign shard {}", first.id),
        });
    }

    let payload = merge_payloads(shards.iter().map(|shard| shard.payload.as_slice()))?.encode()?;
    let version = shards.iter().map(|shard| shard.version).max().unwrap_or(0) + 1;
    let timestamp = shards.iter().map(|shard| shard.timestamp).max().unwrap_or(0);
    let mut ancestry = BTreeSet::new();
    for shard in shards {
        ancestry.extend(shard.ancestry.iter().copied());
        ancestry.insert(shard.hash);
    }

    let hash = ContentHash::of(&payload);
    ancestry.remove(&hash);
    Ok(Shard {
        id: first.id,
        group: first.group.clone(),
        hash,
        payload,
        version,
        timestamp,
        ancestry,
    })
}
