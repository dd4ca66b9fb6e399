/// Idempotency registry for in-flight operations.
///
/// Two requests with the same kind, target and commitment are the same
/// ledger effect. The first one admitted runs; later ones defer to it and
/// report its outcome. Entries of operations that reached the ledger are
/// kept for a retention window after settling, so a retry shortly after a
/// success does not mint twice.
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::operation::OperationHandle;
use super::{AnchorRequest, CommitmentHash, OperationKind};

/// Identity of a ledger effect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    pub kind: OperationKind,
    /// Owner address for creates, record id for updates.
    pub target: String,
    pub commitment: CommitmentHash,
}

impl IdempotencyKey {
    pub fn for_request(request: &AnchorRequest, commitment: CommitmentHash) -> Self {
        Self {
            kind: request.kind(),
            target: request.target(),
            commitment,
        }
    }
}

/// Result of trying to register an operation.
#[derive(Debug)]
pub enum Admission {
    Admitted,
    /// Another operation with the same key is running or recently settled.
    AlreadyInFlight(OperationHandle),
}

struct Slot {
    handle: OperationHandle,
    /// Set when the operation settles and its entry is kept.
    retire_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.retire_at.is_some_and(|at| now >= at)
    }
}

/// Registry of operations keyed by [`IdempotencyKey`].
pub struct InFlightRegistry {
    entries: DashMap<IdempotencyKey, Slot>,
    retention: Duration,
}

impl InFlightRegistry {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            retention,
        }
    }

    /// Atomically admit `handle` under `key`, or return the operation that
    /// already holds it.
    pub fn register(&self, key: IdempotencyKey, handle: &OperationHandle) -> Admission {
        self.evict_expired();

        let now = Instant::now();
        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) if occupied.get().is_expired(now) => {
                occupied.insert(Slot {
                    handle: handle.clone(),
                    retire_at: None,
                });
                Admission::Admitted
            }
            Entry::Occupied(occupied) => Admission::AlreadyInFlight(occupied.get().handle.clone()),
            Entry::Vacant(vacant) => {
                vacant.insert(Slot {
                    handle: handle.clone(),
                    retire_at: None,
                });
                Admission::Admitted
            }
        }
    }

    /// Mark a settled operation. With `retain` the entry stays for the
    /// retention window; otherwise it is released now. Only the operation
    /// that owns the entry can retire it.
    pub fn retire(&self, key: &IdempotencyKey, operation_id: Uuid, retain: bool) {
        if retain {
            if let Some(mut slot) = self.entries.get_mut(key) {
                if slot.handle.id() == operation_id {
                    slot.retire_at = Some(Instant::now() + self.retention);
                }
            }
        } else {
            self.entries
                .remove_if(key, |_, slot| slot.handle.id() == operation_id);
        }
    }

    /// Drop entries whose retention window has passed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, slot| !slot.is_expired(now));
        let evicted = before.saturating_sub(self.entries.len());
        if evicted > 0 {
            debug!(evicted, "Evicted expired in-flight entries");
        }
        evicted
    }

    pub fn get(&self, key: &IdempotencyKey) -> Option<OperationHandle> {
        self.entries.get(key).map(|slot| slot.handle.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
