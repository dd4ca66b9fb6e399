/// Anchor operations and their lifecycle.
///
/// ```text
/// CREATED ─▶ CONTENT_PENDING ─▶ CONTENT_UPLOADED ─▶ METADATA_ASSEMBLED
///    │                                                     │
///    │ (reference supplied)                                ▼
///    └───────────────────────────▶ HASH_BOUND ◀── METADATA_UPLOADED
///                                      │
///                                      ▼
///                                  SUBMITTED ─▶ CONFIRMED
///
///   any non-terminal state ─▶ FAILED
/// ```
///
/// `CONFIRMED` and `FAILED` are absorbing. Moving to `SUBMITTED` is the
/// commit point: before it a cancellation stops the operation, after it a
/// cancellation only marks the operation abandoned.
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify};
use uuid::Uuid;

use super::registry::IdempotencyKey;
use super::{AnchorOutcome, OperationKind, TxHash};
use crate::error::{AnchorError, Result};

/// Shared handle to a running operation.
pub type OperationHandle = Arc<AnchorOperation>;

/// Lifecycle state of an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OperationState {
    Created,
    ContentPending,
    ContentUploaded,
    MetadataAssembled,
    MetadataUploaded,
    HashBound,
    Submitted,
    Confirmed(AnchorOutcome),
    Failed(AnchorError),
}

impl OperationState {
    pub fn name(&self) -> &'static str {
        match self {
            OperationState::Created => "CREATED",
            OperationState::ContentPending => "CONTENT_PENDING",
            OperationState::ContentUploaded => "CONTENT_UPLOADED",
            OperationState::MetadataAssembled => "METADATA_ASSEMBLED",
            OperationState::MetadataUploaded => "METADATA_UPLOADED",
            OperationState::HashBound => "HASH_BOUND",
            OperationState::Submitted => "SUBMITTED",
            OperationState::Confirmed(_) => "CONFIRMED",
            OperationState::Failed(_) => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationState::Confirmed(_) | OperationState::Failed(_)
        )
    }

    /// Whether the operation has passed the commit point.
    pub fn is_submitted(&self) -> bool {
        matches!(self, OperationState::Submitted)
    }

    /// Legal forward edges of the state machine. Confirmation without a
    /// submission is only possible for duplicates, handled separately.
    pub fn can_advance_to(&self, next: &OperationState) -> bool {
        use OperationState::*;

        match (self, next) {
            (Confirmed(_) | Failed(_), _) => false,
            (_, Failed(_)) => true,
            (Created, ContentPending | HashBound) => true,
            (ContentPending, ContentUploaded) => true,
            (ContentUploaded, MetadataAssembled) => true,
            (MetadataAssembled, MetadataUploaded) => true,
            (MetadataUploaded, HashBound) => true,
            (HashBound, Submitted) => true,
            (Submitted, Confirmed(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Observable status of an operation.
#[derive(Debug, Clone)]
pub struct OperationSnapshot {
    pub state: OperationState,
    pub updated_at: DateTime<Utc>,
    /// Set once the ledger accepted the transaction.
    pub tx_hash: Option<TxHash>,
}

/// What a cancellation request achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The operation will stop before submitting.
    Requested,
    /// Already submitted: the operation completes but is marked abandoned.
    Advisory,
    AlreadySettled,
}

/// A single create or update request moving through the state machine.
pub struct AnchorOperation {
    id: Uuid,
    kind: OperationKind,
    created_at: DateTime<Utc>,
    status: watch::Sender<OperationSnapshot>,
    key: OnceLock<IdempotencyKey>,
    duplicate_of: OnceLock<Uuid>,
    cancel_requested: AtomicBool,
    cancel_notify: Notify,
    abandoned: AtomicBool,
    committed: AtomicBool,
}

impl fmt::Debug for AnchorOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnchorOperation")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state().name())
            .finish()
    }
}

impl AnchorOperation {
    pub fn new(kind: OperationKind) -> OperationHandle {
        let now = Utc::now();
        let (status, _) = watch::channel(OperationSnapshot {
            state: OperationState::Created,
            updated_at: now,
            tx_hash: None,
        });

        Arc::new(Self {
            id: Uuid::now_v7(),
            kind,
            created_at: now,
            status,
            key: OnceLock::new(),
            duplicate_of: OnceLock::new(),
            cancel_requested: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            abandoned: AtomicBool::new(false),
            committed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn snapshot(&self) -> OperationSnapshot {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> OperationState {
        self.status.borrow().state.clone()
    }

    pub fn tx_hash(&self) -> Option<TxHash> {
        self.status.borrow().tx_hash
    }

    /// Idempotency key, known from `HASH_BOUND` on.
    pub fn key(&self) -> Option<&IdempotencyKey> {
        self.key.get()
    }

    /// Id of the in-flight operation this one deferred to, if any.
    pub fn duplicate_of(&self) -> Option<Uuid> {
        self.duplicate_of.get().copied()
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }

    /// Whether the operation ever reached `SUBMITTED`, even if it later
    /// failed.
    pub fn reached_submission(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<OperationSnapshot> {
        self.status.subscribe()
    }

    /// Wait for a terminal state.
    pub async fn wait(&self) -> Result<AnchorOutcome> {
        let mut rx = self.status.subscribe();
        let snapshot = rx
            .wait_for(|s| s.state.is_terminal())
            .await
            .map_err(|_| AnchorError::Internal("operation status channel closed".into()))?;

        let result = match &snapshot.state {
            OperationState::Confirmed(outcome) => Ok(outcome.clone()),
            OperationState::Failed(err) => Err(err.clone()),
            other => Err(AnchorError::Internal(format!(
                "operation settled in non-terminal state {other}"
            ))),
        };
        result
    }

    /// Request cancellation.
    ///
    /// Decided under the status lock, so it cannot interleave with the move
    /// to `SUBMITTED`.
    pub fn cancel(&self) -> CancelOutcome {
        let mut outcome = CancelOutcome::AlreadySettled;
        self.status.send_if_modified(|snapshot| {
            outcome = if snapshot.state.is_terminal() {
                CancelOutcome::AlreadySettled
            } else if snapshot.state.is_submitted() {
                self.abandoned.store(true, Ordering::SeqCst);
                CancelOutcome::Advisory
            } else {
                self.cancel_requested.store(true, Ordering::SeqCst);
                CancelOutcome::Requested
            };
            false
        });

        if outcome == CancelOutcome::Requested {
            self.cancel_notify.notify_waiters();
        }
        outcome
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.cancel_notify.notified();
            if self.is_cancel_requested() {
                return;
            }
            notified.await;
        }
    }

    /// Run `fut` unless cancellation arrives first.
    pub(crate) async fn interruptible<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(AnchorError::Cancelled),
            result = fut => result,
        }
    }

    /// Move to `next`. Illegal edges are internal errors; a pending
    /// cancellation turns any pre-submission step into `Cancelled`.
    pub(crate) fn advance(&self, next: OperationState) -> Result<()> {
        let mut result = Ok(());
        self.status.send_if_modified(|snapshot| {
            if !snapshot.state.can_advance_to(&next) {
                result = Err(AnchorError::Internal(format!(
                    "illegal transition {} -> {}",
                    snapshot.state, next
                )));
                return false;
            }
            if self.is_cancel_requested() && !next.is_terminal() && !snapshot.state.is_submitted()
            {
                result = Err(AnchorError::Cancelled);
                return false;
            }
            if next.is_submitted() {
                self.committed.store(true, Ordering::SeqCst);
            }
            snapshot.state = next;
            snapshot.updated_at = Utc::now();
            true
        });
        result
    }

    pub(crate) fn record_tx(&self, tx_hash: TxHash) {
        self.status.send_modify(|snapshot| {
            snapshot.tx_hash = Some(tx_hash);
            snapshot.updated_at = Utc::now();
        });
    }

    pub(crate) fn bind_key(&self, key: IdempotencyKey) {
        let _ = self.key.set(key);
    }

    /// Settle with a final result. Returns false if already settled.
    pub(crate) fn settle(&self, result: Result<AnchorOutcome>) -> bool {
        let next = match result {
            Ok(outcome) => OperationState::Confirmed(outcome),
            Err(err) => OperationState::Failed(err),
        };
        self.advance(next).is_ok()
    }

    /// Adopt the terminal result of the operation this one duplicates.
    pub(crate) fn settle_as_duplicate(&self, original: Uuid, result: Result<AnchorOutcome>) {
        let _ = self.duplicate_of.set(original);
        self.status.send_if_modified(|snapshot| {
            if snapshot.state.is_terminal() {
                return false;
            }
            snapshot.state = match result {
                Ok(outcome) => {
                    snapshot.tx_hash = Some(outcome.tx_hash);
                    OperationState::Confirmed(outcome)
                }
                Err(err) => {
                    snapshot.tx_hash = err.tx_hash().copied();
                    OperationState::Failed(err)
                }
            };
            snapshot.updated_at = Utc::now();
            true
        });
    }
}
