//! Integration tests for the anchor orchestrator
//!
//! Every test wires the orchestrator to the in-memory content store and
//! ledger, so the full create/evolve pipeline runs without a network.

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use serde_json::json;

use content_anchor::anchor::{
    AnchorOrchestrator, AnchorRequest, CancelOutcome, ContentReference, ContentSource,
    OperationKind, OperationState, OrchestratorConfig, RecordId, RetryPolicy, TransactionStatus,
};
use content_anchor::crypto::hash;
use content_anchor::error::{AnchorError, LedgerError, UploadError};
use content_anchor::ledger::memory::InMemoryLedger;
use content_anchor::metadata::{ImageUpload, MetadataFields};
use content_anchor::storage::memory::InMemoryStore;

const OWNER: Address = Address::repeat_byte(0x42);

struct Harness {
    orchestrator: Arc<AnchorOrchestrator>,
    store: Arc<InMemoryStore>,
    ledger: Arc<InMemoryLedger>,
}

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        confirmations: 1,
        confirmation_timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
        },
        retention: Duration::from_secs(60),
    }
}

fn harness_with(config: OrchestratorConfig) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let ledger = Arc::new(InMemoryLedger::new());
    let orchestrator = Arc::new(AnchorOrchestrator::new(
        store.clone(),
        ledger.clone(),
        config,
    ));
    Harness {
        orchestrator,
        store,
        ledger,
    }
}

fn harness() -> Harness {
    harness_with(fast_config())
}

fn create(reference: &str) -> AnchorRequest {
    AnchorRequest::Create {
        owner: OWNER,
        content: ContentSource::Reference(ContentReference::parse(reference).unwrap()),
    }
}

fn update(record_id: RecordId, reference: &str) -> AnchorRequest {
    AnchorRequest::Update {
        record_id,
        content: ContentSource::Reference(ContentReference::parse(reference).unwrap()),
    }
}

fn sprout_upload() -> ImageUpload {
    ImageUpload {
        bytes: b"\x89PNG sprout".to_vec(),
        filename: "sprout.png".to_string(),
        fields: MetadataFields {
            name: "Sprout".to_string(),
            description: "Stage 1".to_string(),
            attributes: json!([{"trait_type": "stage", "value": 1}]),
        },
    }
}

#[tokio::test]
async fn test_create_binds_commitment() {
    let h = harness();

    let outcome = h
        .orchestrator
        .anchor(create("ipfs://QmSeed"))
        .await
        .unwrap();

    assert_eq!(outcome.kind, OperationKind::Create);
    assert_eq!(outcome.record_id, RecordId::from(1u64));
    assert_eq!(outcome.reference.as_str(), "ipfs://QmSeed");
    assert_eq!(outcome.commitment, hash::bind("ipfs://QmSeed"));
    assert!(outcome.published.is_none());

    let stored = h.ledger.record(outcome.record_id).await.unwrap();
    assert_eq!(stored.owner, OWNER);
    assert_eq!(stored.commitment, hash::bind(stored.reference.as_str()));

    let reference = h
        .orchestrator
        .read_reference(outcome.record_id)
        .await
        .unwrap();
    assert_eq!(reference.as_str(), "ipfs://QmSeed");
}

#[tokio::test]
async fn test_create_then_evolve() {
    let h = harness();

    let minted = h.orchestrator.anchor(create("ipfs://QmA")).await.unwrap();
    let evolved = h
        .orchestrator
        .anchor(update(minted.record_id, "ipfs://QmB"))
        .await
        .unwrap();

    assert_eq!(evolved.kind, OperationKind::Update);
    assert_eq!(evolved.record_id, minted.record_id);
    assert_ne!(evolved.tx_hash, minted.tx_hash);
    assert!(evolved.block_number > minted.block_number);

    let stored = h.ledger.record(minted.record_id).await.unwrap();
    assert_eq!(stored.reference.as_str(), "ipfs://QmB");
    assert_eq!(stored.commitment, hash::bind("ipfs://QmB"));
}

#[tokio::test]
async fn test_evolve_unknown_record_submits_nothing() {
    let h = harness();

    let err = h
        .orchestrator
        .anchor(update(RecordId::from(99u64), "ipfs://QmX"))
        .await
        .unwrap_err();

    assert_eq!(err, AnchorError::NotFound(RecordId::from(99u64)));
    assert_eq!(h.ledger.submission_count().await, 0);
}

#[tokio::test]
async fn test_identical_concurrent_creates_submit_once() {
    let h = harness();
    h.ledger
        .set_confirmation_delay(Duration::from_millis(200))
        .await;

    let first = h.orchestrator.submit(create("ipfs://QmSame"));
    let second = h.orchestrator.submit(create("ipfs://QmSame"));
    let (a, b) = tokio::join!(first.wait(), second.wait());

    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a.record_id, b.record_id);
    assert_eq!(a.tx_hash, b.tx_hash);
    assert_eq!(h.ledger.submission_count().await, 1);

    let duplicates = [first.duplicate_of(), second.duplicate_of()];
    assert_eq!(duplicates.iter().filter(|d| d.is_some()).count(), 1);
    assert!(duplicates.contains(&Some(first.id())) || duplicates.contains(&Some(second.id())));
}

#[tokio::test]
async fn test_settled_create_is_deduplicated_within_retention() {
    let h = harness();

    let first = h.orchestrator.anchor(create("ipfs://QmOnce")).await.unwrap();
    let again = h.orchestrator.anchor(create("ipfs://QmOnce")).await.unwrap();

    assert_eq!(first.record_id, again.record_id);
    assert_eq!(h.ledger.submission_count().await, 1);
}

#[tokio::test]
async fn test_distinct_creates_are_not_deduplicated() {
    let h = harness();

    let a = h.orchestrator.anchor(create("ipfs://QmOne")).await.unwrap();
    let b = h.orchestrator.anchor(create("ipfs://QmTwo")).await.unwrap();

    assert_ne!(a.record_id, b.record_id);
    assert_eq!(h.ledger.submission_count().await, 2);
}

#[tokio::test]
async fn test_transient_upload_failure_is_retried() {
    let h = harness();
    h.store
        .inject_failure(UploadError::Transient("503 Service Unavailable".into()))
        .await;

    let outcome = h
        .orchestrator
        .anchor(AnchorRequest::Create {
            owner: OWNER,
            content: ContentSource::Upload(sprout_upload()),
        })
        .await
        .unwrap();

    assert!(outcome.published.is_some());
    assert_eq!(h.store.attempt_count().await, 3);
    assert_eq!(h.store.upload_count().await, 2);
}

#[tokio::test]
async fn test_permanent_upload_failure_is_not_retried() {
    let h = harness();
    h.store
        .inject_failure(UploadError::Permanent("413 Payload Too Large".into()))
        .await;

    let err = h
        .orchestrator
        .anchor(AnchorRequest::Create {
            owner: OWNER,
            content: ContentSource::Upload(sprout_upload()),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, AnchorError::Upload(UploadError::Permanent(_))));
    assert_eq!(h.store.attempt_count().await, 1);
    assert_eq!(h.ledger.submission_count().await, 0);
}

#[tokio::test]
async fn test_transient_submission_failure_is_retried() {
    let h = harness();
    h.ledger
        .inject_submit_failure(LedgerError::Transient("connection reset".into()))
        .await;

    let outcome = h.orchestrator.anchor(create("ipfs://QmRetry")).await.unwrap();

    assert_eq!(outcome.record_id, RecordId::from(1u64));
    assert_eq!(h.ledger.submission_count().await, 2);
}

#[tokio::test]
async fn test_revert_is_not_retried() {
    let h = harness();
    h.ledger
        .inject_submit_failure(LedgerError::reverted("insufficient funds"))
        .await;

    let err = h
        .orchestrator
        .anchor(create("ipfs://QmPoor"))
        .await
        .unwrap_err();

    assert!(matches!(err, AnchorError::Ledger(LedgerError::Reverted { .. })));
    assert_eq!(h.ledger.submission_count().await, 1);
}

#[tokio::test]
async fn test_confirmation_timeout_keeps_tx_hash() {
    let h = harness_with(OrchestratorConfig {
        confirmation_timeout: Duration::from_millis(100),
        ..fast_config()
    });
    h.ledger.set_withhold_receipts(true).await;

    let op = h.orchestrator.submit(create("ipfs://QmSlow"));
    let err = op.wait().await.unwrap_err();

    let tx_hash = *err.tx_hash().expect("timeout retains the transaction hash");
    assert!(matches!(err, AnchorError::Ledger(LedgerError::Timeout { .. })));
    assert_eq!(op.tx_hash(), Some(tx_hash));
    assert_eq!(
        h.orchestrator.transaction_status(tx_hash).await.unwrap(),
        TransactionStatus::Pending
    );

    h.ledger.set_withhold_receipts(false).await;
    match h.orchestrator.transaction_status(tx_hash).await.unwrap() {
        TransactionStatus::Confirmed { record_id, .. } => {
            assert_eq!(record_id, Some(RecordId::from(1u64)));
        }
        other => panic!("expected confirmed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_mined_revert_keeps_tx_hash() {
    let h = harness();
    h.ledger.set_fail_execution(true).await;

    let err = h
        .orchestrator
        .anchor(create("ipfs://QmRejected"))
        .await
        .unwrap_err();

    assert!(matches!(err, AnchorError::Ledger(LedgerError::Reverted { .. })));
    let tx_hash = *err.tx_hash().expect("mined revert retains the transaction hash");
    assert_eq!(h.ledger.submission_count().await, 1);
    assert!(matches!(
        h.orchestrator.transaction_status(tx_hash).await.unwrap(),
        TransactionStatus::Reverted { .. }
    ));
    assert!(h.ledger.record(RecordId::from(1u64)).await.is_none());
}

#[tokio::test]
async fn test_overlapping_evolves_check_their_own_block() {
    let h = harness();
    let record_id = h
        .ledger
        .seed_record(
            OWNER,
            ContentReference::parse("ipfs://QmStart").unwrap(),
            hash::bind("ipfs://QmStart"),
        )
        .await;
    h.ledger
        .set_confirmation_delay(Duration::from_millis(100))
        .await;

    let (first, second) = tokio::join!(
        h.orchestrator.anchor(update(record_id, "ipfs://QmX")),
        h.orchestrator.anchor(update(record_id, "ipfs://QmY")),
    );
    let first = first.unwrap();
    let second = second.unwrap();

    assert_eq!(first.commitment, hash::bind("ipfs://QmX"));
    assert_eq!(second.commitment, hash::bind("ipfs://QmY"));
    assert_ne!(first.block_number, second.block_number);
    assert_eq!(h.ledger.submission_count().await, 2);

    let stored = h.ledger.record(record_id).await.unwrap();
    assert_eq!(stored.commitment, hash::bind(stored.reference.as_str()));
}

#[tokio::test]
async fn test_tampered_commitment_is_reported() {
    let h = harness();
    h.ledger.set_tamper_commitments(true).await;

    let err = h
        .orchestrator
        .anchor(create("ipfs://QmTamper"))
        .await
        .unwrap_err();

    match &err {
        AnchorError::HashMismatch {
            record_id,
            expected,
            actual,
            ..
        } => {
            assert_eq!(*record_id, RecordId::from(1u64));
            assert_eq!(*expected, hash::bind("ipfs://QmTamper"));
            assert_ne!(expected, actual);
        }
        other => panic!("expected hash mismatch, got {other:?}"),
    }
    assert!(err.tx_hash().is_some());

    let verification = h
        .orchestrator
        .verify_record(RecordId::from(1u64))
        .await
        .unwrap();
    assert!(!verification.is_valid());
}

#[tokio::test]
async fn test_missing_creation_event_is_a_parse_error() {
    let h = harness();
    h.ledger.set_omit_events(true).await;

    let err = h
        .orchestrator
        .anchor(create("ipfs://QmSilent"))
        .await
        .unwrap_err();

    assert!(matches!(err, AnchorError::Parse { .. }));
    assert!(err.tx_hash().is_some());
}

#[tokio::test]
async fn test_cancel_before_submission() {
    let h = harness();
    h.store.set_delay(Duration::from_millis(300)).await;

    let op = h.orchestrator.submit(AnchorRequest::Create {
        owner: OWNER,
        content: ContentSource::Upload(sprout_upload()),
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(op.cancel(), CancelOutcome::Requested);
    assert_eq!(op.wait().await.unwrap_err(), AnchorError::Cancelled);
    assert_eq!(h.ledger.submission_count().await, 0);
    assert!(matches!(
        op.state(),
        OperationState::Failed(AnchorError::Cancelled)
    ));
}

#[tokio::test]
async fn test_cancel_after_submission_is_advisory() {
    let h = harness_with(OrchestratorConfig {
        confirmation_timeout: Duration::from_millis(300),
        ..fast_config()
    });
    h.ledger.set_withhold_receipts(true).await;

    let op = h.orchestrator.submit(create("ipfs://QmLate"));
    let mut rx = op.subscribe();
    rx.wait_for(|s| s.tx_hash.is_some()).await.unwrap();

    assert_eq!(op.cancel(), CancelOutcome::Advisory);
    assert!(op.is_abandoned());

    let err = op.wait().await.unwrap_err();
    assert!(matches!(err, AnchorError::Ledger(LedgerError::Timeout { .. })));
    assert_eq!(h.ledger.submission_count().await, 1);
    assert_eq!(op.cancel(), CancelOutcome::AlreadySettled);
}

#[tokio::test]
async fn test_upload_create_publishes_metadata() {
    let h = harness();

    let outcome = h
        .orchestrator
        .anchor(AnchorRequest::Create {
            owner: OWNER,
            content: ContentSource::Upload(sprout_upload()),
        })
        .await
        .unwrap();

    let published = outcome.published.expect("upload creates publish content");
    assert_eq!(outcome.reference, published.metadata_uri);
    assert_eq!(outcome.commitment, hash::bind_reference(&published.metadata_uri));

    let document = h
        .store
        .get_json(published.metadata_uri.cid())
        .await
        .unwrap();
    assert_eq!(document["name"], "Sprout");
    assert_eq!(document["image"], published.image.as_str());
    assert_eq!(document["attributes"][0]["value"], 1);

    let image = h.store.get(published.image.cid()).await.unwrap();
    assert_eq!(image, b"\x89PNG sprout".to_vec());
}

#[tokio::test]
async fn test_upload_evolve_states_advance_in_order() {
    const ORDER: [&str; 8] = [
        "CREATED",
        "CONTENT_PENDING",
        "CONTENT_UPLOADED",
        "METADATA_ASSEMBLED",
        "METADATA_UPLOADED",
        "HASH_BOUND",
        "SUBMITTED",
        "CONFIRMED",
    ];

    let h = harness();
    h.ledger
        .set_confirmation_delay(Duration::from_millis(50))
        .await;
    let record_id = h
        .ledger
        .seed_record(
            OWNER,
            ContentReference::ipfs("QmSeed"),
            hash::bind("ipfs://QmSeed"),
        )
        .await;

    let op = h.orchestrator.submit(AnchorRequest::Update {
        record_id,
        content: ContentSource::Upload(sprout_upload()),
    });
    let mut rx = op.subscribe();
    let mut seen = vec![rx.borrow().state.name()];
    while rx.changed().await.is_ok() {
        let state = rx.borrow_and_update().state.clone();
        seen.push(state.name());
        if state.is_terminal() {
            break;
        }
    }

    let outcome = op.wait().await.unwrap();
    assert_eq!(outcome.record_id, record_id);
    assert_eq!(seen.last(), Some(&"CONFIRMED"));
    assert!(seen.contains(&"SUBMITTED"), "{seen:?}");

    let positions: Vec<usize> = seen
        .iter()
        .map(|name| ORDER.iter().position(|o| o == name).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
}

#[tokio::test]
async fn test_publish_rejects_empty_file() {
    let h = harness();
    let upload = ImageUpload {
        bytes: Vec::new(),
        ..sprout_upload()
    };

    let err = h.orchestrator.publish(&upload).await.unwrap_err();
    assert_eq!(err, AnchorError::Validation("file is required".into()));
    assert_eq!(h.store.attempt_count().await, 0);
}

#[tokio::test]
async fn test_verify_confirmed_record() {
    let h = harness();
    let outcome = h.orchestrator.anchor(create("ipfs://QmGood")).await.unwrap();

    let verification = h
        .orchestrator
        .verify_record(outcome.record_id)
        .await
        .unwrap();

    assert!(verification.is_valid());
    assert_eq!(verification.reference.as_str(), "ipfs://QmGood");
    assert_eq!(verification.actual, outcome.commitment);
}
