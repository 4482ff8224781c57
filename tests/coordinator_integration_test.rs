//! End-to-end coordinator flows over in-memory collaborators.
//!
//! Covers the acceptance scenarios (verify then upload, revoke then upload,
//! audit log timeouts), per-subject ordering, upload idempotence and retry
//! exhaustion followed by reconciliation.

mod common;

use std::time::Duration;

use tracerx_coordinator::coordinator::VerificationStatus;
use tracerx_coordinator::domain::{BatchStatus, ReceiptStatus};
use tracerx_coordinator::infra::{collections, CoordinatorError, Fault, RegistryCall};

use common::*;

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn scenario_a_verify_then_upload() {
    let app = TestApp::new();
    let sender = address("0.0.111");

    let verified = app.coordinator.gateway.verify(sender).await.unwrap();
    assert!(!verified.audit_pending);
    assert!(app.coordinator.gateway.is_authorized(&sender).await.unwrap());

    let outcome = app
        .coordinator
        .uploads
        .upload(upload_request("B1", "0.0.111"))
        .await
        .unwrap();

    assert!(!outcome.audit_pending);
    assert!(!outcome.replayed);
    assert_eq!(outcome.record.status, BatchStatus::Recorded);
    let token = outcome.record.token_id.clone().unwrap();

    let uploads = app.log_events("BatchUploaded").await;
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0]["batchId"], "B1");
    assert_eq!(uploads[0]["tokenId"], token.as_str());

    let verifications = app.log_events("ManufacturerVerified").await;
    assert_eq!(verifications.len(), 1);
    assert_eq!(verifications[0]["address"], "0.0.111");
    assert_eq!(verifications[0]["txHash"], verified.tx_hash.as_str());
}

#[tokio::test]
async fn scenario_b_revoke_then_upload_is_refused() {
    let app = TestApp::new();
    let sender = address("0.0.111");

    app.coordinator.gateway.verify(sender).await.unwrap();
    app.coordinator
        .uploads
        .upload(upload_request("B1", "0.0.111"))
        .await
        .unwrap();

    let revoked = app.coordinator.gateway.revoke(sender).await.unwrap();
    assert!(!revoked.audit_pending);

    let err = app
        .coordinator
        .uploads
        .upload(upload_request("B2", "0.0.111"))
        .await
        .unwrap_err();

    assert!(matches!(err, CoordinatorError::Authorization(_)));
    assert!(app.coordinator.uploads.batch("B2").await.unwrap().is_none());
    assert_eq!(app.tokens.mint_count().await, 1);
    assert!(app.log_events("BatchUploaded").await.iter().all(|m| m["batchId"] != "B2"));
}

#[tokio::test]
async fn scenario_c_log_timeouts_then_reconciled() {
    let app = TestApp::with_audit_attempts(2);
    app.registry.set_verified(address("0.0.111"), true).await;
    app.log.faults().fail_next(2, Fault::Timeout).await;

    let outcome = app
        .coordinator
        .uploads
        .upload(upload_request("B1", "0.0.111"))
        .await
        .unwrap();

    assert!(outcome.audit_pending);
    assert_eq!(outcome.record.status, BatchStatus::PendingAudit);
    assert!(app.log.entries(TOPIC).await.is_empty());

    let report = app.coordinator.reconciler.run_once().await.unwrap();
    assert_eq!(report.acknowledged, 1);
    assert_eq!(report.batches_promoted, 1);

    let record = app.coordinator.uploads.batch("B1").await.unwrap().unwrap();
    assert_eq!(record.status, BatchStatus::Recorded);
    assert_eq!(record.audit_sequence_number, Some(1));
    assert_eq!(record.token_id, outcome.record.token_id);

    assert_eq!(app.log_events("BatchUploaded").await.len(), 1);
    assert_eq!(app.tokens.mint_count().await, 1);
}

// ============================================================================
// Properties
// ============================================================================

#[tokio::test]
async fn upload_is_idempotent() {
    let app = TestApp::new();
    app.registry.set_verified(address("0.0.111"), true).await;

    let first = app
        .coordinator
        .uploads
        .upload(upload_request("B1", "0.0.111"))
        .await
        .unwrap();
    let second = app
        .coordinator
        .uploads
        .upload(upload_request("B1", "0.0.111"))
        .await
        .unwrap();

    assert!(second.replayed);
    assert_eq!(first.record.token_id, second.record.token_id);
    assert_eq!(app.tokens.mint_count().await, 1);
    assert_eq!(app.log_events("BatchUploaded").await.len(), 1);
}

#[tokio::test]
async fn unverified_sender_never_reaches_token_minted() {
    let app = TestApp::new();

    for (i, sender) in ["0.0.200", "0.0.201", "0x00000000000000000000000000000000000000aa"]
        .iter()
        .enumerate()
    {
        let batch_id = format!("GATE-{i}");
        let err = app
            .coordinator
            .uploads
            .upload(upload_request(&batch_id, sender))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Authorization(_)));
        assert!(app.coordinator.uploads.batch(&batch_id).await.unwrap().is_none());
    }

    assert_eq!(app.tokens.mint_count().await, 0);
    assert!(app.log.entries(TOPIC).await.is_empty());
}

#[tokio::test]
async fn authorization_follows_the_last_mutation() {
    let app = TestApp::new();
    let sender = address("0.0.111");
    let gateway = &app.coordinator.gateway;

    gateway.verify(sender).await.unwrap();
    gateway.revoke(sender).await.unwrap();
    assert!(!gateway.is_authorized(&sender).await.unwrap());

    gateway.verify(sender).await.unwrap();
    assert!(gateway.is_authorized(&sender).await.unwrap());

    let record = gateway.manufacturer(&sender).await.unwrap().unwrap();
    assert!(record.verified_at.is_some());
    assert!(record.revoked_at.is_some());
}

#[tokio::test]
async fn revoke_is_never_acknowledged_before_its_verify() {
    let app = TestApp::with_audit_attempts(1);
    let sender = address("0.0.111");

    app.log.faults().fail_next(1, Fault::Unavailable).await;
    let verified = app.coordinator.gateway.verify(sender).await.unwrap();
    assert!(verified.audit_pending);

    // The log is healthy again, but the revoke's event queues behind the
    // failed verify and is delivered after it.
    let revoked = app.coordinator.gateway.revoke(sender).await.unwrap();
    assert!(!revoked.audit_pending);

    let events: Vec<String> = app
        .log
        .entries(TOPIC)
        .await
        .into_iter()
        .map(|e| e.message["event"].as_str().unwrap_or_default().to_string())
        .collect();
    assert_eq!(events, vec!["ManufacturerVerified", "ManufacturerRevoked"]);

    let journal = app
        .coordinator
        .recorder
        .events_for(&sender.subject_key())
        .await
        .unwrap();
    assert_eq!(journal.len(), 2);
    assert!(journal.iter().all(|e| e.receipt_status == ReceiptStatus::Acknowledged));
    assert!(journal[0].sequence_number < journal[1].sequence_number);
}

#[tokio::test]
async fn concurrent_mutations_keep_registry_and_log_order() {
    let app = TestApp::new();
    let sender = address("0.0.300");
    app.log.faults().set_latency(Duration::from_millis(2)).await;

    let mut handles = Vec::new();
    for i in 0..6 {
        let gateway = app.coordinator.gateway.clone();
        handles.push(tokio::spawn(async move {
            if i % 2 == 0 {
                gateway.verify(sender).await.map(|_| ())
            } else {
                // A revoke that lands before any verify is refused.
                match gateway.revoke(sender).await {
                    Ok(_) | Err(CoordinatorError::NotVerified { .. }) => Ok(()),
                    Err(e) => Err(e),
                }
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let mutations: Vec<&'static str> = app
        .registry
        .calls()
        .await
        .into_iter()
        .filter_map(|c| match c {
            RegistryCall::Verify(_) => Some("ManufacturerVerified"),
            RegistryCall::Revoke(_) => Some("ManufacturerRevoked"),
            RegistryCall::IsVerified(_) => None,
        })
        .collect();

    let logged: Vec<String> = app
        .log
        .entries(TOPIC)
        .await
        .into_iter()
        .map(|e| e.message["event"].as_str().unwrap_or_default().to_string())
        .collect();

    assert_eq!(logged, mutations);
}

// ============================================================================
// Retry exhaustion and reconciliation
// ============================================================================

#[tokio::test]
async fn exhausted_audit_is_promoted_without_reminting() {
    let app = TestApp::with_audit_attempts(3);
    app.registry.set_verified(address("0.0.111"), true).await;
    app.log.faults().fail_always(Fault::Unavailable).await;

    let outcome = app
        .coordinator
        .uploads
        .upload(upload_request("B9", "0.0.111"))
        .await
        .unwrap();
    assert!(outcome.audit_pending);
    assert_eq!(outcome.record.status, BatchStatus::PendingAudit);

    let verification = app.coordinator.uploads.verify_batch("B9").await.unwrap();
    assert_eq!(verification.status, VerificationStatus::Pending);

    // Still down: the pass records the failure and leaves the batch alone.
    let report = app.coordinator.reconciler.run_once().await.unwrap();
    assert_eq!(report.failed_subjects, 1);
    assert_eq!(report.batches_promoted, 0);

    app.log.faults().clear_faults().await;
    let report = app.coordinator.reconciler.run_once().await.unwrap();
    assert_eq!(report.batches_promoted, 1);

    let record = app.coordinator.uploads.batch("B9").await.unwrap().unwrap();
    assert_eq!(record.status, BatchStatus::Recorded);
    assert_eq!(app.tokens.mint_count().await, 1);
    assert_eq!(app.log_events("BatchUploaded").await.len(), 1);

    let verification = app.coordinator.uploads.verify_batch("B9").await.unwrap();
    assert_eq!(verification.status, VerificationStatus::Verified);

    // A replay after promotion reports the settled state.
    let replay = app
        .coordinator
        .uploads
        .upload(upload_request("B9", "0.0.111"))
        .await
        .unwrap();
    assert!(replay.replayed);
    assert!(!replay.audit_pending);
}

#[tokio::test]
async fn accepted_then_errored_submission_is_not_duplicated() {
    let app = TestApp::new();
    app.registry.set_verified(address("0.0.111"), true).await;
    app.log.faults().fail_next(1, Fault::AcceptThenError).await;

    let outcome = app
        .coordinator
        .uploads
        .upload(upload_request("B1", "0.0.111"))
        .await
        .unwrap();

    assert_eq!(outcome.record.status, BatchStatus::Recorded);
    assert_eq!(app.log_events("BatchUploaded").await.len(), 1);
}

#[tokio::test]
async fn reconciliation_pass_with_nothing_to_do() {
    let app = TestApp::new();
    let report = app.coordinator.reconciler.run_once().await.unwrap();
    assert_eq!(report, Default::default());
}

// ============================================================================
// Cancellation
// ============================================================================

/// Poll until `check` holds, for at most two seconds.
async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn dropped_upload_still_finishes_with_one_mint() {
    let app = &TestApp::new();
    app.registry.set_verified(address("0.0.111"), true).await;
    app.tokens.faults().set_latency(Duration::from_millis(100)).await;

    // The token lookup takes the first 100ms; the caller gives up while
    // the mint that follows is in flight.
    let dropped = tokio::time::timeout(
        Duration::from_millis(150),
        app.coordinator.uploads.upload(upload_request("B1", "0.0.111")),
    )
    .await;
    assert!(dropped.is_err());

    let settled = eventually(|| async move {
        app.coordinator
            .uploads
            .batch("B1")
            .await
            .unwrap()
            .is_some_and(|r| matches!(r.status, BatchStatus::Recorded | BatchStatus::PendingAudit))
    })
    .await;
    assert!(settled);

    let record = app.coordinator.uploads.batch("B1").await.unwrap().unwrap();
    assert_eq!(record.token_id.as_ref().map(|t| t.as_str()), Some("1"));
    assert_eq!(app.tokens.mint_count().await, 1);

    // A retry from the caller replays instead of minting again.
    app.tokens.faults().set_latency(Duration::ZERO).await;
    let replay = app
        .coordinator
        .uploads
        .upload(upload_request("B1", "0.0.111"))
        .await
        .unwrap();
    assert!(replay.replayed);
    assert_eq!(app.tokens.mint_count().await, 1);
    assert_eq!(app.log_events("BatchUploaded").await.len(), 1);
}

#[tokio::test]
async fn aborted_verify_still_reaches_the_log() {
    let app = &TestApp::new();
    let sender = address("0.0.111");
    app.registry.faults().set_latency(Duration::from_millis(100)).await;

    let gateway = app.coordinator.gateway.clone();
    let handle = tokio::spawn(async move { gateway.verify(sender).await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    handle.abort();
    assert!(handle.await.unwrap_err().is_cancelled());

    let logged =
        eventually(|| async move { !app.log_events("ManufacturerVerified").await.is_empty() })
            .await;
    assert!(logged);
    assert!(app.registry.is_verified(&sender).await);

    let events = app
        .coordinator
        .recorder
        .events_for(&sender.subject_key())
        .await
        .unwrap();
    assert_eq!(events.len(), 1);
    assert!(events[0].is_acknowledged());
    assert_eq!(app.log_events("ManufacturerVerified").await.len(), 1);
}

// ============================================================================
// Manufacturer journal recovery
// ============================================================================

#[tokio::test]
async fn unjournaled_verify_is_rerecorded_by_reconciliation() {
    let app = TestApp::new();
    let sender = address("0.0.111");

    app.store.fail_writes_to(collections::EVENTS, true);
    app.store.fail_writes_to(collections::SUBJECTS, true);
    let verified = app.coordinator.gateway.verify(sender).await.unwrap();
    assert!(verified.audit_pending);
    assert!(verified.receipt.is_none());
    assert!(app.log_events("ManufacturerVerified").await.is_empty());

    app.store.fail_writes_to(collections::EVENTS, false);
    app.store.fail_writes_to(collections::SUBJECTS, false);
    let report = app.coordinator.reconciler.run_once().await.unwrap();
    assert_eq!(report.manufacturers_rerecorded, 1);

    let logged = app.log_events("ManufacturerVerified").await;
    assert_eq!(logged.len(), 1);
    assert_eq!(logged[0]["address"], "0.0.111");
    assert_eq!(logged[0]["txHash"], verified.tx_hash.as_str());
}
