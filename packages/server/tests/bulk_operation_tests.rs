//! Integration tests for the bulk operation runner over the in-memory store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use automation_core::common::{BulkOperationId, EngineError, MemberId, PageArgs, SiteId};
use automation_core::config::EngineConfig;
use automation_core::domains::bulk_operations::{
    BulkAction, BulkOperation, BulkOperationRunner, BulkOperationStatus, SubmitBulkOperation,
};
use automation_core::kernel::{
    MockRemoteActionClient, RemoteActionError, RemoteCall, TestDependencies,
};
use serde_json::json;

use crate::common::create_test_site;

fn runner(deps: &TestDependencies) -> Arc<BulkOperationRunner> {
    Arc::new(BulkOperationRunner::new(
        deps.server_deps(),
        &EngineConfig::default(),
    ))
}

async fn wait_for_terminal(
    runner: &BulkOperationRunner,
    owner: MemberId,
    id: BulkOperationId,
) -> BulkOperation {
    for _ in 0..250 {
        let op = runner.get_status(owner, id).await.unwrap();
        if op.status.is_terminal() {
            return op;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("bulk operation {id} did not finish");
}

// =============================================================================
// Outcomes
// =============================================================================

#[tokio::test]
async fn bulk_delete_with_failures_completes_with_errors() {
    let deps =
        TestDependencies::new().with_remote(MockRemoteActionClient::new().failing_ids([3, 7]));
    let owner = MemberId::new();
    let site = create_test_site(deps.store.as_ref(), owner, true).await;
    let runner = runner(&deps);

    let queued = runner
        .submit(
            owner,
            SubmitBulkOperation::new(BulkAction::Delete, site.id, (1..=10).collect()),
        )
        .await
        .unwrap();
    assert_eq!(queued.status, BulkOperationStatus::Queued);
    assert_eq!(queued.total, 10);

    let finished = wait_for_terminal(&runner, owner, queued.id).await;
    assert_eq!(finished.status, BulkOperationStatus::CompletedWithErrors);
    assert_eq!(finished.total, 10);
    assert_eq!(finished.processed, 10);
    assert_eq!(finished.succeeded, 8);
    assert_eq!(finished.failed, 2);
    assert!(finished.finished_at.is_some());

    let mut failed_ids: Vec<i64> = finished.errors.0.iter().map(|e| e.target_id).collect();
    failed_ids.sort();
    assert_eq!(failed_ids, vec![3, 7]);
}

#[tokio::test]
async fn all_items_succeeding_completes() {
    let deps = TestDependencies::new();
    let owner = MemberId::new();
    let site = create_test_site(deps.store.as_ref(), owner, true).await;
    let runner = runner(&deps);

    let queued = runner
        .submit(
            owner,
            SubmitBulkOperation::new(BulkAction::Unpublish, site.id, vec![11, 12, 12, 13]),
        )
        .await
        .unwrap();
    // Duplicates are dropped at submit.
    assert_eq!(queued.total, 3);

    let finished = wait_for_terminal(&runner, owner, queued.id).await;
    assert_eq!(finished.status, BulkOperationStatus::Completed);
    assert_eq!(finished.succeeded, 3);
    assert!(finished.errors.0.is_empty());

    let mut targets: Vec<i64> = deps
        .remote
        .calls()
        .iter()
        .filter_map(RemoteCall::target_id)
        .collect();
    targets.sort();
    assert_eq!(targets, vec![11, 12, 13]);
}

#[tokio::test]
async fn all_items_failing_is_still_completed_with_errors() {
    let deps = TestDependencies::new().with_remote(
        MockRemoteActionClient::new()
            .failing_id_with(1, RemoteActionError::Permanent("forbidden".into()))
            .failing_id_with(2, RemoteActionError::Permanent("forbidden".into())),
    );
    let owner = MemberId::new();
    let site = create_test_site(deps.store.as_ref(), owner, true).await;
    let runner = runner(&deps);

    let queued = runner
        .submit(
            owner,
            SubmitBulkOperation::new(BulkAction::Publish, site.id, vec![1, 2]),
        )
        .await
        .unwrap();

    let finished = wait_for_terminal(&runner, owner, queued.id).await;
    assert_eq!(finished.status, BulkOperationStatus::CompletedWithErrors);
    assert_eq!(finished.failed, 2);
    assert!(finished.errors.0[0].message.contains("forbidden"));
}

#[tokio::test]
async fn missing_credentials_fail_without_running_items() {
    let deps = TestDependencies::new();
    let owner = MemberId::new();
    let site = create_test_site(deps.store.as_ref(), owner, false).await;
    let runner = runner(&deps);

    let queued = runner
        .submit(
            owner,
            SubmitBulkOperation::new(BulkAction::Delete, site.id, vec![1, 2, 3]),
        )
        .await
        .unwrap();

    let finished = wait_for_terminal(&runner, owner, queued.id).await;
    assert_eq!(finished.status, BulkOperationStatus::Failed);
    assert_eq!(finished.processed, 0);
    assert!(finished
        .fatal_error
        .as_deref()
        .is_some_and(|e| e.contains("credentials")));
    assert!(deps.remote.calls().is_empty());
}

#[tokio::test]
async fn update_metadata_sends_fields_to_every_target() {
    let deps = TestDependencies::new();
    let owner = MemberId::new();
    let site = create_test_site(deps.store.as_ref(), owner, true).await;
    let runner = runner(&deps);
    let fields = json!({"categories": [5], "tags": [9]});

    let queued = runner
        .submit(
            owner,
            SubmitBulkOperation::new(BulkAction::UpdateMetadata, site.id, vec![21, 22])
                .with_metadata(fields.clone()),
        )
        .await
        .unwrap();
    wait_for_terminal(&runner, owner, queued.id).await;

    let calls = deps.remote.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls
        .iter()
        .all(|c| matches!(c, RemoteCall::UpdateMetadata(_, f) if *f == fields)));
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_flight_calls_never_exceed_pool_size() {
    let deps = TestDependencies::new()
        .with_remote(MockRemoteActionClient::new().with_delay(Duration::from_millis(30)));
    let owner = MemberId::new();
    let site = create_test_site(deps.store.as_ref(), owner, true).await;
    let config = EngineConfig::builder().bulk_concurrency(3).build();
    let runner = Arc::new(BulkOperationRunner::new(deps.server_deps(), &config));

    let queued = runner
        .submit(
            owner,
            SubmitBulkOperation::new(BulkAction::Delete, site.id, (1..=20).collect()),
        )
        .await
        .unwrap();
    let finished = wait_for_terminal(&runner, owner, queued.id).await;

    assert_eq!(finished.succeeded, 20);
    assert!(deps.remote.max_in_flight() <= 3);
    assert!(deps.remote.max_in_flight() >= 2);
}

#[tokio::test]
async fn progress_is_visible_while_running() {
    let deps = TestDependencies::new()
        .with_remote(MockRemoteActionClient::new().with_delay(Duration::from_millis(50)));
    let owner = MemberId::new();
    let site = create_test_site(deps.store.as_ref(), owner, true).await;
    let config = EngineConfig::builder().bulk_concurrency(1).build();
    let runner = Arc::new(BulkOperationRunner::new(deps.server_deps(), &config));

    let queued = runner
        .submit(
            owner,
            SubmitBulkOperation::new(BulkAction::Delete, site.id, (1..=6).collect()),
        )
        .await
        .unwrap();

    let mut seen = Vec::new();
    loop {
        let op = runner.get_status(owner, queued.id).await.unwrap();
        seen.push(op.processed);
        if op.status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {seen:?}");
    assert_eq!(seen.last(), Some(&6));
    assert!(seen.iter().any(|p| *p > 0 && *p < 6));
}

// =============================================================================
// Validation and scoping
// =============================================================================

#[tokio::test]
async fn submit_rejects_bad_requests() {
    let deps = TestDependencies::new();
    let owner = MemberId::new();
    let site = create_test_site(deps.store.as_ref(), owner, true).await;
    let runner = runner(&deps);

    let empty = runner
        .submit(owner, SubmitBulkOperation::new(BulkAction::Delete, site.id, vec![]))
        .await;
    assert!(matches!(empty, Err(EngineError::Validation(_))));

    let unknown_site = runner
        .submit(
            owner,
            SubmitBulkOperation::new(BulkAction::Delete, SiteId::new(), vec![1]),
        )
        .await;
    assert!(matches!(unknown_site, Err(EngineError::NotFound { .. })));

    let someone_else = runner
        .submit(
            MemberId::new(),
            SubmitBulkOperation::new(BulkAction::Delete, site.id, vec![1]),
        )
        .await;
    assert!(matches!(someone_else, Err(EngineError::NotFound { .. })));
}

#[tokio::test]
async fn operations_are_scoped_and_paginated() {
    let deps = TestDependencies::new();
    let owner = MemberId::new();
    let site = create_test_site(deps.store.as_ref(), owner, true).await;
    let runner = runner(&deps);

    let mut ids = Vec::new();
    for n in 0..3 {
        let op = runner
            .submit(
                owner,
                SubmitBulkOperation::new(BulkAction::Delete, site.id, vec![n + 1]),
            )
            .await
            .unwrap();
        ids.push(op.id);
    }

    let first = runner.list(owner, &PageArgs::new(2, None)).await.unwrap();
    assert_eq!(first.items.len(), 2);
    assert!(first.page_info.has_next_page);
    // Newest first.
    assert_eq!(first.items[0].id, ids[2]);

    let second = runner
        .list(owner, &PageArgs::new(2, first.page_info.end_cursor.clone()))
        .await
        .unwrap();
    assert_eq!(second.items.len(), 1);
    assert_eq!(second.items[0].id, ids[0]);
    assert!(!second.page_info.has_next_page);

    let stranger = runner
        .list(MemberId::new(), &PageArgs::default())
        .await
        .unwrap();
    assert!(stranger.items.is_empty());
    assert!(matches!(
        runner.get_status(MemberId::new(), ids[0]).await,
        Err(EngineError::NotFound { .. })
    ));
}

#[tokio::test]
async fn abandoned_operations_fail_on_recovery() {
    let deps = TestDependencies::new()
        .with_remote(MockRemoteActionClient::new().with_delay(Duration::from_secs(5)));
    let owner = MemberId::new();
    let site = create_test_site(deps.store.as_ref(), owner, true).await;
    let runner = runner(&deps);

    let queued = runner
        .submit(
            owner,
            SubmitBulkOperation::new(BulkAction::Delete, site.id, vec![1]),
        )
        .await
        .unwrap();

    // A fresh process finds the operation unfinished.
    let recovered = runner.recover_abandoned().await.unwrap();
    assert_eq!(recovered, 1);

    let op = runner.get_status(owner, queued.id).await.unwrap();
    assert_eq!(op.status, BulkOperationStatus::Failed);
    assert_eq!(op.fatal_error.as_deref(), Some("interrupted by restart"));
}
