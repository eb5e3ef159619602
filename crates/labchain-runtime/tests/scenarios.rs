mod common;

use common::{eventually, Harness, HarnessOptions};
use labchain_chain::{ChainCall, ChainCaller};
use labchain_runtime::{CURRENT_LINK, DATASET_ENV};
use labchain_storage::{ContentStore, MemoryBackend, MemoryContentStore, StorageBackend};
use labchain_types::{BizCode, EntityType, ExecStatus, ReviewStatus, TxStatus};
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test]
async fn submission_confirmed_schedules_resolve_at_window_end() {
    let h = Harness::new(HarnessOptions::default()).await;
    h.start().await;
    let cid = h.upload_valid_bundle().await;

    let (execution, tx_hash) = h
        .submitter
        .submit_algorithm("cbc", "https://example.org", &cid, "blood", "0xscientist")
        .await
        .unwrap();
    assert_eq!(execution.status, ExecStatus::Queued);
    assert_eq!(execution.review_status, ReviewStatus::Reviewing);

    let notification = h.notifier.register(&tx_hash).await.await.unwrap();
    assert_eq!(notification.code, BizCode::Success);
    assert_eq!(notification.data.unwrap().status, TxStatus::Confirmed);

    let stored = h.execution(execution.id).await;
    let (start, end) = (stored.vote_start_time.unwrap(), stored.vote_end_time.unwrap());
    assert_eq!((end - start).num_seconds(), 3600);
    assert_eq!(h.scheduled("resolve"), 1);

    // The window is an hour out: nothing has been resolved yet.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!h
        .chain
        .calls()
        .await
        .iter()
        .any(|c| matches!(c, ChainCall::Resolve { .. })));
    assert_eq!(h.execution(execution.id).await.review_status, ReviewStatus::Reviewing);
}

#[tokio::test]
async fn approved_review_runs_to_completion() {
    let h = Harness::new(HarnessOptions {
        voting_duration: Duration::from_millis(300),
        ..Default::default()
    })
    .await;
    h.seed_blood_dataset().await;
    h.start().await;
    let cid = h.upload_valid_bundle().await;

    let (execution, tx_hash) = h
        .submitter
        .submit_algorithm("cbc", "https://example.org", &cid, "blood", "0xscientist")
        .await
        .unwrap();
    h.notifier.register(&tx_hash).await.await.unwrap();
    h.chain.cast_vote(execution.id, "0xmember", true).await.unwrap();

    let storage = h.storage.clone();
    let id = execution.id;
    eventually(|| {
        let storage = storage.clone();
        async move {
            storage.get_execution(id).await.unwrap().status == ExecStatus::Completed
        }
    })
    .await;

    let done = h.execution(execution.id).await;
    assert_eq!(done.review_status, ReviewStatus::Approved);
    assert_eq!(done.result, "42");
    assert!(done.start_time.is_some() && done.end_time.is_some());
    assert_eq!(h.scheduled("run"), 1);
    assert_eq!(h.storage.list_votes(&cid).await.unwrap().len(), 1);

    let builds = h.runner.builds.lock().await.clone();
    assert_eq!(builds.len(), 1);
    assert_eq!(builds[0].1, format!("labchain-algorithm-{}", done.algorithm_id));

    let runs = h.runner.runs.lock().await.clone();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].env, vec![(DATASET_ENV.to_string(), "/data".to_string())]);
    assert!(runs[0].mounts[0].read_only);
    assert_eq!(runs[0].mounts[0].target, "/data");
    assert_eq!(runs[0].dataset_files, vec!["blood.csv".to_string()]);

    eventually(|| {
        let storage = storage.clone();
        async move { storage.list_data_usage().await.unwrap().len() == 1 }
    })
    .await;
    let usage = h.storage.list_data_usage().await.unwrap().remove(0);
    assert_eq!(usage.algo_cid, cid);
    assert_eq!(usage.dataset, "blood");
    assert!(h.chain.calls().await.iter().any(|c| matches!(
        c,
        ChainCall::RecordUsage { dataset, .. } if dataset == "blood"
    )));

    // The run released its pin.
    let version = h.datasets.current_version().await.unwrap();
    assert_eq!(h.datasets.refcount(&version).await, Some(0));
}

#[tokio::test]
async fn rejected_review_never_runs() {
    let h = Harness::new(HarnessOptions {
        voting_duration: Duration::from_millis(200),
        ..Default::default()
    })
    .await;
    h.start().await;
    let cid = h.upload_valid_bundle().await;

    let (execution, _) = h
        .submitter
        .submit_algorithm("cbc", "", &cid, "blood", "0xscientist")
        .await
        .unwrap();
    h.chain.cast_vote(execution.id, "0xmember", false).await.unwrap();

    let storage = h.storage.clone();
    let id = execution.id;
    eventually(|| {
        let storage = storage.clone();
        async move {
            storage.get_execution(id).await.unwrap().review_status == ReviewStatus::Rejected
        }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.scheduled("run"), 0);
    assert_eq!(h.execution(id).await.status, ExecStatus::Queued);
}

#[tokio::test]
async fn completed_run_records_output_and_usage() {
    let h = Harness::new(HarnessOptions::default()).await;
    h.seed_blood_dataset().await;
    let cid = h.upload_valid_bundle().await;
    let execution = h.seed_confirmed_execution(&cid, "blood").await;

    h.orchestrator.run_execution(execution.id).await;

    let done = h.execution(execution.id).await;
    assert_eq!(done.status, ExecStatus::Completed);
    assert_eq!(done.result, "42");
    assert!(done.error_msg.is_empty());

    let usage = h.storage.list_data_usage().await.unwrap();
    assert_eq!(usage.len(), 1);
    assert_eq!(usage[0].scientist_wallet, "0xscientist");

    let record = h
        .chain
        .calls()
        .await
        .into_iter()
        .find(|c| matches!(c, ChainCall::RecordUsage { .. }))
        .unwrap();
    let ChainCall::RecordUsage { used_at, .. } = record else {
        unreachable!()
    };
    assert_eq!(used_at, usage[0].used_at);
}

#[tokio::test]
async fn algorithm_reported_failure_still_completes() {
    let h = Harness::new(HarnessOptions {
        stdout: "partial",
        success: false,
        ..Default::default()
    })
    .await;
    h.seed_blood_dataset().await;
    let cid = h.upload_valid_bundle().await;
    let execution = h.seed_confirmed_execution(&cid, "blood").await;

    h.orchestrator.run_execution(execution.id).await;

    let done = h.execution(execution.id).await;
    assert_eq!(done.status, ExecStatus::Completed);
    assert_eq!(done.result, "partial");
    assert_eq!(done.error_msg, "boom");
}

#[tokio::test]
async fn failed_usage_record_rolls_back_usage_row() {
    let h = Harness::new(HarnessOptions::default()).await;
    h.seed_blood_dataset().await;
    let cid = h.upload_valid_bundle().await;
    let execution = h.seed_confirmed_execution(&cid, "blood").await;
    h.chain.fail_record_usage(true).await;

    h.orchestrator.run_execution(execution.id).await;

    assert_eq!(h.execution(execution.id).await.status, ExecStatus::Completed);
    assert!(h.storage.list_data_usage().await.unwrap().is_empty());
}

#[tokio::test]
async fn two_root_bundle_fails_without_building() {
    let h = Harness::new(HarnessOptions::default()).await;
    h.seed_blood_dataset().await;
    let cid = h.upload_bundle(&["algo", "extra"], true).await;
    let execution = h.seed_confirmed_execution(&cid, "blood").await;

    h.orchestrator.run_execution(execution.id).await;

    let failed = h.execution(execution.id).await;
    assert_eq!(failed.status, ExecStatus::Failed);
    assert!(failed.end_time.is_some());
    assert!(h.runner.builds.lock().await.is_empty());
    assert!(h.runner.runs.lock().await.is_empty());
    assert_eq!(h.metrics.runs_failed.get(), 1);
}

#[tokio::test]
async fn missing_dataset_fails_and_keeps_no_pin() {
    let h = Harness::new(HarnessOptions::default()).await;
    let cid = h.upload_valid_bundle().await;
    let execution = h.seed_confirmed_execution(&cid, "__static__missing").await;

    h.orchestrator.run_execution(execution.id).await;

    assert_eq!(h.execution(execution.id).await.status, ExecStatus::Failed);
    assert_eq!(h.runner.builds.lock().await.len(), 1);
    assert!(h.runner.runs.lock().await.is_empty());
}

#[tokio::test]
async fn concurrent_acquires_share_a_pinned_version() {
    let h = Harness::new(HarnessOptions::default()).await;
    let published = h.datasets.export().await.unwrap();

    let (a, b) = tokio::join!(
        h.datasets.acquire_current(CURRENT_LINK),
        h.datasets.acquire_current(CURRENT_LINK)
    );
    let (path, version) = a.unwrap();
    assert_eq!(b.unwrap().1, version);
    assert_eq!(version, published);
    assert_eq!(h.datasets.refcount(&version).await, Some(2));

    h.datasets.export().await.unwrap();
    h.datasets.cleanup().await.unwrap();
    assert!(path.is_dir());

    h.datasets.release(CURRENT_LINK, &version).await;
    h.datasets.release(CURRENT_LINK, &version).await;
    assert_eq!(h.datasets.cleanup().await.unwrap(), vec![version]);
    assert!(!path.exists());
}

#[tokio::test]
async fn restart_reruns_interrupted_execution() {
    let dir = TempDir::new().unwrap();
    let snapshot = dir.path().join("state.json");
    let store = MemoryContentStore::new();

    let (execution_id, cid) = {
        let h = Harness::build(
            TempDir::new().unwrap(),
            MemoryBackend::open(&snapshot).await.unwrap(),
            store.clone(),
            HarnessOptions::default(),
        )
        .await;
        let cid = h.upload_valid_bundle().await;
        let execution = h.seed_confirmed_execution(&cid, "blood").await;
        h.storage
            .update_review_status(execution.id, ReviewStatus::Approved)
            .await
            .unwrap();
        h.storage
            .update_execution_status(execution.id, ExecStatus::Running)
            .await
            .unwrap();
        (execution.id, cid)
    };

    let h = Harness::build(
        TempDir::new().unwrap(),
        MemoryBackend::open(&snapshot).await.unwrap(),
        store,
        HarnessOptions::default(),
    )
    .await;
    assert_eq!(h.execution(execution_id).await.status, ExecStatus::Running);
    h.seed_blood_dataset().await;
    h.start_scheduler();

    assert_eq!(h.orchestrator.recover_pending(&h.scheduler).await.unwrap(), 1);
    let storage = h.storage.clone();
    eventually(|| {
        let storage = storage.clone();
        async move {
            storage.get_execution(execution_id).await.unwrap().status == ExecStatus::Completed
        }
    })
    .await;
    assert_eq!(h.runner.builds.lock().await.len(), 1);
    assert!(h.store.download(&cid).await.is_ok());
}

#[tokio::test]
async fn recovery_resolves_elapsed_review() {
    let h = Harness::new(HarnessOptions::default()).await;
    let cid = h.upload_valid_bundle().await;
    let execution = h.seed_confirmed_execution(&cid, "blood").await;
    h.chain.submit_algorithm(execution.id, &cid).await.unwrap();
    let now = chrono::Utc::now();
    h.storage
        .update_vote_window(
            execution.id,
            now - chrono::Duration::hours(2),
            now - chrono::Duration::hours(1),
        )
        .await
        .unwrap();
    h.start().await;

    assert_eq!(h.sync.recover_resolve_tasks().await.unwrap(), 1);

    let storage = h.storage.clone();
    let id = execution.id;
    eventually(|| {
        let storage = storage.clone();
        async move {
            storage.get_execution(id).await.unwrap().review_status == ReviewStatus::Rejected
        }
    })
    .await;
}

#[tokio::test]
async fn recovery_can_skip_elapsed_review() {
    let h = Harness::new(HarnessOptions {
        resolve_elapsed_on_recovery: false,
        ..Default::default()
    })
    .await;
    let cid = h.upload_valid_bundle().await;
    let elapsed = h.seed_confirmed_execution(&cid, "blood").await;
    let open = h.seed_confirmed_execution(&cid, "blood").await;
    let now = chrono::Utc::now();
    h.storage
        .update_vote_window(elapsed.id, now - chrono::Duration::hours(2), now - chrono::Duration::hours(1))
        .await
        .unwrap();
    h.storage
        .update_vote_window(open.id, now, now + chrono::Duration::hours(1))
        .await
        .unwrap();

    assert_eq!(h.sync.recover_resolve_tasks().await.unwrap(), 1);
    assert_eq!(h.scheduled("resolve"), 1);
}

#[tokio::test]
async fn reverted_submission_marks_transaction_failed() {
    let h = Harness::new(HarnessOptions::default()).await;
    h.start().await;
    let cid = h.upload_valid_bundle().await;

    // Fund up front so the reverted transaction is the submission itself.
    h.chain.ensure_wallet_funded("0xscientist").await.unwrap();
    h.chain.revert_next().await;
    let (execution, tx_hash) = h
        .submitter
        .submit_algorithm("cbc", "", &cid, "blood", "0xscientist")
        .await
        .unwrap();

    let notification = h.notifier.register(&tx_hash).await.await.unwrap();
    let row = notification.data.unwrap();
    assert_eq!(row.status, TxStatus::Failed);
    assert_eq!(row.entity_type, EntityType::Execution);

    let stored = h.execution(execution.id).await;
    assert!(stored.vote_end_time.is_none());
    assert_eq!(h.scheduled("resolve"), 0);
    assert!(h.storage.list_reviewing_executions().await.unwrap().is_empty());
}
