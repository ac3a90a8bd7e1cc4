use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use runq_persist::{SqliteQueueBackend, SqliteStore};
use runq_queue::shutdown::request_stop;
use runq_queue::{FailureOutcome, JobState, NewJob, QueueBackend, QueueError, Worker, WorkerConfig};
use tokio_util::sync::CancellationToken;

async fn memory_backend() -> (SqliteStore, SqliteQueueBackend) {
    let store = SqliteStore::memory().await.unwrap();
    let backend = SqliteQueueBackend::from_store(&store);
    (store, backend)
}

/// Pull a rescheduled job's backoff into the past so it can be claimed again
async fn make_eligible(store: &SqliteStore, id: &str) {
    sqlx::query("UPDATE jobs SET scheduled_at = '2000-01-01T00:00:00.000Z' WHERE id = ?")
        .bind(id)
        .execute(store.pool())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_job_is_claimable_immediately() -> Result<(), Box<dyn std::error::Error>> {
    let (_store, backend) = memory_backend().await;

    // scheduled_at and the claim's "now" must compare correctly as text
    let id = backend.enqueue(NewJob::new("echo hi")).await?;
    let job = backend.claim_next("w1").await?;

    assert!(job.is_some(), "Job enqueued for now should be claimable");
    let job = job.unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.state, JobState::Processing);
    assert_eq!(job.worker_id.as_deref(), Some("w1"));

    let stored = backend.get(&id).await?.unwrap();
    assert_eq!(stored.state, JobState::Processing);
    assert!(backend.claim_next("w2").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_future_job_not_claimable() {
    let (_store, backend) = memory_backend().await;
    backend
        .enqueue(NewJob::new("true").run_at(Utc::now() + chrono::Duration::seconds(30)))
        .await
        .unwrap();
    assert!(backend.claim_next("w1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_claim_order_priority_then_age() {
    let (_store, backend) = memory_backend().await;

    let a = backend.enqueue(NewJob::new("a")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let c = backend
        .enqueue(NewJob::new("c").with_priority(5))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let b = backend
        .enqueue(NewJob::new("b").with_priority(5))
        .await
        .unwrap();

    let mut order = Vec::new();
    while let Some(job) = backend.claim_next("w1").await.unwrap() {
        order.push(job.id);
    }
    assert_eq!(order, vec![c, b, a]);
}

#[tokio::test]
async fn test_concurrent_workers_never_share_a_job() {
    const WORKERS: usize = 8;
    const JOBS: usize = 40;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");

    let seed = SqliteQueueBackend::from_store(&SqliteStore::open_path(&path).await.unwrap());
    for i in 0..JOBS {
        seed.enqueue(NewJob::new(format!("echo {i}"))).await.unwrap();
    }

    // One store per worker, like separate processes sharing the file
    let mut handles = Vec::new();
    for w in 0..WORKERS {
        let store = SqliteStore::open_path(&path).await.unwrap();
        let backend = SqliteQueueBackend::from_store(&store);
        handles.push(tokio::spawn(async move {
            let worker_id = format!("w{w}");
            let mut claimed = Vec::new();
            loop {
                match backend.claim_next(&worker_id).await {
                    Ok(Some(job)) => claimed.push((job.id, worker_id.clone())),
                    Ok(None) => {
                        let status = backend.status().await.unwrap();
                        if status.count(JobState::Pending) == 0 {
                            break;
                        }
                    }
                    Err(e) if e.is_transient() => continue,
                    Err(e) => panic!("claim failed: {e}"),
                }
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for claimed in futures::future::join_all(handles).await {
        all.extend(claimed.unwrap());
    }

    let unique: HashSet<_> = all.iter().map(|(id, _)| id.clone()).collect();
    assert_eq!(all.len(), JOBS, "every job claimed exactly once");
    assert_eq!(unique.len(), JOBS);

    for (id, worker_id) in &all {
        let job = seed.get(id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.worker_id.as_ref(), Some(worker_id));
    }
}

#[tokio::test]
async fn test_backoff_grows_as_base_pow_attempts() {
    let (store, backend) = memory_backend().await;
    let id = backend
        .enqueue(NewJob::new("false").with_max_retries(5))
        .await
        .unwrap();

    let mut delays = Vec::new();
    for attempt in 1..=3u32 {
        make_eligible(&store, &id).await;
        backend.claim_next("w1").await.unwrap().unwrap();

        let before = Utc::now();
        let outcome = backend.fail(&id, "exit code 1").await.unwrap();
        let FailureOutcome::Retrying {
            attempts,
            scheduled_at,
        } = outcome
        else {
            panic!("expected retry, got {outcome:?}");
        };
        assert_eq!(attempts, attempt);

        let job = backend.get(&id).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.scheduled_at, scheduled_at);
        assert_eq!(job.last_error.as_deref(), Some("exit code 1"));

        let delay = (scheduled_at - before).num_milliseconds();
        let expected = 2i64.pow(attempt) * 1000;
        assert!(
            (expected - 50..=expected + 1000).contains(&delay),
            "attempt {attempt}: delay {delay}ms, expected ~{expected}ms"
        );
        delays.push(delay);
    }
    assert!(delays.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_backoff_uses_configured_base() {
    let (_store, backend) = memory_backend().await;
    backend.set_config("backoff_base", "3").await.unwrap();
    let id = backend.enqueue(NewJob::new("false")).await.unwrap();
    backend.claim_next("w1").await.unwrap().unwrap();

    let before = Utc::now();
    let FailureOutcome::Retrying { scheduled_at, .. } = backend.fail(&id, "boom").await.unwrap()
    else {
        panic!("expected retry");
    };
    let delay = (scheduled_at - before).num_milliseconds();
    assert!((2950..=4000).contains(&delay), "delay {delay}ms");
}

#[tokio::test]
async fn test_dead_letter_after_retries_exhausted() {
    let (store, backend) = memory_backend().await;
    let id = backend
        .enqueue(NewJob::new("false").with_max_retries(3))
        .await
        .unwrap();

    let mut last = None;
    for _ in 0..4 {
        make_eligible(&store, &id).await;
        backend.claim_next("w1").await.unwrap().unwrap();
        last = Some(backend.fail(&id, "exit code 1").await.unwrap());
    }
    assert_eq!(last, Some(FailureOutcome::DeadLettered { attempts: 4 }));

    assert!(backend.get(&id).await.unwrap().is_none());
    let dlq = backend.dlq_list().await.unwrap();
    assert_eq!(dlq.len(), 1);
    assert_eq!(dlq[0].id, id);
    assert_eq!(dlq[0].reason.as_deref(), Some("exit code 1"));
    assert_eq!(dlq[0].original_job.attempts, 4);
    assert_eq!(dlq[0].original_job.command, "false");
}

#[tokio::test]
async fn test_success_after_retries_does_not_dead_letter() {
    let (store, backend) = memory_backend().await;
    let id = backend
        .enqueue(NewJob::new("flaky").with_max_retries(3))
        .await
        .unwrap();

    for _ in 0..3 {
        make_eligible(&store, &id).await;
        backend.claim_next("w1").await.unwrap().unwrap();
        backend.fail(&id, "exit code 1").await.unwrap();
    }
    make_eligible(&store, &id).await;
    backend.claim_next("w1").await.unwrap().unwrap();
    backend.complete(&id).await.unwrap();

    let job = backend.get(&id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts, 3);
    assert_eq!(job.last_error, None);
    assert!(backend.dlq_list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dlq_retry_round_trip() {
    let (_store, backend) = memory_backend().await;
    let id = backend
        .enqueue(NewJob::new("exit 2").with_id("nightly-report").with_max_retries(0).with_priority(7))
        .await
        .unwrap();
    backend.claim_next("w1").await.unwrap().unwrap();
    backend.fail(&id, "exit code 2").await.unwrap();
    assert_eq!(backend.dlq_list().await.unwrap().len(), 1);

    assert!(backend.dlq_retry(&id).await.unwrap());

    let job = backend.get(&id).await.unwrap().unwrap();
    assert_eq!(job.id, "nightly-report");
    assert_eq!(job.command, "exit 2");
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.priority, 7);
    assert_eq!(job.last_error, None);
    assert_eq!(job.worker_id, None);
    assert!(backend.dlq_list().await.unwrap().is_empty());
    assert!(backend.claim_next("w1").await.unwrap().is_some());
}

#[tokio::test]
async fn test_dlq_retry_missing_id() {
    let (_store, backend) = memory_backend().await;
    backend.enqueue(NewJob::new("true").with_id("keep")).await.unwrap();

    assert!(!backend.dlq_retry("ghost").await.unwrap());
    assert_eq!(backend.list(None, 10, 0).await.unwrap().len(), 1);
    assert!(backend.dlq_list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_dlq_retry_conflict_rolls_back() {
    let (_store, backend) = memory_backend().await;
    let id = backend
        .enqueue(NewJob::new("false").with_id("dup").with_max_retries(0))
        .await
        .unwrap();
    backend.claim_next("w1").await.unwrap().unwrap();
    backend.fail(&id, "exit code 1").await.unwrap();

    // An active job reusing the id blocks the re-insert
    backend.enqueue(NewJob::new("true").with_id("dup")).await.unwrap();
    let err = backend.dlq_retry("dup").await.unwrap_err();
    assert!(matches!(err, QueueError::AlreadyExists(_)));

    // The dead-letter entry survives the failed transaction
    assert_eq!(backend.dlq_list().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_duplicate_id_rejected() {
    let (_store, backend) = memory_backend().await;
    backend.enqueue(NewJob::new("true").with_id("same")).await.unwrap();
    let err = backend
        .enqueue(NewJob::new("false").with_id("same"))
        .await
        .unwrap_err();
    assert!(matches!(err, QueueError::AlreadyExists(id) if id == "same"));
}

#[tokio::test]
async fn test_list_newest_first_with_pagination() {
    let (_store, backend) = memory_backend().await;
    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(backend.enqueue(NewJob::new(format!("echo {i}"))).await.unwrap());
        tokio::time::sleep(Duration::from_millis(3)).await;
    }
    backend.claim_next("w1").await.unwrap().unwrap();

    let page: Vec<_> = backend
        .list(None, 2, 1)
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(page, vec![ids[3].clone(), ids[2].clone()]);

    let processing = backend.list(Some(JobState::Processing), 10, 0).await.unwrap();
    assert_eq!(processing.len(), 1);
    assert_eq!(processing[0].id, ids[0]);
    assert_eq!(backend.list(Some(JobState::Pending), 10, 0).await.unwrap().len(), 4);
}

#[tokio::test]
async fn test_status_counts_and_workers() {
    let (_store, backend) = memory_backend().await;
    let done = backend.enqueue(NewJob::new("true")).await.unwrap();
    backend.enqueue(NewJob::new("true")).await.unwrap();
    backend.enqueue(NewJob::new("true")).await.unwrap();
    backend.claim_next("w1").await.unwrap().unwrap();
    backend.complete(&done).await.unwrap();

    backend.register_worker("w1").await.unwrap();
    backend.register_worker("w2").await.unwrap();
    backend.mark_stopping("w2").await.unwrap();

    let status = backend.status().await.unwrap();
    assert_eq!(status.count(JobState::Completed), 1);
    assert_eq!(status.count(JobState::Pending), 2);
    assert_eq!(status.count(JobState::Processing), 0);
    assert_eq!(status.workers.len(), 2);
    let w2 = status.workers.iter().find(|w| w.id == "w2").unwrap();
    assert!(w2.stopping);

    // Re-registering clears the stopping flag
    backend.register_worker("w2").await.unwrap();
    backend.unregister_worker("w1").await.unwrap();
    let status = backend.status().await.unwrap();
    assert_eq!(status.workers.len(), 1);
    assert!(!status.workers[0].stopping);
}

#[tokio::test]
async fn test_config_seeding_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");

    let store = SqliteStore::open_path(&path).await.unwrap();
    let backend = SqliteQueueBackend::from_store(&store);
    assert_eq!(backend.get_config("backoff_base").await.unwrap().as_deref(), Some("2"));
    backend.set_config("backoff_base", "5").await.unwrap();
    backend.set_config("max_retries", "7").await.unwrap();
    store.close().await;

    let store = SqliteStore::open_path(&path).await.unwrap();
    let backend = SqliteQueueBackend::from_store(&store);
    assert_eq!(backend.get_config("backoff_base").await.unwrap().as_deref(), Some("5"));
    assert_eq!(backend.get_config("poll_interval_ms").await.unwrap().as_deref(), Some("500"));

    let settings = backend.settings().await.unwrap();
    assert_eq!(settings.backoff_base, 5);
    assert_eq!(settings.max_retries, 7);

    // New jobs pick up the configured retry budget
    let id = backend.enqueue(NewJob::new("true")).await.unwrap();
    assert_eq!(backend.get(&id).await.unwrap().unwrap().max_retries, 7);
}

#[tokio::test]
async fn test_set_config_validates_known_keys() {
    let (_store, backend) = memory_backend().await;
    assert!(matches!(
        backend.set_config("max_retries", "lots").await,
        Err(QueueError::InvalidInput(_))
    ));
    assert_eq!(backend.get_config("max_retries").await.unwrap().as_deref(), Some("3"));

    backend.set_config("owner", "ops").await.unwrap();
    assert_eq!(backend.get_config("owner").await.unwrap().as_deref(), Some("ops"));
    assert_eq!(backend.get_config("missing").await.unwrap(), None);
}

#[tokio::test]
async fn test_out_of_range_run_at_is_rejected() {
    let (_store, backend) = memory_backend().await;
    let normal = backend.enqueue(NewJob::new("true")).await.unwrap();

    let job: NewJob =
        serde_json::from_str(r#"{"command": "true", "run_at": "+10000-01-01T00:00:00Z"}"#).unwrap();
    let err = backend.enqueue(job).await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidInput(_)));

    // Nothing unreadable was stored, so the queue keeps working
    assert_eq!(backend.list(None, 10, 0).await.unwrap().len(), 1);
    let claimed = backend.claim_next("w1").await.unwrap().unwrap();
    assert_eq!(claimed.id, normal);
}

#[tokio::test]
async fn test_stale_outcome_reports_are_rejected() {
    let (_store, backend) = memory_backend().await;
    let id = backend.enqueue(NewJob::new("true")).await.unwrap();

    assert!(matches!(
        backend.complete(&id).await,
        Err(QueueError::NotProcessing(_))
    ));
    assert!(matches!(
        backend.fail(&id, "boom").await,
        Err(QueueError::NotProcessing(_))
    ));

    backend.claim_next("w1").await.unwrap().unwrap();
    backend.complete(&id).await.unwrap();
    assert!(matches!(
        backend.fail(&id, "late").await,
        Err(QueueError::NotProcessing(_))
    ));

    let job = backend.get(&id).await.unwrap().unwrap();
    assert_eq!(job.state, JobState::Completed);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.last_error, None);
}

#[tokio::test]
async fn test_worker_stops_gracefully_on_durable_store() {
    let dir = tempfile::tempdir().unwrap();
    let log_dir = dir.path().join("logs");
    let store = SqliteStore::open_path(dir.path().join("queue.db")).await.unwrap();
    let backend = Arc::new(SqliteQueueBackend::from_store(&store).with_log_dir(&log_dir));

    let slow = backend.enqueue(NewJob::new("sleep 0.5")).await.unwrap();
    let config = WorkerConfig {
        poll_interval: Duration::from_millis(20),
        log_dir,
        error_backoff: Duration::from_millis(20),
    };
    let worker = Worker::new("w1", backend.clone(), config);
    let token = CancellationToken::new();
    let handle = {
        let token = token.clone();
        tokio::spawn(async move { worker.run(token).await })
    };

    let mut claimed = false;
    for _ in 0..200 {
        let job = backend.get(&slow).await.unwrap().unwrap();
        if job.state == JobState::Processing {
            claimed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(claimed, "worker never claimed the job");

    let status = backend.status().await.unwrap();
    assert_eq!(status.workers.len(), 1);
    assert_eq!(status.workers[0].id, "w1");
    assert!(!status.workers[0].stopping);

    request_stop(backend.as_ref(), "w1", &token).await;

    // The stop is visible while the job is still running
    let status = backend.status().await.unwrap();
    assert!(status.workers[0].stopping);
    assert_eq!(
        backend.get(&slow).await.unwrap().unwrap().state,
        JobState::Processing
    );
    let later = backend.enqueue(NewJob::new("true")).await.unwrap();

    let processed = handle.await.unwrap().unwrap();
    assert_eq!(processed, 1);

    let slow = backend.get(&slow).await.unwrap().unwrap();
    assert_eq!(slow.state, JobState::Completed);
    assert_eq!(slow.worker_id.as_deref(), Some("w1"));
    let later = backend.get(&later).await.unwrap().unwrap();
    assert_eq!(later.state, JobState::Pending);
    assert!(backend.status().await.unwrap().workers.is_empty());
}
