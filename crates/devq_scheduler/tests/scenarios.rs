//! Runs driven end to end: a run submitted through the scheduler, drained by in-process workers
//! with scripted devices.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use async_trait::async_trait;
use devq_queue::{in_memory::InMemoryQueue, JobSource, QueueError, SharedJobSource};
use devq_scheduler::{
    execute_run,
    result::{LostReason, Verdict},
    tracker::{PlannedTest, RetryPolicy, RunPlan},
    RunConfig,
};
use devq_test_utils::{artifacts, device, scratch_dir, tc};
use devq_utils::{
    decay::ExpDecay,
    oneshot_notify::{self, OneshotTx},
    protocol::{Job, JobId, Outcome, ResultsPage, RunId, WorkerId},
};
use devq_workers::{
    artifacts::ArtifactFetcher,
    testing::{Script, ScriptedDriver, StaticArtifacts},
    worker::{Worker, WorkerConfig, WorkerExit},
};
use ntest::timeout;
use tempfile::TempDir;
use tokio::task::JoinHandle;

fn plan(names: &[&str]) -> RunPlan {
    RunPlan {
        run_id: RunId::unique(),
        tests: names
            .iter()
            .map(|name| PlannedTest {
                test_case: tc(name),
                device: device(),
            })
            .collect(),
        artifacts: artifacts(),
    }
}

fn run_config(retry_budget: u32, run_timeout: Duration) -> RunConfig {
    RunConfig {
        poll_interval: Duration::from_millis(2),
        ..RunConfig::new(
            RetryPolicy {
                retry_budget,
                retry_failed_tests: false,
            },
            run_timeout,
        )
    }
}

struct SpawnedWorker {
    _shutdown: OneshotTx,
    handle: JoinHandle<WorkerExit>,
    _cache: TempDir,
}

fn spawn_worker(
    source: SharedJobSource,
    driver: &ScriptedDriver,
    test_timeout: Duration,
) -> SpawnedWorker {
    let cache = scratch_dir();
    let fetcher = ArtifactFetcher::new(Arc::new(StaticArtifacts::default()), cache.path());
    let config = WorkerConfig {
        test_timeout,
        idle_grace_period: Some(Duration::from_millis(300)),
        pull_backoff: ExpDecay::constant(Duration::from_millis(2)),
        ..WorkerConfig::new(WorkerId::unique())
    };
    let worker = Worker::new(config, source, driver.clone(), fetcher);
    let (tx, rx) = oneshot_notify::make_pair();
    SpawnedWorker {
        _shutdown: tx,
        handle: tokio::spawn(worker.run(rx)),
        _cache: cache,
    }
}

async fn join(workers: Vec<SpawnedWorker>) -> Vec<WorkerExit> {
    let mut exits = Vec::new();
    for worker in workers {
        exits.push(worker.handle.await.unwrap());
    }
    exits
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[timeout(10000)]
async fn all_pass_first_time() {
    let queue = Arc::new(InMemoryQueue::new());
    let drivers = [ScriptedDriver::default(), ScriptedDriver::default()];
    let workers = drivers
        .iter()
        .map(|d| spawn_worker(queue.clone(), d, Duration::from_secs(5)))
        .collect();

    let result = execute_run(
        queue.clone(),
        plan(&["a", "b", "c"]),
        &run_config(2, Duration::from_secs(5)),
    )
    .await
    .unwrap();

    assert_eq!(result.verdict, Verdict::Success);
    assert!(result.lost.is_empty());
    assert_eq!(result.passed.len(), 3);
    assert!(result.passed.iter().all(|p| p.attempts == 1 && !p.flaky));
    join(workers).await;
}

#[tokio::test]
#[timeout(10000)]
async fn timeouts_are_retried_until_pass() {
    let queue = Arc::new(InMemoryQueue::new());
    let driver = ScriptedDriver::default();
    driver.script("t1", [Script::Hang, Script::Hang]);
    let workers = vec![spawn_worker(queue.clone(), &driver, Duration::from_millis(50))];

    let result = execute_run(
        queue.clone(),
        plan(&["t1", "t2"]),
        &run_config(2, Duration::from_secs(5)),
    )
    .await
    .unwrap();

    assert_eq!(result.verdict, Verdict::Success);
    assert_eq!(result.attempts_of(&tc("t1")), Some(3));
    assert_eq!(result.attempts_of(&tc("t2")), Some(1));
    let flaky: Vec<_> = result.flaky().map(|p| p.test_case.name.clone()).collect();
    assert_eq!(flaky, vec!["t1".to_owned()]);
    // Each hang cost a device.
    assert_eq!(driver.stats().started, 3);
    join(workers).await;
}

#[tokio::test]
#[timeout(10000)]
async fn persistent_timeouts_exhaust_the_budget_and_are_lost() {
    let queue = Arc::new(InMemoryQueue::new());
    let driver = ScriptedDriver::default();
    driver.script("t1", [Script::Hang, Script::Hang, Script::Hang]);
    let workers = vec![spawn_worker(queue.clone(), &driver, Duration::from_millis(30))];

    let result = execute_run(
        queue.clone(),
        plan(&["t1"]),
        &run_config(2, Duration::from_secs(5)),
    )
    .await
    .unwrap();

    assert_eq!(result.verdict, Verdict::Failure);
    assert!(result.failed.is_empty(), "a timeout is never a test failure");
    assert_eq!(result.lost[0].reason, LostReason::RetriesExhausted);
    assert_eq!(result.lost[0].attempts, 3);
    join(workers).await;
}

#[tokio::test]
#[timeout(10000)]
async fn in_flight_job_at_run_timeout_is_lost() {
    let queue = Arc::new(InMemoryQueue::new());
    let driver = ScriptedDriver::default();
    driver.script("slow", [Script::Delay(Duration::from_millis(400))]);
    let workers = vec![spawn_worker(queue.clone(), &driver, Duration::from_secs(5))];

    let plan = plan(&["slow"]);
    let run_id = plan.run_id.clone();
    let result = execute_run(
        queue.clone(),
        plan,
        &run_config(2, Duration::from_millis(100)),
    )
    .await
    .unwrap();

    assert!(result.timed_out);
    assert_eq!(result.verdict, Verdict::Failure);
    assert_eq!(result.lost.len(), 1);
    assert_eq!(result.lost[0].reason, LostReason::NeverReported);

    // The worker finishes and reports; the closed run drops the report.
    let exits = join(workers).await;
    assert_eq!(exits[0].jobs_handled, 1);
    assert_eq!(exits[0].reports_dropped, 0);
    assert!(queue.results_since(&run_id, 0).await.unwrap().outcomes.is_empty());
}

/// Delivers every report twice.
struct DoubleReporting(InMemoryQueue);

#[async_trait]
impl JobSource for DoubleReporting {
    async fn enqueue(&self, run_id: &RunId, jobs: Vec<Job>) -> Result<(), QueueError> {
        self.0.enqueue(run_id, jobs).await
    }
    async fn pull_next(&self, worker: &WorkerId) -> Result<Option<Job>, QueueError> {
        self.0.pull_next(worker).await
    }
    async fn report_outcome(&self, job_id: &JobId, outcome: Outcome) -> Result<(), QueueError> {
        self.0.report_outcome(job_id, outcome.clone()).await?;
        self.0.report_outcome(job_id, outcome).await
    }
    async fn results_since(&self, run_id: &RunId, cursor: u64) -> Result<ResultsPage, QueueError> {
        self.0.results_since(run_id, cursor).await
    }
    async fn close_run(&self, run_id: &RunId) -> Result<(), QueueError> {
        self.0.close_run(run_id).await
    }
}

#[tokio::test]
#[timeout(10000)]
async fn duplicate_reports_do_not_change_the_result() {
    let queue = Arc::new(DoubleReporting(InMemoryQueue::new()));
    let driver = ScriptedDriver::default();
    driver.script("a", [Script::Crash("dex error".to_owned())]);
    let workers = vec![spawn_worker(queue.clone(), &driver, Duration::from_secs(5))];

    let result = execute_run(
        queue.clone(),
        plan(&["a", "b"]),
        &run_config(1, Duration::from_secs(5)),
    )
    .await
    .unwrap();

    assert_eq!(result.verdict, Verdict::Success);
    assert_eq!(result.attempts_of(&tc("a")), Some(2));
    assert_eq!(result.attempts_of(&tc("b")), Some(1));
    join(workers).await;
}

#[tokio::test]
#[timeout(10000)]
async fn failed_test_is_not_retried() {
    let queue = Arc::new(InMemoryQueue::new());
    let driver = ScriptedDriver::default();
    driver.script("bad", [Script::Fail("expected 200, got 500".to_owned())]);
    let workers = vec![spawn_worker(queue.clone(), &driver, Duration::from_secs(5))];

    let result = execute_run(
        queue.clone(),
        plan(&["good", "bad"]),
        &run_config(3, Duration::from_secs(5)),
    )
    .await
    .unwrap();

    assert_eq!(result.verdict, Verdict::Failure);
    assert_eq!(result.failed.len(), 1);
    assert_eq!(result.failed[0].test_case, tc("bad"));
    assert_eq!(result.failed[0].attempts, 1);
    assert_eq!(result.failed[0].detail, "expected 200, got 500");
    assert!(result.lost.is_empty());

    join(workers).await;
    let bad_runs = driver
        .executed_tests()
        .into_iter()
        .filter(|name| name == "bad")
        .count();
    assert_eq!(bad_runs, 1);
}

/// Accepts the initial submission promptly, then stalls every later enqueue.
struct StallingRetries {
    queue: InMemoryQueue,
    enqueues: AtomicUsize,
    stall: Duration,
}

#[async_trait]
impl JobSource for StallingRetries {
    async fn enqueue(&self, run_id: &RunId, jobs: Vec<Job>) -> Result<(), QueueError> {
        if self.enqueues.fetch_add(1, Ordering::SeqCst) > 0 {
            tokio::time::sleep(self.stall).await;
        }
        self.queue.enqueue(run_id, jobs).await
    }
    async fn pull_next(&self, worker: &WorkerId) -> Result<Option<Job>, QueueError> {
        self.queue.pull_next(worker).await
    }
    async fn report_outcome(&self, job_id: &JobId, outcome: Outcome) -> Result<(), QueueError> {
        self.queue.report_outcome(job_id, outcome).await
    }
    async fn results_since(&self, run_id: &RunId, cursor: u64) -> Result<ResultsPage, QueueError> {
        self.queue.results_since(run_id, cursor).await
    }
    async fn close_run(&self, run_id: &RunId) -> Result<(), QueueError> {
        self.queue.close_run(run_id).await
    }
}

#[tokio::test]
#[timeout(10000)]
async fn run_timeout_holds_while_a_retry_is_stuck_enqueueing() {
    let queue = Arc::new(StallingRetries {
        queue: InMemoryQueue::new(),
        enqueues: AtomicUsize::new(0),
        stall: Duration::from_secs(3),
    });
    let driver = ScriptedDriver::default();
    driver.script("a", [Script::Crash("instrumentation died".to_owned())]);
    let workers = vec![spawn_worker(queue.clone(), &driver, Duration::from_secs(5))];

    let started = Instant::now();
    let result = execute_run(
        queue.clone(),
        plan(&["a"]),
        &run_config(2, Duration::from_millis(400)),
    )
    .await
    .unwrap();
    let took = started.elapsed();

    assert!(took < Duration::from_secs(1), "verdict took {took:?}");
    assert!(result.timed_out);
    assert_eq!(result.verdict, Verdict::Failure);
    assert_eq!(result.lost.len(), 1);
    assert_eq!(result.lost[0].reason, LostReason::NeverReported);
    assert_eq!(result.lost[0].attempts, 1);
    assert!(matches!(
        result.lost[0].last_outcome,
        Some(Outcome::CrashedProcess { .. })
    ));

    join(workers).await;
}
