use std::{collections::HashSet, sync::Arc, time::Duration};

use devq_queue::{in_memory::InMemoryQueue, JobSource};
use devq_test_utils::{job, scratch_dir, tc};
use devq_utils::{
    decay::ExpDecay,
    oneshot_notify,
    protocol::{RunId, WorkerId},
};
use devq_workers::{
    artifacts::ArtifactFetcher,
    testing::{Script, ScriptedDriver, StaticArtifacts},
    worker::{Worker, WorkerConfig, WorkerExitStatus},
};
use ntest::timeout;

fn config(n: usize) -> WorkerConfig {
    WorkerConfig {
        test_timeout: Duration::from_millis(500),
        idle_grace_period: Some(Duration::from_millis(100)),
        pull_backoff: ExpDecay::constant(Duration::from_millis(2)),
        ..WorkerConfig::new(WorkerId(format!("worker-{n}")))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[timeout(20000)]
async fn many_workers_drain_a_shared_queue_exactly_once() {
    const NUM_WORKERS: usize = 4;
    const NUM_TESTS: usize = 40;

    let queue = Arc::new(InMemoryQueue::new());
    let run_id = RunId::unique();
    let jobs: Vec<_> = (0..NUM_TESTS)
        .map(|i| job(&run_id, tc(&format!("test_{i}"))))
        .collect();
    queue.enqueue(&run_id, jobs.clone()).await.unwrap();

    let artifacts = StaticArtifacts::default();
    let mut drivers = Vec::new();
    let mut caches = Vec::new();
    let mut handles = Vec::new();
    for n in 0..NUM_WORKERS {
        let driver = ScriptedDriver::default();
        // Each test takes a moment, so work spreads across workers.
        for i in 0..NUM_TESTS {
            driver.script(
                &format!("test_{i}"),
                [Script::Delay(Duration::from_millis(5))],
            );
        }
        let cache = scratch_dir();
        let fetcher = ArtifactFetcher::new(Arc::new(artifacts.clone()), cache.path());
        let worker = Worker::new(config(n), queue.clone(), driver.clone(), fetcher);

        let (tx, rx) = oneshot_notify::make_pair();
        handles.push((tx, tokio::spawn(worker.run(rx))));
        drivers.push(driver);
        caches.push(cache);
    }

    let mut handled = 0;
    for (_tx, handle) in handles {
        let exit = handle.await.unwrap();
        assert_eq!(exit.status, WorkerExitStatus::Exhausted);
        assert_eq!(exit.reports_dropped, 0);
        handled += exit.jobs_handled;
    }
    assert_eq!(handled, NUM_TESTS);

    let page = queue.results_since(&run_id, 0).await.unwrap();
    assert_eq!(page.outcomes.len(), NUM_TESTS);
    let reported: HashSet<_> = page.outcomes.iter().map(|o| o.job_id.clone()).collect();
    let expected: HashSet<_> = jobs.iter().map(|j| j.id.clone()).collect();
    assert_eq!(reported, expected);

    let mut executed = HashSet::new();
    for driver in &drivers {
        let stats = driver.stats();
        assert!(stats.max_live <= 1, "a worker ran two devices at once");
        for name in driver.executed_tests() {
            assert!(executed.insert(name), "a test was executed twice");
        }
    }
    assert_eq!(executed.len(), NUM_TESTS);
}
