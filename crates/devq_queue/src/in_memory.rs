//! An authoritative, in-process store implementing the queue protocol.
//!
//! This is the store a queue service keeps behind its REST contract; it is also what workers and
//! run trackers are tested against.

use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use devq_utils::{
    protocol::{Job, JobId, Outcome, ReportedOutcome, ResultsPage, RunId, WorkerId},
    time::EpochMillis,
};
use parking_lot::Mutex;

use crate::{JobSource, QueueError};

#[derive(Default, Debug)]
struct RunState {
    /// Jobs not yet claimed, in enqueue order.
    pending: VecDeque<Job>,
    /// Which worker claimed each job of the run that has been handed out.
    claimed: HashMap<JobId, WorkerId>,
    /// Append-only log of recorded outcomes; cursors index into it.
    results: Vec<ReportedOutcome>,
    /// Every job enqueued for the run.
    jobs: Vec<JobId>,
}

/// Only open runs are kept in full. Closing a run discards its jobs and results, leaving just its
/// id, so that late traffic for it is recognized and dropped.
#[derive(Default, Debug)]
struct QueueState {
    /// Open runs in the order they were first enqueued; jobs are handed out run-by-run.
    run_order: Vec<RunId>,
    runs: HashMap<RunId, RunState>,
    /// Run of every job of an open run.
    job_runs: HashMap<JobId, RunId>,
    /// Jobs of open runs that have a recorded outcome.
    reported: HashMap<JobId, Outcome>,
    closed_runs: HashSet<RunId>,
}

/// Concurrently-accessible job store for any number of runs.
///
/// All mutations happen under a single lock, held only for the bookkeeping of one request.
#[derive(Default, Debug)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs of the run that were claimed by some worker.
    pub fn claimed_count(&self, run_id: &RunId) -> usize {
        let state = self.state.lock();
        state.runs.get(run_id).map_or(0, |run| run.claimed.len())
    }

    /// Number of jobs of the run still waiting to be claimed.
    pub fn pending_count(&self, run_id: &RunId) -> usize {
        let state = self.state.lock();
        state.runs.get(run_id).map_or(0, |run| run.pending.len())
    }

    /// The worker that claimed a job, if any did.
    pub fn claimant(&self, job_id: &JobId) -> Option<WorkerId> {
        let state = self.state.lock();
        let run_id = state.job_runs.get(job_id)?;
        state.runs.get(run_id)?.claimed.get(job_id).cloned()
    }
}

#[async_trait]
impl JobSource for InMemoryQueue {
    async fn enqueue(&self, run_id: &RunId, jobs: Vec<Job>) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let QueueState {
            run_order,
            runs,
            job_runs,
            closed_runs,
            ..
        } = &mut *state;

        if closed_runs.contains(run_id) {
            tracing::warn!(
                %run_id,
                num_jobs = jobs.len(),
                "dropping jobs enqueued for a closed run"
            );
            return Ok(());
        }

        if !runs.contains_key(run_id) {
            run_order.push(run_id.clone());
        }
        let run = runs.entry(run_id.clone()).or_default();

        let num_jobs = jobs.len();
        for job in jobs {
            devq_utils::log_assert!(
                &job.run_id == run_id,
                %run_id, job_run_id = %job.run_id, "job enqueued under a different run"
            );
            if job_runs.contains_key(&job.id) {
                tracing::warn!(%run_id, job_id = %job.id, "ignoring job enqueued twice");
                continue;
            }
            job_runs.insert(job.id.clone(), run_id.clone());
            run.jobs.push(job.id.clone());
            run.pending.push_back(job);
        }

        tracing::debug!(%run_id, num_jobs, "enqueued jobs");
        Ok(())
    }

    async fn pull_next(&self, worker: &WorkerId) -> Result<Option<Job>, QueueError> {
        let mut state = self.state.lock();
        let QueueState {
            run_order, runs, ..
        } = &mut *state;

        for run_id in run_order.iter() {
            let Some(run) = runs.get_mut(run_id) else {
                continue;
            };
            if let Some(job) = run.pending.pop_front() {
                run.claimed.insert(job.id.clone(), worker.clone());
                tracing::debug!(
                    %run_id,
                    job_id = %job.id,
                    %worker,
                    attempt = job.attempt,
                    "job claimed"
                );
                return Ok(Some(job));
            }
        }

        Ok(None)
    }

    async fn report_outcome(&self, job_id: &JobId, outcome: Outcome) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let QueueState {
            runs,
            job_runs,
            reported,
            ..
        } = &mut *state;

        let run_id = match job_runs.get(job_id) {
            Some(run_id) => run_id,
            None => {
                tracing::info!(
                    %job_id,
                    %outcome,
                    "ignoring outcome reported for an unknown job, or a job of a closed run"
                );
                return Ok(());
            }
        };

        if let Some(recorded) = reported.get(job_id) {
            if recorded != &outcome {
                tracing::warn!(
                    %job_id,
                    %recorded,
                    duplicate = %outcome,
                    "ignoring conflicting duplicate report"
                );
            } else {
                tracing::debug!(%job_id, "ignoring duplicate report");
            }
            return Ok(());
        }

        let Some(run) = runs.get_mut(run_id) else {
            devq_utils::illegal_state!("job of an open run has no run state", %run_id, %job_id);
            return Ok(());
        };

        reported.insert(job_id.clone(), outcome.clone());
        run.results.push(ReportedOutcome {
            job_id: job_id.clone(),
            run_id: run_id.clone(),
            outcome,
            reported_at: EpochMillis::now(),
        });

        Ok(())
    }

    async fn results_since(&self, run_id: &RunId, cursor: u64) -> Result<ResultsPage, QueueError> {
        let state = self.state.lock();
        let results = match state.runs.get(run_id) {
            Some(run) => &run.results,
            None => return Ok(ResultsPage::default()),
        };

        let start = std::cmp::min(cursor as usize, results.len());
        Ok(ResultsPage {
            outcomes: results[start..].to_vec(),
            next: results.len() as u64,
        })
    }

    async fn close_run(&self, run_id: &RunId) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let QueueState {
            run_order,
            runs,
            job_runs,
            reported,
            closed_runs,
        } = &mut *state;

        if !closed_runs.insert(run_id.clone()) {
            return Ok(());
        }

        if let Some(run) = runs.remove(run_id) {
            run_order.retain(|open| open != run_id);
            for job_id in &run.jobs {
                job_runs.remove(job_id);
                reported.remove(job_id);
            }
            if !run.pending.is_empty() {
                tracing::info!(
                    %run_id,
                    num_jobs = run.pending.len(),
                    "run closed with unclaimed jobs"
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use devq_test_utils::{job, tc};
    use devq_utils::protocol::{Outcome, RunId, WorkerId};
    use tracing_test::traced_test;

    use super::InMemoryQueue;
    use crate::JobSource;

    fn worker(n: usize) -> WorkerId {
        WorkerId(format!("worker-{n}"))
    }

    #[tokio::test]
    async fn pull_in_enqueue_order_then_empty() {
        let queue = InMemoryQueue::new();
        let run_id = RunId::unique();
        let jobs = vec![job(&run_id, tc("a")), job(&run_id, tc("b"))];
        queue.enqueue(&run_id, jobs.clone()).await.unwrap();

        let first = queue.pull_next(&worker(1)).await.unwrap();
        let second = queue.pull_next(&worker(2)).await.unwrap();
        let third = queue.pull_next(&worker(1)).await.unwrap();

        assert_eq!(first.as_ref(), Some(&jobs[0]));
        assert_eq!(second.as_ref(), Some(&jobs[1]));
        assert_eq!(third, None);

        assert_eq!(queue.claimed_count(&run_id), 2);
        assert_eq!(queue.claimant(&jobs[1].id), Some(worker(2)));
    }

    #[tokio::test]
    async fn results_are_paged_by_cursor() {
        let queue = InMemoryQueue::new();
        let run_id = RunId::unique();
        let jobs = vec![job(&run_id, tc("a")), job(&run_id, tc("b"))];
        queue.enqueue(&run_id, jobs.clone()).await.unwrap();

        queue
            .report_outcome(&jobs[0].id, Outcome::Passed)
            .await
            .unwrap();
        let page = queue.results_since(&run_id, 0).await.unwrap();
        assert_eq!(page.outcomes.len(), 1);
        assert_eq!(page.next, 1);

        queue
            .report_outcome(
                &jobs[1].id,
                Outcome::Failed {
                    detail: "boom".to_owned(),
                },
            )
            .await
            .unwrap();
        let page = queue.results_since(&run_id, page.next).await.unwrap();
        assert_eq!(page.outcomes.len(), 1);
        assert_eq!(page.outcomes[0].job_id, jobs[1].id);
        assert_eq!(page.next, 2);

        let empty = queue.results_since(&run_id, 2).await.unwrap();
        assert!(empty.outcomes.is_empty());
        assert_eq!(empty.next, 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn duplicate_reports_are_idempotent() {
        let queue = InMemoryQueue::new();
        let run_id = RunId::unique();
        let the_job = job(&run_id, tc("a"));
        queue.enqueue(&run_id, vec![the_job.clone()]).await.unwrap();

        for _ in 0..3 {
            queue
                .report_outcome(&the_job.id, Outcome::Passed)
                .await
                .unwrap();
        }
        queue
            .report_outcome(
                &the_job.id,
                Outcome::Failed {
                    detail: "late".to_owned(),
                },
            )
            .await
            .unwrap();

        let page = queue.results_since(&run_id, 0).await.unwrap();
        assert_eq!(page.outcomes.len(), 1);
        assert_eq!(page.outcomes[0].outcome, Outcome::Passed);
        assert!(logs_contain("ignoring conflicting duplicate report"));
    }

    #[tokio::test]
    #[traced_test]
    async fn unknown_job_report_is_a_no_op() {
        let queue = InMemoryQueue::new();
        let run_id = RunId::unique();
        let never_enqueued = job(&run_id, tc("ghost"));

        let ack = queue
            .report_outcome(&never_enqueued.id, Outcome::Passed)
            .await;
        assert!(ack.is_ok());
        assert!(logs_contain("unknown job"));
    }

    #[tokio::test]
    #[traced_test]
    async fn closed_runs_hand_out_no_more_work_and_drop_reports() {
        let queue = InMemoryQueue::new();
        let run_id = RunId::unique();
        let jobs = vec![job(&run_id, tc("a")), job(&run_id, tc("b"))];
        queue.enqueue(&run_id, jobs.clone()).await.unwrap();

        let claimed = queue.pull_next(&worker(1)).await.unwrap().unwrap();
        queue.close_run(&run_id).await.unwrap();

        assert_eq!(queue.pull_next(&worker(2)).await.unwrap(), None);
        assert_eq!(queue.pending_count(&run_id), 0);

        queue
            .report_outcome(&claimed.id, Outcome::Passed)
            .await
            .unwrap();
        let page = queue.results_since(&run_id, 0).await.unwrap();
        assert!(page.outcomes.is_empty());

        queue
            .enqueue(&run_id, vec![job(&run_id, tc("c"))])
            .await
            .unwrap();
        assert_eq!(queue.pull_next(&worker(2)).await.unwrap(), None);
        assert!(logs_contain("dropping jobs enqueued for a closed run"));
    }

    #[tokio::test]
    async fn closed_runs_leave_only_their_id_behind() {
        let queue = InMemoryQueue::new();
        let mut closed_jobs = vec![];
        for n in 0..500 {
            let run_id = RunId::unique();
            let jobs = vec![job(&run_id, tc(&format!("a{n}"))), job(&run_id, tc("b"))];
            queue.enqueue(&run_id, jobs).await.unwrap();
            let claimed = queue.pull_next(&worker(1)).await.unwrap().unwrap();
            queue
                .report_outcome(&claimed.id, Outcome::Passed)
                .await
                .unwrap();
            queue.close_run(&run_id).await.unwrap();
            closed_jobs.push(claimed);
        }

        let live = RunId::unique();
        let live_job = job(&live, tc("live"));
        queue.enqueue(&live, vec![live_job.clone()]).await.unwrap();

        assert_eq!(queue.pull_next(&worker(2)).await.unwrap(), Some(live_job));
        {
            let state = queue.state.lock();
            assert_eq!(state.run_order, vec![live.clone()]);
            assert_eq!(state.runs.len(), 1);
            assert_eq!(state.job_runs.len(), 1);
            assert!(state.reported.is_empty());
            assert_eq!(state.closed_runs.len(), 500);
        }

        // Late reports for closed runs are acknowledged and leave no trace.
        let late = &closed_jobs[0];
        queue
            .report_outcome(&late.id, Outcome::Passed)
            .await
            .unwrap();
        assert!(queue
            .results_since(&late.run_id, 0)
            .await
            .unwrap()
            .outcomes
            .is_empty());
        assert!(queue.state.lock().reported.is_empty());
    }

    #[tokio::test]
    async fn jobs_are_handed_out_across_runs() {
        let queue = InMemoryQueue::new();
        let run1 = RunId::unique();
        let run2 = RunId::unique();
        queue
            .enqueue(&run1, vec![job(&run1, tc("a"))])
            .await
            .unwrap();
        queue
            .enqueue(&run2, vec![job(&run2, tc("b"))])
            .await
            .unwrap();

        let first = queue.pull_next(&worker(1)).await.unwrap().unwrap();
        let second = queue.pull_next(&worker(1)).await.unwrap().unwrap();
        assert_eq!(first.run_id, run1);
        assert_eq!(second.run_id, run2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_pulls_claim_every_job_exactly_once() {
        let num_jobs = 1_000;
        let num_workers = 16;

        let queue = Arc::new(InMemoryQueue::new());
        let run_id = RunId::unique();
        let jobs: Vec<_> = (0..num_jobs)
            .map(|i| job(&run_id, tc(&format!("test{i}"))))
            .collect();
        queue.enqueue(&run_id, jobs).await.unwrap();

        let mut handles = Vec::with_capacity(num_workers);
        for n in 0..num_workers {
            let queue = queue.clone();
            handles.push(tokio::spawn(async move {
                let mut claimed = vec![];
                while let Some(job) = queue.pull_next(&worker(n)).await.unwrap() {
                    claimed.push(job.id);
                }
                claimed
            }));
        }

        let mut all_claimed = vec![];
        for handle in handles {
            all_claimed.extend(handle.await.unwrap());
        }
        let total = all_claimed.len();
        all_claimed.sort();
        all_claimed.dedup();

        assert_eq!(total, num_jobs);
        assert_eq!(all_claimed.len(), num_jobs);
        assert_eq!(queue.claimed_count(&run_id), num_jobs);
    }
}
