//! Bounded worker pool for chunk jobs.
//!
//! ## Shape
//!
//! ```text
//! jobs ──▶ [queue] ──▶ worker 0 ─┐
//!                 ├──▶ worker 1 ─┼──▶ (index, result) ──▶ ResultAggregator
//!                 └──▶ worker W ─┘
//! ```
//!
//! Every job is queued up front. `min(W, n)` workers pull from the shared
//! queue, so at most `W` jobs run at once and each job is taken exactly once.
//! Results travel back tagged with their sequence index; the aggregator
//! writes each into its own slot, so completion order never matters.

use crate::error::DocParseError;
use crate::output::ChunkResult;
use crate::pipeline::aggregate::ResultAggregator;
use crate::pipeline::planner::ChunkSpec;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

/// Terminal state of a job. Jobs start `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Succeeded,
    Failed,
}

/// A chunk bound to one execution.
#[derive(Debug)]
pub struct Job {
    pub chunk: ChunkSpec,
    pub attempts: u32,
    pub status: JobStatus,
}

impl Job {
    pub fn new(chunk: ChunkSpec) -> Self {
        Self {
            chunk,
            attempts: 0,
            status: JobStatus::Pending,
        }
    }

    fn finish(&mut self, result: &ChunkResult) {
        self.attempts = result.attempts;
        self.status = if result.is_success() {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        };
    }
}

/// Executes one chunk to a terminal result.
///
/// Implementations never fail: every problem is folded into the returned
/// [`ChunkResult`]'s `error`.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, chunk: &ChunkSpec, total_chunks: usize) -> ChunkResult;
}

#[derive(Debug, Clone, Copy)]
pub struct Scheduler {
    workers: usize,
}

impl Scheduler {
    pub fn new(workers: usize) -> Result<Self, DocParseError> {
        if workers == 0 {
            return Err(DocParseError::InvalidConfig(
                "worker count must be ≥ 1, got 0".into(),
            ));
        }
        Ok(Self { workers })
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Run every chunk to a terminal state and return results in index order.
    pub async fn run(
        &self,
        chunks: Vec<ChunkSpec>,
        runner: Arc<dyn JobRunner>,
    ) -> Result<Vec<ChunkResult>, DocParseError> {
        let mut aggregator = ResultAggregator::new(&chunks);
        let total = chunks.len();
        if total == 0 {
            return Ok(aggregator.into_results());
        }

        let (job_tx, job_rx) = mpsc::channel::<Job>(total);
        for chunk in chunks {
            job_tx
                .try_send(Job::new(chunk))
                .map_err(|e| DocParseError::Internal(format!("job queue: {e}")))?;
        }
        drop(job_tx);

        let queue = Arc::new(Mutex::new(job_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<ChunkResult>(total);
        let worker_count = self.workers.min(total);
        info!("Dispatching {} chunks to {} workers", total, worker_count);

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count {
            let queue = Arc::clone(&queue);
            let results = result_tx.clone();
            let runner = Arc::clone(&runner);
            workers.spawn(async move {
                loop {
                    // The lock is held only while taking the next job.
                    let next = queue.lock().await.recv().await;
                    let Some(mut job) = next else { break };

                    let result = runner.run(&job.chunk, total).await;
                    job.finish(&result);
                    debug!(
                        "Worker {}: chunk {} {:?} after {} attempts",
                        worker_id, job.chunk.index, job.status, job.attempts
                    );
                    if results.send(result).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(result_tx);

        while let Some(result) = result_rx.recv().await {
            aggregator.place(result)?;
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!("Chunk worker stopped abnormally: {}", e);
            }
        }

        Ok(aggregator.into_results())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChunkError;
    use crate::pipeline::planner::plan_chunks;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Sleeps longer for lower indices so completion order is reversed, and
    /// records the peak number of concurrently running jobs.
    struct ReversingRunner {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        runs: std::sync::Mutex<Vec<usize>>,
        fail: Option<usize>,
    }

    impl ReversingRunner {
        fn new(fail: Option<usize>) -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                runs: std::sync::Mutex::new(Vec::new()),
                fail,
            }
        }
    }

    #[async_trait]
    impl JobRunner for ReversingRunner {
        async fn run(&self, chunk: &ChunkSpec, total: usize) -> ChunkResult {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.runs.lock().unwrap().push(chunk.index);

            let delay = 10 * (total - chunk.index) as u64;
            tokio::time::sleep(Duration::from_millis(delay)).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.fail == Some(chunk.index) {
                ChunkResult::failed(
                    chunk.index,
                    chunk.pages,
                    ChunkError::RetryExhausted {
                        index: chunk.index,
                        attempts: 3,
                        detail: "boom".into(),
                    },
                )
            } else {
                ChunkResult::succeeded(chunk.index, chunk.pages, format!("text{}", chunk.index))
            }
        }
    }

    #[tokio::test]
    async fn results_come_back_in_index_order() {
        let chunks = plan_chunks("doc", 12, 5).unwrap();
        let runner = Arc::new(ReversingRunner::new(None));
        let results = Scheduler::new(3)
            .unwrap()
            .run(chunks, runner.clone())
            .await
            .unwrap();

        let texts: Vec<_> = results.iter().map(|r| r.text.as_str()).collect();
        assert_eq!(texts, vec!["text0", "text1", "text2"]);
        assert_eq!(results[2].pages.end, 12);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_worker_count() {
        let chunks = plan_chunks("doc", 40, 2).unwrap();
        let runner = Arc::new(ReversingRunner::new(None));
        let results = Scheduler::new(3)
            .unwrap()
            .run(chunks, runner.clone())
            .await
            .unwrap();

        assert_eq!(results.len(), 20);
        let peak = runner.peak.load(Ordering::SeqCst);
        assert!(peak <= 3, "peak concurrency {peak}");
        assert!(peak >= 2, "pool never ran jobs in parallel");
    }

    #[tokio::test]
    async fn every_job_runs_exactly_once() {
        let chunks = plan_chunks("doc", 23, 3).unwrap();
        let runner = Arc::new(ReversingRunner::new(None));
        Scheduler::new(4)
            .unwrap()
            .run(chunks, runner.clone())
            .await
            .unwrap();

        let mut runs = runner.runs.lock().unwrap().clone();
        runs.sort_unstable();
        assert_eq!(runs, (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn failure_keeps_its_slot() {
        let chunks = plan_chunks("doc", 9, 3).unwrap();
        let runner = Arc::new(ReversingRunner::new(Some(1)));
        let results = Scheduler::new(2)
            .unwrap()
            .run(chunks, runner)
            .await
            .unwrap();

        assert!(results[0].is_success());
        assert!(!results[1].is_success());
        assert!(results[2].is_success());
    }

    #[tokio::test]
    async fn empty_plan_returns_immediately() {
        let runner = Arc::new(ReversingRunner::new(None));
        let results = Scheduler::new(2)
            .unwrap()
            .run(Vec::new(), runner)
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn zero_workers_is_a_config_error() {
        assert!(matches!(
            Scheduler::new(0),
            Err(DocParseError::InvalidConfig(_))
        ));
    }

    #[test]
    fn job_finish_records_terminal_state() {
        let chunk = plan_chunks("doc", 5, 5).unwrap().remove(0);
        let mut job = Job::new(chunk.clone());
        assert_eq!(job.status, JobStatus::Pending);
        let mut result = ChunkResult::succeeded(0, chunk.pages, "x");
        result.attempts = 2;
        job.finish(&result);
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempts, 2);
    }
}
