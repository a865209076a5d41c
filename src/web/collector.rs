//! Job collection protocol: per-job fragment queues feeding one consumer.
//!
//! Any number of workers push ordered result fragments under a shared job
//! id; the job initiator collects them with a bounded per-fragment wait and
//! reassembles deterministically. Each job owns an independent channel, so
//! collection never blocks on unrelated jobs, and the jobs-table lock is
//! only held for map lookups.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Mutex as TokioMutex;

pub type SharedJobCollector = Arc<JobCollector>;

/// One unit of a worker's output.
#[derive(Debug, Clone)]
pub struct ResultFragment {
    pub worker_id: String,
    pub sequence_index: usize,
    pub payload: Vec<u8>,
    pub is_last: bool,
}

#[derive(Debug, Error, PartialEq)]
pub enum SubmitError {
    /// No queue exists for the job id. Producers racing consumer setup
    /// should retry after another prepare call.
    #[error("job {0} not found or already complete")]
    UnknownJob(String),
}

struct JobQueue {
    tx: UnboundedSender<ResultFragment>,
    /// Taken by the (single) collect call; `None` while collection runs.
    rx: Option<UnboundedReceiver<ResultFragment>>,
}

#[derive(Default)]
pub struct JobCollector {
    jobs: TokioMutex<HashMap<String, JobQueue>>,
}

impl JobCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the queue for a job id. Idempotent; preparing an existing job
    /// is a no-op.
    pub async fn prepare(&self, job_id: &str) {
        let mut jobs = self.jobs.lock().await;
        jobs.entry(job_id.to_string()).or_insert_with(|| {
            crate::log_debug!("Prepared queue for job {}", job_id);
            new_queue()
        });
    }

    /// Producer side: append one fragment. Never blocks.
    pub async fn submit(&self, job_id: &str, fragment: ResultFragment) -> Result<(), SubmitError> {
        let tx = {
            let jobs = self.jobs.lock().await;
            match jobs.get(job_id) {
                Some(queue) => queue.tx.clone(),
                None => return Err(SubmitError::UnknownJob(job_id.to_string())),
            }
        };
        crate::log_debug!(
            "Fragment for job {} from worker {} (index {}, last: {})",
            job_id,
            fragment.worker_id,
            fragment.sequence_index,
            fragment.is_last
        );
        tx.send(fragment)
            .map_err(|_| SubmitError::UnknownJob(job_id.to_string()))
    }

    pub async fn exists(&self, job_id: &str) -> bool {
        self.jobs.lock().await.contains_key(job_id)
    }

    /// Consumer side: drain the job's queue until every expected worker has
    /// sent its `is_last` fragment, or a wait times out.
    ///
    /// Returns payloads in deterministic reassembly order: the caller's own
    /// `local_payloads` first (original order), then workers sorted
    /// lexicographically by id, fragments ordered by sequence index within
    /// each worker. A short return (fewer than expected) signals partial
    /// timeout; that is reported, not an error. The job's queue is always
    /// deleted before returning.
    pub async fn collect(
        &self,
        job_id: &str,
        local_payloads: Vec<Vec<u8>>,
        expected_worker_ids: &[String],
        per_item_timeout: Duration,
    ) -> Vec<Vec<u8>> {
        let mut rx = match self.take_receiver(job_id).await {
            Some(rx) => rx,
            None => {
                // A second concurrent collect for the same job; nothing to drain.
                crate::log_warn!("Job {} is already being collected", job_id);
                return local_payloads;
            }
        };

        let expected: HashSet<&String> = expected_worker_ids.iter().collect();
        let mut done: HashSet<String> = HashSet::new();
        let mut by_worker: BTreeMap<String, BTreeMap<usize, Vec<u8>>> = BTreeMap::new();

        while done.len() < expected.len() {
            match tokio::time::timeout(per_item_timeout, rx.recv()).await {
                Ok(Some(fragment)) => {
                    bucket_fragment(&mut by_worker, &mut done, fragment);
                }
                Ok(None) => {
                    // All senders dropped: the collector was shut down.
                    crate::log_warn!("Collection for job {} cancelled", job_id);
                    break;
                }
                Err(_) => {
                    let missing: Vec<&str> = expected
                        .iter()
                        .filter(|id| !done.contains(id.as_str()))
                        .map(|id| id.as_str())
                        .collect();
                    crate::log_warn!(
                        "Timeout on job {}. Still waiting for workers: {:?}",
                        job_id,
                        missing
                    );
                    // One final non-blocking drain for fragments that raced in.
                    while let Ok(fragment) = rx.try_recv() {
                        bucket_fragment(&mut by_worker, &mut done, fragment);
                    }
                    break;
                }
            }
        }

        self.jobs.lock().await.remove(job_id);

        let collected: usize = by_worker.values().map(BTreeMap::len).sum();
        crate::log_debug!(
            "Job {} collection complete: {} fragment(s) from {} of {} worker(s)",
            job_id,
            collected,
            done.len(),
            expected.len()
        );

        // Master results lead; worker buckets follow in id order, each
        // ordered by sequence index (both BTreeMap-sorted).
        let mut ordered = local_payloads;
        for fragments in by_worker.into_values() {
            ordered.extend(fragments.into_values());
        }
        ordered
    }

    /// Drop every queue. Pending collect calls observe the channel close and
    /// return what they have.
    pub async fn shutdown(&self) {
        self.jobs.lock().await.clear();
    }

    async fn take_receiver(&self, job_id: &str) -> Option<UnboundedReceiver<ResultFragment>> {
        let mut jobs = self.jobs.lock().await;
        let queue = jobs.entry(job_id.to_string()).or_insert_with(|| {
            // Producers may have raced consumer setup; start a fresh queue.
            crate::log_warn!("Queue missing for job {}, creating one", job_id);
            new_queue()
        });
        queue.rx.take()
    }
}

fn new_queue() -> JobQueue {
    let (tx, rx) = mpsc::unbounded_channel();
    JobQueue { tx, rx: Some(rx) }
}

fn bucket_fragment(
    by_worker: &mut BTreeMap<String, BTreeMap<usize, Vec<u8>>>,
    done: &mut HashSet<String>,
    fragment: ResultFragment,
) {
    // Duplicate (worker, index) deliveries collapse here: last write wins.
    by_worker
        .entry(fragment.worker_id.clone())
        .or_default()
        .insert(fragment.sequence_index, fragment.payload);
    if fragment.is_last {
        done.insert(fragment.worker_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(worker: &str, index: usize, payload: &str, is_last: bool) -> ResultFragment {
        ResultFragment {
            worker_id: worker.to_string(),
            sequence_index: index,
            payload: payload.as_bytes().to_vec(),
            is_last,
        }
    }

    fn ids(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_prepare_is_idempotent() {
        let collector = JobCollector::new();
        collector.prepare("j1").await;
        collector
            .submit("j1", fragment("a", 0, "a0", false))
            .await
            .unwrap();
        // Preparing again must not replace the queue (the fragment survives).
        collector.prepare("j1").await;

        let result = collector
            .collect("j1", vec![], &ids(&["a"]), Duration::from_millis(50))
            .await;
        assert_eq!(result, vec![b"a0".to_vec()]);
    }

    #[tokio::test]
    async fn test_submit_without_prepare_is_unknown_job() {
        let collector = JobCollector::new();
        let err = collector
            .submit("nope", fragment("a", 0, "x", true))
            .await
            .unwrap_err();
        assert_eq!(err, SubmitError::UnknownJob("nope".to_string()));
        assert!(!collector.exists("nope").await);
    }

    #[tokio::test]
    async fn test_collect_orders_workers_and_indices() {
        let collector = JobCollector::new();
        collector.prepare("j1").await;

        // Out of order across and within workers.
        collector.submit("j1", fragment("b", 0, "b0", true)).await.unwrap();
        collector.submit("j1", fragment("a", 1, "a1", true)).await.unwrap();
        collector.submit("j1", fragment("a", 0, "a0", false)).await.unwrap();

        let result = collector
            .collect("j1", vec![], &ids(&["a", "b"]), Duration::from_secs(30))
            .await;
        assert_eq!(
            result,
            vec![b"a0".to_vec(), b"a1".to_vec(), b"b0".to_vec()]
        );
        assert!(!collector.exists("j1").await);
    }

    #[tokio::test]
    async fn test_local_payloads_lead_the_output() {
        let collector = JobCollector::new();
        collector.prepare("j1").await;
        collector.submit("j1", fragment("a", 0, "a0", true)).await.unwrap();

        let result = collector
            .collect(
                "j1",
                vec![b"m0".to_vec(), b"m1".to_vec()],
                &ids(&["a"]),
                Duration::from_secs(5),
            )
            .await;
        assert_eq!(
            result,
            vec![b"m0".to_vec(), b"m1".to_vec(), b"a0".to_vec()]
        );
    }

    #[tokio::test]
    async fn test_partial_timeout_returns_finished_workers_only() {
        let collector = JobCollector::new();
        collector.prepare("j1").await;
        collector.submit("j1", fragment("a", 0, "a0", true)).await.unwrap();
        // Worker "b" never reports is_last.

        let result = collector
            .collect("j1", vec![], &ids(&["a", "b"]), Duration::from_millis(100))
            .await;
        assert_eq!(result, vec![b"a0".to_vec()]);
        // Queue is gone immediately after return.
        assert!(!collector.exists("j1").await);
    }

    #[tokio::test]
    async fn test_timeout_drain_picks_up_raced_fragments() {
        let collector = Arc::new(JobCollector::new());
        collector.prepare("j1").await;

        let producer = collector.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            // Lands while the consumer is inside its timed-out wait.
            let _ = producer.submit("j1", fragment("a", 0, "late", true)).await;
        });

        let result = collector
            .collect("j1", vec![], &ids(&["a", "b"]), Duration::from_millis(200))
            .await;
        handle.await.unwrap();
        assert_eq!(result, vec![b"late".to_vec()]);
    }

    #[tokio::test]
    async fn test_concurrent_jobs_do_not_interfere() {
        let collector = Arc::new(JobCollector::new());
        collector.prepare("j1").await;
        collector.prepare("j2").await;

        collector.submit("j1", fragment("a", 0, "j1-a0", true)).await.unwrap();
        collector.submit("j2", fragment("a", 0, "j2-a0", true)).await.unwrap();

        let r1 = collector
            .collect("j1", vec![], &ids(&["a"]), Duration::from_secs(5))
            .await;
        let r2 = collector
            .collect("j2", vec![], &ids(&["a"]), Duration::from_secs(5))
            .await;
        assert_eq!(r1, vec![b"j1-a0".to_vec()]);
        assert_eq!(r2, vec![b"j2-a0".to_vec()]);
    }

    #[tokio::test]
    async fn test_duplicate_index_deduplicates() {
        let collector = JobCollector::new();
        collector.prepare("j1").await;
        collector.submit("j1", fragment("a", 0, "first", false)).await.unwrap();
        collector.submit("j1", fragment("a", 0, "second", false)).await.unwrap();
        collector.submit("j1", fragment("a", 1, "a1", true)).await.unwrap();

        let result = collector
            .collect("j1", vec![], &ids(&["a"]), Duration::from_secs(5))
            .await;
        assert_eq!(result, vec![b"second".to_vec(), b"a1".to_vec()]);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_collect() {
        let collector = Arc::new(JobCollector::new());
        collector.prepare("j1").await;

        let closer = collector.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            closer.shutdown().await;
        });

        // Would otherwise wait out a long timeout for worker "a".
        let start = std::time::Instant::now();
        let result = collector
            .collect("j1", vec![], &ids(&["a"]), Duration::from_secs(30))
            .await;
        handle.await.unwrap();
        assert!(result.is_empty());
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_end_to_end_two_workers() {
        let collector = JobCollector::new();
        collector.prepare("j1").await;

        collector.submit("j1", fragment("a", 0, "a0", false)).await.unwrap();
        collector.submit("j1", fragment("a", 1, "a1", true)).await.unwrap();
        collector.submit("j1", fragment("b", 0, "b0", true)).await.unwrap();

        let result = collector
            .collect("j1", vec![], &ids(&["a", "b"]), Duration::from_secs(30))
            .await;
        assert_eq!(
            result,
            vec![b"a0".to_vec(), b"a1".to_vec(), b"b0".to_vec()]
        );
        assert!(!collector.exists("j1").await);
    }
}
