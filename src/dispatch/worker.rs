//! Fixed-size pool of tokio workers fed from a bounded channel.
//!
//! Submitting never waits: when every worker is busy and the channel is
//! full the job is dropped with a warning, so the caller (a stream
//! listener) stays responsive.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

pub struct WorkerPool<T> {
    tx: Option<mpsc::Sender<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Start `size` workers running `handler` on each submitted job.
    pub fn spawn<F, Fut>(size: usize, capacity: usize, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let handler = Arc::new(handler);

        let workers = (0..size.max(1))
            .map(|worker| {
                let rx = rx.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    loop {
                        let job = rx.lock().await.recv().await;
                        match job {
                            Some(job) => handler(job).await,
                            None => break,
                        }
                    }
                    log::debug!("Worker {} stopped", worker);
                })
            })
            .collect();

        Self { tx: Some(tx), workers }
    }

    /// Queue a job without waiting. Returns false if it was dropped.
    pub fn submit(&self, job: T) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(job) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Worker pool saturated, dropping job");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                log::warn!("Worker pool closed, dropping job");
                false
            }
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Stop accepting jobs, let workers finish what is queued, and wait.
    pub async fn shutdown(mut self) {
        self.tx.take();
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                log::warn!("Worker task failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn test_runs_every_job_before_shutdown_returns() {
        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        let pool = WorkerPool::spawn(3, 16, move |n: usize| {
            let counter = counter.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_add(n, Ordering::SeqCst);
            }
        });
        assert_eq!(pool.size(), 3);

        for n in 1..=10 {
            assert!(pool.submit(n));
        }
        pool.shutdown().await;

        assert_eq!(done.load(Ordering::SeqCst), 55);
    }

    #[tokio::test]
    async fn test_submit_never_blocks_when_saturated() {
        let gate = Arc::new(Notify::new());
        let release = gate.clone();
        let pool = WorkerPool::spawn(1, 1, move |_: u32| {
            let gate = gate.clone();
            async move { gate.notified().await }
        });

        // one job held by the worker, one buffered; give the worker time to pick up the first
        assert!(pool.submit(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pool.submit(2));
        assert!(!pool.submit(3));

        release.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;
        release.notify_one();
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_jobs_run_concurrently() {
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (r, p) = (running.clone(), peak.clone());
        let pool = WorkerPool::spawn(4, 8, move |_: ()| {
            let (running, peak) = (r.clone(), p.clone());
            async move {
                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                running.fetch_sub(1, Ordering::SeqCst);
            }
        });

        for _ in 0..4 {
            pool.submit(());
        }
        pool.shutdown().await;
        assert!(peak.load(Ordering::SeqCst) > 1);
    }
}
