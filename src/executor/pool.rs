//! Worker Pool
//!
//! A fixed number of supervised workers drain a bounded job queue. A panic
//! while handling a job is caught at the worker boundary; the worker logs it
//! and is replaced so pool capacity is preserved.

use crate::error::{EngineError, Result};
use crate::models::Job;
use async_trait::async_trait;
use futures_util::future::join_all;
use futures_util::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

/// Submission queues are never smaller than this.
pub const MIN_QUEUE_CAPACITY: usize = 100;

/// Processes one job to completion.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: Job);
}

type SharedReceiver = Arc<Mutex<mpsc::Receiver<Job>>>;

/// Cloneable handle for feeding jobs into the pool.
#[derive(Debug, Clone)]
pub struct JobSubmitter {
    sender: mpsc::Sender<Job>,
}

impl JobSubmitter {
    /// Enqueue a job, waiting while the queue is full.
    pub async fn submit(&self, job: Job) -> Result<()> {
        self.sender
            .send(job)
            .await
            .map_err(|_| EngineError::Queue("worker pool is closed".to_string()))
    }
}

pub struct WorkerPool {
    handler: Arc<dyn JobHandler>,
    submitter: JobSubmitter,
    receiver: SharedReceiver,
}

impl WorkerPool {
    pub fn new(handler: Arc<dyn JobHandler>, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(MIN_QUEUE_CAPACITY));
        Self {
            handler,
            submitter: JobSubmitter { sender },
            receiver: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Launch `worker_count` supervised workers.
    pub fn start(&self, worker_count: usize) -> PoolHandle {
        let supervisors = (1..=worker_count)
            .map(|id| {
                let handler = self.handler.clone();
                let receiver = self.receiver.clone();
                tokio::spawn(supervise(id, handler, receiver))
            })
            .collect();
        PoolHandle { supervisors }
    }

    pub async fn submit(&self, job: Job) -> Result<()> {
        self.submitter.submit(job).await
    }

    pub fn submitter(&self) -> JobSubmitter {
        self.submitter.clone()
    }

    /// Stop accepting jobs from this handle. Workers exit once every
    /// submitter is gone and the queue is drained.
    pub fn close(self) {
        drop(self.submitter);
    }
}

/// Handle on the running supervisors.
#[derive(Debug)]
pub struct PoolHandle {
    supervisors: Vec<JoinHandle<()>>,
}

impl PoolHandle {
    /// Wait for all workers to drain the queue and stop.
    pub async fn wait_for_shutdown(self) {
        join_all(self.supervisors).await.into_iter().for_each(|result| {
            if let Err(error) = result {
                warn!(%error, "Worker supervisor task failed");
            }
        });
    }
}

enum WorkerExit {
    QueueClosed,
    Panicked,
}

/// Keep one worker slot filled until the queue closes.
async fn supervise(id: usize, handler: Arc<dyn JobHandler>, receiver: SharedReceiver) {
    loop {
        let span = info_span!("worker", worker.id = id);
        let worker = tokio::spawn(run_worker(id, handler.clone(), receiver.clone()).instrument(span));
        match worker.await {
            Ok(WorkerExit::QueueClosed) => {
                info!("Worker {} stopped", id);
                return;
            }
            Ok(WorkerExit::Panicked) => {}
            Err(e) if e.is_panic() => {
                error!("Worker {} crashed: {}. Restarting...", id, panic_message(&*e.into_panic()));
            }
            Err(_) => return,
        }
    }
}

async fn run_worker(id: usize, handler: Arc<dyn JobHandler>, receiver: SharedReceiver) -> WorkerExit {
    info!("Worker {} started", id);
    loop {
        // The lock is held only while waiting for the next job.
        let next = receiver.lock().await.recv().await;
        let Some(job) = next else {
            return WorkerExit::QueueClosed;
        };

        info!("Worker {} processing execution {}", id, job.execution_id);
        let execution_id = job.execution_id.clone();
        if let Err(panic) = AssertUnwindSafe(handler.handle(job)).catch_unwind().await {
            error!(
                "Worker {} panicked on execution {}: {}. Restarting...",
                id,
                execution_id,
                panic_message(&*panic)
            );
            return WorkerExit::Panicked;
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
