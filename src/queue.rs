//! Queue consumer
//!
//! Pops job payloads from the work queue and feeds them into the pool.

use crate::error::{EngineError, Result};
use crate::executor::JobSubmitter;
use crate::models::Job;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Wait before popping again after a queue error.
pub const RETRY_DELAY: Duration = Duration::from_secs(2);

/// Anything offering a blocking pop of one opaque payload.
#[async_trait]
pub trait JobSource: Send {
    /// `Ok(None)` when nothing arrived within the source's poll window.
    async fn pop(&mut self) -> Result<Option<String>>;
}

/// Redis list consumed with `BLPOP`.
pub struct RedisJobSource {
    connection: MultiplexedConnection,
    key: String,
    poll_timeout: Duration,
}

impl RedisJobSource {
    pub async fn connect(host: &str, port: u16, key: &str, poll_timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(format!("redis://{host}:{port}/"))
            .map_err(|e| EngineError::Queue(e.to_string()))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| EngineError::Queue(format!("failed to connect to redis: {e}")))?;
        Ok(Self {
            connection,
            key: key.to_string(),
            poll_timeout,
        })
    }
}

#[async_trait]
impl JobSource for RedisJobSource {
    async fn pop(&mut self) -> Result<Option<String>> {
        let popped: Option<(String, String)> = self
            .connection
            .blpop(&self.key, self.poll_timeout.as_secs_f64())
            .await
            .map_err(|e| EngineError::Queue(e.to_string()))?;
        Ok(popped.map(|(_, payload)| payload))
    }
}

/// Consume until `shutdown` fires or the pool stops accepting jobs.
///
/// Malformed payloads are logged and skipped; queue errors are retried after
/// [`RETRY_DELAY`].
pub async fn consume<S>(source: &mut S, submitter: JobSubmitter, shutdown: CancellationToken)
where
    S: JobSource + ?Sized,
{
    info!("Queue consumer started");
    loop {
        let popped = tokio::select! {
            _ = shutdown.cancelled() => break,
            popped = source.pop() => popped,
        };

        match popped {
            Ok(None) => debug!("No job within poll window"),
            Ok(Some(payload)) => match Job::from_payload(&payload) {
                Ok(job) => {
                    info!("Received job for execution {}", job.execution_id);
                    let submitted = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        submitted = submitter.submit(job) => submitted,
                    };
                    if let Err(e) = submitted {
                        warn!("Stopping consumer: {}", e);
                        break;
                    }
                }
                Err(e) => warn!("Skipping malformed job payload: {}", e),
            },
            Err(e) => {
                error!("Failed to pop job: {}", e);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
            }
        }
    }
    info!("Queue consumer stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{JobHandler, WorkerPool};
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Replays scripted pops, then cancels the consumer.
    struct Scripted {
        pops: VecDeque<Result<Option<String>>>,
        shutdown: CancellationToken,
    }

    #[async_trait]
    impl JobSource for Scripted {
        async fn pop(&mut self) -> Result<Option<String>> {
            match self.pops.pop_front() {
                Some(next) => next,
                None => {
                    self.shutdown.cancel();
                    std::future::pending().await
                }
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl JobHandler for Recorder {
        async fn handle(&self, job: Job) {
            self.seen.lock().unwrap().push(job.execution_id);
        }
    }

    #[tokio::test]
    async fn test_consumes_valid_payloads_and_skips_garbage() {
        let shutdown = CancellationToken::new();
        let mut source = Scripted {
            pops: VecDeque::from(vec![
                Ok(Some(r#"{"execution_id":"e1","report_id":"r1"}"#.to_string())),
                Ok(Some("not json".to_string())),
                Ok(None),
                Err(EngineError::Queue("connection reset".into())),
                Ok(Some(r#"{"execution_id":"e2","report_id":"r1"}"#.to_string())),
            ]),
            shutdown: shutdown.clone(),
        };

        let recorder = Arc::new(Recorder::default());
        let pool = WorkerPool::new(recorder.clone(), 10);
        let running = pool.start(1);

        consume(&mut source, pool.submitter(), shutdown).await;
        pool.close();
        running.wait_for_shutdown().await;

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(seen, vec!["e1".to_string(), "e2".to_string()]);
    }
}
