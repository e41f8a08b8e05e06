//! Job execution: worker pool, per-job state machine and streaming pipeline.

pub mod pipeline;
pub mod pool;
pub mod processor;

pub use pipeline::{run_pipeline, Progress, PIPE_CAPACITY};
pub use pool::{JobHandler, JobSubmitter, PoolHandle, WorkerPool, MIN_QUEUE_CAPACITY};
pub use processor::{JobProcessor, ProcessorSettings, CANCEL_GRACE, DEFAULT_JOB_TIMEOUT};
