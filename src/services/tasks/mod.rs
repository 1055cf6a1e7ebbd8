mod backoff;
mod postgres;
mod scheduler;
mod store;
mod types;

pub use backoff::{next_retry_at, RetryPolicy, BACKOFF_LIMIT};
pub use postgres::PgTaskStore;
pub use scheduler::{ResultDisposition, TaskScheduler, WorkerUrls};
pub use store::{MemoryTaskStore, TaskStore};
pub use types::{
    AnalysisResult, AnalysisTask, AnalysisType, ClusterSummary, NoOpReason, Scheduled,
    TaskDescriptor, TaskInputs, TaskKey, TaskOutcome, TaskPhase, TaskStatus,
};
