/// Cross-worker coordination primitives
///
/// Everything workers share lives behind these traits so several processes can
/// point at the same database:
/// - Lease locks keyed by (executionId, nodeId)
/// - Named job queues with delay and dedup (run + poll), plus a null queue

pub mod lock;

pub mod queue;

pub use lock::{node_lock_key, LockService, MemoryLockService, SqliteLockService};
pub use queue::{
    EnqueueOptions, JobQueue, MemoryJobQueue, NullJobQueue, PendingJob, QueueJob, SqliteJobQueue,
    POLL_QUEUE, RUN_QUEUE,
};
