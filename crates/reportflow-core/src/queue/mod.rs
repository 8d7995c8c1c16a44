//! Background job queue.
//!
//! - `backend` -- storage port (durable or in-process)
//! - `handler` -- worker port
//! - `memory` -- in-process fallback backend
//! - `job_queue` -- the queue service: enqueue, workers, retry, cleanup

pub mod backend;
pub mod handler;
pub mod job_queue;
pub mod memory;

pub use backend::{BoxQueueBackend, QueueBackend, QueueConnector};
pub use handler::{BoxJobHandler, FnHandler, JobHandler};
pub use job_queue::{EnqueueOptions, JobQueue, ProcessedJob};
pub use memory::MemoryQueueBackend;
