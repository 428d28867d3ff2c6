//! Background workers draining the chunk queue.
//!
//! [`WorkerPool`] owns a set of [`worker_loop`] tasks sharing one
//! [`CancellationToken`](tokio_util::sync::CancellationToken). Each worker
//! reserves a job, runs it under the job timeout and settles it with the
//! queue: acknowledged on success, released for retry on failure, buried once
//! it has used up its attempts.

mod manager;
mod worker;

pub use manager::WorkerPool;
pub use worker::{WorkerContext, worker_loop};
