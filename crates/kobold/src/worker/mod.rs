pub mod pool;
pub mod scheduler;

pub use pool::{WorkerPool, WorkerSettings};
pub use scheduler::{Scheduler, TickSummary};
