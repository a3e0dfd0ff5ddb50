//! Persistent job queue: the job model, the store with its pending FIFO
//! and recycle bin, the single worker thread, and the per-job preview
//! buffer.

mod filter;
mod job;
mod preview;
mod store;
mod worker;

pub use filter::{DateGroup, GroupedJobs, JobFilter, JobPage};
pub use job::{Job, JobStatus, JobType, Progress};
pub use preview::{PreviewBuffer, PreviewFrame};
pub use store::{JobStore, StoreError};
pub use worker::Worker;
