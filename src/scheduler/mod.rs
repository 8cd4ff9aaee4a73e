//! 并发受限的上传调度器
//!
//! `SchedulerWorker` owns every task and runs as a single tokio task;
//! `UploadScheduler` talks to it over a command channel.

mod manager;
mod transfer;
mod types;
mod worker;

pub use manager::{FilteredEventReceiver, SchedulerBuilder, SchedulerHandle, UploadScheduler};
pub use types::{DEFAULT_CONCURRENCY, DEFAULT_EXPIRY_BUFFER, SchedulerConfig, StartReport, UploadEvent};
