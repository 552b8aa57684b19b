//! Scheduler / executor service.
//!
//! Owns the task lifecycle after `ready`: a single scheduler loop picks
//! tasks under the parallelism cap, executors fan out one downloader
//! subprocess per track, stdout is parsed into typed state patches merged
//! into the queue file and broadcast over SSE, albums get a verification
//! pass, and terminal tasks trigger notifications before idle
//! housekeeping archives and drops them.

pub mod bus;
pub mod context;
pub mod error;
pub mod executor;
pub mod notify;
pub mod parser;
pub mod process;
pub mod scheduler;
pub mod source_config;
pub mod sse;
pub mod verify;

pub use bus::ProgressBus;
pub use context::SchedulerContext;
pub use error::SchedulerError;
