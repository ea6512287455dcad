//! Worker system — the scheduler loop and what it needs to run.
//!
//! Core components:
//! - `clock` — injectable time source (`SystemClock`, `ManualClock`)
//! - `shutdown` — cooperative shutdown signal
//! - `state` — per-task schedules, backoff and failure counters
//! - `scheduler` — runs the mail and social cycles on jittered intervals

pub mod clock;
pub mod scheduler;
pub mod shutdown;
pub mod state;

pub use clock::{Clock, ManualClock, SystemClock};
pub use scheduler::{Scheduler, SchedulerConfig, TaskRun};
pub use shutdown::Shutdown;
pub use state::{SchedulerState, TaskKind, TaskSchedule};
