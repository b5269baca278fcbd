//! Refresh orchestration: foreground lookups with stale-while-revalidate,
//! and the periodic scheduler that keeps every known pair warm.

pub mod orchestrator;
pub mod scheduler;

pub use orchestrator::{LookupMetrics, Orchestrator, WarmReport};
pub use scheduler::{
    next_aligned_delay, RefreshSummary, Scheduler, SchedulerConfig, SchedulerHandle,
};
