pub mod cron;
pub mod manager;
pub mod models;
pub mod registry;

pub use manager::{
    AutomationScheduleManager, CreateScheduleInput, UpdateScheduleInput, INTERRUPTED_MESSAGE,
    MAX_ARTICLES_LIMIT,
};
pub use models::{
    AutomationExecution, AutomationSchedule, ExecutionOutcome, ExecutionStatus, ScheduleKind,
};
pub use registry::TriggerRegistry;
