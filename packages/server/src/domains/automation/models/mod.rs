pub mod execution;
pub mod schedule;

pub use execution::{AutomationExecution, ExecutionOutcome, ExecutionStatus};
pub use schedule::{AutomationSchedule, CreateAutomationSchedule, ScheduleKind};
