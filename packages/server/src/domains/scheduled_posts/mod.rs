pub mod dispatcher;
pub mod models;
pub mod retry;

pub use dispatcher::{
    CreateScheduledPostInput, DispatcherConfig, ScheduledPostDispatcher, TickSummary,
    UpdateScheduledPostInput,
};
pub use models::{PostPayload, ScheduledPost, ScheduledPostStatus};
pub use retry::RetryPolicy;
