pub mod scheduled_post;

pub use scheduled_post::{
    CreateScheduledPost, PostChanges, PostPayload, PublishResult, ScheduledPost,
    ScheduledPostStatus,
};
