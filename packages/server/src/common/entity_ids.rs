//! Typed IDs for every persisted entity.
//!
//! ```rust
//! use automation_core::common::{ScheduledPostId, SiteId};
//!
//! let site: SiteId = SiteId::new();
//! let post: ScheduledPostId = ScheduledPostId::new();
//! // let wrong: SiteId = post; // does not compile
//! ```

pub use super::id::Id;

/// Marker types. Kept in their own module so they don't collide with the
/// model structs of the same name.
pub mod markers {
    pub struct Member;
    pub struct Site;
    pub struct BulkOperation;
    pub struct ScheduledPost;
    pub struct AutomationSchedule;
    pub struct AutomationExecution;
}

/// Authenticated caller. Every record is scoped to one.
pub type MemberId = Id<markers::Member>;

pub type SiteId = Id<markers::Site>;

pub type BulkOperationId = Id<markers::BulkOperation>;

pub type ScheduledPostId = Id<markers::ScheduledPost>;

pub type AutomationScheduleId = Id<markers::AutomationSchedule>;

pub type AutomationExecutionId = Id<markers::AutomationExecution>;
