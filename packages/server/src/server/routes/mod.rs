// HTTP routes
pub mod automation_schedules;
pub mod bulk_operations;
pub mod error;
pub mod health;
pub mod scheduled_posts;
pub mod sites;

pub use error::{ApiError, ApiJson, ApiResult};
pub use health::*;

use crate::common::Id;

/// Parse a path segment as a typed id. Malformed ids are treated as missing.
pub(crate) fn parse_id<T>(raw: &str, entity: &'static str) -> ApiResult<Id<T>> {
    Id::parse(raw).map_err(|_| crate::common::EngineError::not_found(entity, raw).into())
}
