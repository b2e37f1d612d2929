pub mod models;
pub mod runner;

pub use models::{BulkAction, BulkOperation, BulkOperationStatus, ItemError};
pub use runner::{BulkOperationRunner, SubmitBulkOperation, MAX_TARGETS};
