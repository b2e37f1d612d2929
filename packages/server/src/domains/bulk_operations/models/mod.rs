pub mod bulk_operation;

pub use bulk_operation::{
    BulkAction, BulkOperation, BulkOperationStatus, CreateBulkOperation, ItemError, ItemOutcome,
    MAX_RECORDED_ERRORS,
};
