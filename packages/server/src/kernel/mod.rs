//! Kernel module - engine infrastructure and dependencies.

pub mod ai;
pub mod deps;
pub mod server_kernel;
pub mod store;
pub mod test_dependencies;
pub mod traits;
pub mod wordpress_client;

pub use ai::{NoopContentGenerator, OpenAiContentGenerator};
pub use deps::ServerDeps;
pub use server_kernel::ServerKernel;
pub use store::{
    AutomationStore, BulkOperationStore, ExecutionStore, MemoryStore, PostgresStore,
    ScheduledPostStore, SiteStore,
};
pub use test_dependencies::{
    MockContentGenerator, MockRemoteActionClient, RemoteCall, TestDependencies,
};
pub use traits::*;
pub use wordpress_client::WordPressClient;
