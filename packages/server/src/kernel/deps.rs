//! Server dependencies for the managers (using traits for testability)
//!
//! Every external service sits behind a trait so tests can swap in the
//! in-memory store and mock collaborators.

use std::sync::Arc;

use super::{BaseContentGenerator, BaseRemoteActionClient, ExecutionStore};

/// Shared dependency container. Cheap to clone.
#[derive(Clone)]
pub struct ServerDeps {
    pub store: Arc<dyn ExecutionStore>,
    pub remote_client: Arc<dyn BaseRemoteActionClient>,
    pub content_generator: Arc<dyn BaseContentGenerator>,
}

impl ServerDeps {
    pub fn new(
        store: Arc<dyn ExecutionStore>,
        remote_client: Arc<dyn BaseRemoteActionClient>,
        content_generator: Arc<dyn BaseContentGenerator>,
    ) -> Self {
        Self {
            store,
            remote_client,
            content_generator,
        }
    }
}
