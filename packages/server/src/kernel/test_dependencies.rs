// TestDependencies - mock collaborators for tests
//
// Provides mock remote clients and generators that can be injected into the
// managers via ServerDeps, plus a ready-made in-memory kernel.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{
    BaseContentGenerator, BaseRemoteActionClient, GeneratedArticle, GenerationError,
    MemoryStore, RemoteActionError, RemotePost, ServerDeps,
};
use crate::domains::scheduled_posts::models::PostPayload;
use crate::domains::sites::models::Site;

// =============================================================================
// Mock Remote Action Client
// =============================================================================

/// One recorded call against the mock remote client.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    Publish { title: String },
    PublishExisting(i64),
    Unpublish(i64),
    Delete(i64),
    UpdateMetadata(i64, serde_json::Value),
}

impl RemoteCall {
    pub fn target_id(&self) -> Option<i64> {
        match self {
            RemoteCall::Publish { .. } => None,
            RemoteCall::PublishExisting(id)
            | RemoteCall::Unpublish(id)
            | RemoteCall::Delete(id)
            | RemoteCall::UpdateMetadata(id, _) => Some(*id),
        }
    }
}

pub struct MockRemoteActionClient {
    calls: Arc<Mutex<Vec<RemoteCall>>>,
    failing_ids: Arc<Mutex<HashMap<i64, RemoteActionError>>>,
    publish_failures: Arc<Mutex<VecDeque<RemoteActionError>>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    next_remote_id: AtomicUsize,
}

impl MockRemoteActionClient {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            failing_ids: Arc::new(Mutex::new(HashMap::new())),
            publish_failures: Arc::new(Mutex::new(VecDeque::new())),
            delay: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            next_remote_id: AtomicUsize::new(1000),
        }
    }

    /// Calls for these target ids fail with a transient error.
    pub fn failing_ids(self, ids: impl IntoIterator<Item = i64>) -> Self {
        {
            let mut failing = self.failing_ids.lock().unwrap();
            for id in ids {
                failing.insert(id, RemoteActionError::Transient(format!("post {id} unavailable")));
            }
        }
        self
    }

    /// Calls for `id` fail with `error`.
    pub fn failing_id_with(self, id: i64, error: RemoteActionError) -> Self {
        self.failing_ids.lock().unwrap().insert(id, error);
        self
    }

    /// The next publish calls fail, in order, with these errors.
    pub fn with_publish_failures(self, errors: impl IntoIterator<Item = RemoteActionError>) -> Self {
        self.publish_failures.lock().unwrap().extend(errors);
        self
    }

    /// Each call sleeps this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn publish_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| matches!(c, RemoteCall::Publish { .. }))
            .count()
    }

    /// Highest number of calls that were in progress at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self, call: RemoteCall) -> Result<(), RemoteActionError> {
        let target = call.target_id();
        self.calls.lock().unwrap().push(call);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match target.and_then(|id| self.failing_ids.lock().unwrap().get(&id).cloned()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for MockRemoteActionClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BaseRemoteActionClient for MockRemoteActionClient {
    async fn publish(
        &self,
        _site: &Site,
        payload: &PostPayload,
    ) -> Result<RemotePost, RemoteActionError> {
        self.enter(RemoteCall::Publish {
            title: payload.title.clone(),
        })
        .await?;

        if let Some(err) = self.publish_failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        let remote_id = self.next_remote_id.fetch_add(1, Ordering::SeqCst) as i64;
        Ok(RemotePost {
            remote_id,
            link: format!("https://example.com/?p={remote_id}"),
        })
    }

    async fn publish_existing(&self, _site: &Site, remote_id: i64) -> Result<(), RemoteActionError> {
        self.enter(RemoteCall::PublishExisting(remote_id)).await
    }

    async fn unpublish(&self, _site: &Site, remote_id: i64) -> Result<(), RemoteActionError> {
        self.enter(RemoteCall::Unpublish(remote_id)).await
    }

    async fn delete(&self, _site: &Site, remote_id: i64) -> Result<(), RemoteActionError> {
        self.enter(RemoteCall::Delete(remote_id)).await
    }

    async fn update_metadata(
        &self,
        _site: &Site,
        remote_id: i64,
        fields: &serde_json::Value,
    ) -> Result<(), RemoteActionError> {
        self.enter(RemoteCall::UpdateMetadata(remote_id, fields.clone()))
            .await
    }
}

// =============================================================================
// Mock Content Generator
// =============================================================================

/// Arguments captured from a generate call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateCallArgs {
    pub source_ref: Option<String>,
    pub max_items: usize,
}

pub struct MockContentGenerator {
    articles_per_call: usize,
    failures: Arc<Mutex<VecDeque<GenerationError>>>,
    calls: Arc<Mutex<Vec<GenerateCallArgs>>>,
    delay: Option<Duration>,
}

impl MockContentGenerator {
    /// Produces `articles_per_call` articles per call (capped by `max_items`).
    pub fn new(articles_per_call: usize) -> Self {
        Self {
            articles_per_call,
            failures: Arc::new(Mutex::new(VecDeque::new())),
            calls: Arc::new(Mutex::new(Vec::new())),
            delay: None,
        }
    }

    /// The next calls fail, in order, with these errors.
    pub fn with_failures(self, errors: impl IntoIterator<Item = GenerationError>) -> Self {
        self.failures.lock().unwrap().extend(errors);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<GenerateCallArgs> {
        self.calls.lock().unwrap().clone()
    }

    pub fn article(n: usize) -> GeneratedArticle {
        GeneratedArticle {
            title: format!("Generated article {n}"),
            content: format!("<p>Body {n}</p>"),
            excerpt: None,
        }
    }
}

#[async_trait]
impl BaseContentGenerator for MockContentGenerator {
    async fn generate(
        &self,
        source_ref: Option<&str>,
        max_items: usize,
    ) -> Result<Vec<GeneratedArticle>, GenerationError> {
        self.calls.lock().unwrap().push(GenerateCallArgs {
            source_ref: source_ref.map(String::from),
            max_items,
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }

        Ok((1..=self.articles_per_call).map(Self::article).collect())
    }
}

// =============================================================================
// TestDependencies
// =============================================================================

/// Mocks plus the in-memory store, wired into a [`ServerDeps`].
pub struct TestDependencies {
    pub store: Arc<MemoryStore>,
    pub remote: Arc<MockRemoteActionClient>,
    pub generator: Arc<MockContentGenerator>,
}

impl TestDependencies {
    pub fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            remote: Arc::new(MockRemoteActionClient::new()),
            generator: Arc::new(MockContentGenerator::new(1)),
        }
    }

    pub fn with_remote(mut self, remote: MockRemoteActionClient) -> Self {
        self.remote = Arc::new(remote);
        self
    }

    pub fn with_generator(mut self, generator: MockContentGenerator) -> Self {
        self.generator = Arc::new(generator);
        self
    }

    pub fn server_deps(&self) -> ServerDeps {
        ServerDeps::new(
            self.store.clone(),
            self.remote.clone(),
            self.generator.clone(),
        )
    }
}

impl Default for TestDependencies {
    fn default() -> Self {
        Self::new()
    }
}
