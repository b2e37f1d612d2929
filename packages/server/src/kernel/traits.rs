// Trait definitions for the external collaborators
//
// These are INFRASTRUCTURE traits only. Retry decisions, counters and status
// transitions belong to the managers that call them.
//
// Naming convention: Base* for trait names (e.g., BaseRemoteActionClient)

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domains::scheduled_posts::models::PostPayload;
use crate::domains::sites::models::Site;

// =============================================================================
// Remote Action Client (WordPress posts)
// =============================================================================

/// Failure of a single remote call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteActionError {
    /// Timeouts, 429, 5xx, connection resets. Safe to try again later.
    #[error("transient remote error: {0}")]
    Transient(String),

    /// Auth, permission, validation. Retrying will not help.
    #[error("permanent remote error: {0}")]
    Permanent(String),
}

impl RemoteActionError {
    pub fn should_retry(&self) -> bool {
        matches!(self, RemoteActionError::Transient(_))
    }
}

/// A post created or updated on the remote site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePost {
    pub remote_id: i64,
    pub link: String,
}

#[async_trait]
pub trait BaseRemoteActionClient: Send + Sync {
    /// Create and publish a post.
    async fn publish(&self, site: &Site, payload: &PostPayload)
        -> Result<RemotePost, RemoteActionError>;

    /// Publish an existing remote post.
    async fn publish_existing(&self, site: &Site, remote_id: i64)
        -> Result<(), RemoteActionError>;

    /// Move a post back to draft. Already-draft is success.
    async fn unpublish(&self, site: &Site, remote_id: i64) -> Result<(), RemoteActionError>;

    /// Delete a post. Already-gone is success.
    async fn delete(&self, site: &Site, remote_id: i64) -> Result<(), RemoteActionError>;

    async fn update_metadata(
        &self,
        site: &Site,
        remote_id: i64,
        fields: &serde_json::Value,
    ) -> Result<(), RemoteActionError>;
}

// =============================================================================
// Content Generator
// =============================================================================

/// One generated article, ready to be published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedArticle {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub excerpt: Option<String>,
}

impl GeneratedArticle {
    pub fn into_payload(self) -> PostPayload {
        PostPayload {
            title: self.title,
            content: self.content,
            excerpt: self.excerpt,
            status: "publish".to_string(),
            ..Default::default()
        }
    }
}

/// Generation failed, possibly after producing some articles.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct GenerationError {
    pub message: String,
    pub transient: bool,
    /// Articles produced before the failure. They still count.
    pub produced: Vec<GeneratedArticle>,
}

impl GenerationError {
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
            produced: Vec::new(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
            produced: Vec::new(),
        }
    }

    pub fn with_produced(mut self, produced: Vec<GeneratedArticle>) -> Self {
        self.produced = produced;
        self
    }
}

#[async_trait]
pub trait BaseContentGenerator: Send + Sync {
    /// Generate up to `max_items` articles from `source_ref` (e.g. an RSS URL).
    async fn generate(
        &self,
        source_ref: Option<&str>,
        max_items: usize,
    ) -> Result<Vec<GeneratedArticle>, GenerationError>;
}
