//! WordPress REST adapter for [`BaseRemoteActionClient`].
//!
//! Talks to `/wp-json/wp/v2/posts` with application-password basic auth.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{BaseRemoteActionClient, RemoteActionError, RemotePost};
use crate::domains::scheduled_posts::models::PostPayload;
use crate::domains::sites::models::Site;

pub struct WordPressClient {
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct CreatePostRequest<'a> {
    title: &'a str,
    content: &'a str,
    status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    excerpt: Option<&'a str>,
    #[serde(skip_serializing_if = "is_empty")]
    categories: &'a [i64],
    #[serde(skip_serializing_if = "is_empty")]
    tags: &'a [i64],
    #[serde(skip_serializing_if = "Option::is_none")]
    slug: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    featured_media: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PostResponse {
    id: i64,
    #[serde(default)]
    link: String,
}

impl WordPressClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }

    fn credentials(site: &Site) -> Result<(&str, &str), RemoteActionError> {
        match (site.username.as_deref(), site.application_password.as_deref()) {
            (Some(user), Some(pass)) if site.has_credentials() => Ok((user, pass)),
            _ => Err(RemoteActionError::Permanent(format!(
                "site {} has no credentials",
                site.id
            ))),
        }
    }

    fn post_url(site: &Site, remote_id: Option<i64>) -> String {
        match remote_id {
            Some(id) => format!("{}/posts/{}", site.api_root(), id),
            None => format!("{}/posts", site.api_root()),
        }
    }

    async fn send(
        &self,
        site: &Site,
        request: reqwest::RequestBuilder,
    ) -> Result<Response, RemoteActionError> {
        let (user, pass) = Self::credentials(site)?;
        request
            .basic_auth(user, Some(pass))
            .send()
            .await
            .map_err(|e| RemoteActionError::Transient(format!("request failed: {e}")))
    }

    async fn update_post(
        &self,
        site: &Site,
        remote_id: i64,
        body: &serde_json::Value,
    ) -> Result<(), RemoteActionError> {
        let request = self
            .client
            .post(Self::post_url(site, Some(remote_id)))
            .json(body);
        let response = self.send(site, request).await?;
        check_status(response).await.map(|_| ())
    }
}

/// Map an HTTP status to the transient/permanent split.
pub fn classify_status(status: StatusCode, body: &str) -> RemoteActionError {
    let message = format!("WordPress returned {}: {}", status.as_u16(), truncate(body, 200));
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        RemoteActionError::Transient(message)
    } else {
        RemoteActionError::Permanent(message)
    }
}

/// A delete that finds nothing has nothing left to do.
fn already_deleted(status: StatusCode) -> bool {
    status == StatusCode::NOT_FOUND || status == StatusCode::GONE
}

async fn check_status(response: Response) -> Result<Response, RemoteActionError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body))
}

fn is_empty(ids: &&[i64]) -> bool {
    ids.is_empty()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl BaseRemoteActionClient for WordPressClient {
    async fn publish(
        &self,
        site: &Site,
        payload: &PostPayload,
    ) -> Result<RemotePost, RemoteActionError> {
        let body = CreatePostRequest {
            title: &payload.title,
            content: &payload.content,
            status: &payload.status,
            excerpt: payload.excerpt.as_deref(),
            categories: &payload.categories,
            tags: &payload.tags,
            slug: payload.slug.as_deref(),
            featured_media: payload.featured_media,
        };
        let request = self.client.post(Self::post_url(site, None)).json(&body);
        let response = check_status(self.send(site, request).await?).await?;
        let created: PostResponse = response
            .json()
            .await
            .map_err(|e| RemoteActionError::Transient(format!("unreadable response: {e}")))?;

        debug!(site_id = %site.id, remote_id = created.id, "post created");
        Ok(RemotePost {
            remote_id: created.id,
            link: created.link,
        })
    }

    async fn publish_existing(&self, site: &Site, remote_id: i64) -> Result<(), RemoteActionError> {
        self.update_post(site, remote_id, &serde_json::json!({ "status": "publish" }))
            .await
    }

    async fn unpublish(&self, site: &Site, remote_id: i64) -> Result<(), RemoteActionError> {
        // Setting draft on a draft is a no-op on the WordPress side.
        self.update_post(site, remote_id, &serde_json::json!({ "status": "draft" }))
            .await
    }

    async fn delete(&self, site: &Site, remote_id: i64) -> Result<(), RemoteActionError> {
        let request = self
            .client
            .delete(Self::post_url(site, Some(remote_id)))
            .query(&[("force", "true")]);
        let response = self.send(site, request).await?;
        if already_deleted(response.status()) {
            debug!(site_id = %site.id, remote_id, "post already deleted");
            return Ok(());
        }
        check_status(response).await.map(|_| ())
    }

    async fn update_metadata(
        &self,
        site: &Site,
        remote_id: i64,
        fields: &serde_json::Value,
    ) -> Result<(), RemoteActionError> {
        self.update_post(site, remote_id, fields).await
    }
}
