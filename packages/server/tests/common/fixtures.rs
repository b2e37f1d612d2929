//! Test fixtures for creating test data.
//!
//! These go straight through the store, skipping the managers' validation.
#![allow(dead_code)]

use automation_core::common::MemberId;
use automation_core::domains::scheduled_posts::models::PostPayload;
use automation_core::domains::sites::models::{CreateSite, Site};
use automation_core::kernel::ExecutionStore;
use std::future::Future;
use std::time::Duration;

/// Insert a site for `owner`, optionally with an application password.
pub async fn create_test_site(
    store: &dyn ExecutionStore,
    owner_id: MemberId,
    with_credentials: bool,
) -> Site {
    let (username, password) = if with_credentials {
        (Some("editor".to_string()), Some("abcd efgh ijkl".to_string()))
    } else {
        (None, None)
    };
    let site = Site::new(
        CreateSite::builder()
            .owner_id(owner_id)
            .name("Test Blog")
            .base_url("https://blog.example.com")
            .username(username)
            .application_password(password)
            .build(),
    );
    store.insert_site(&site).await.expect("Failed to create site")
}

pub fn test_payload(title: &str) -> PostPayload {
    PostPayload {
        title: title.to_string(),
        content: format!("<p>{title}</p>"),
        status: "publish".to_string(),
        ..Default::default()
    }
}

/// Poll `check` every 20ms until it returns true or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
