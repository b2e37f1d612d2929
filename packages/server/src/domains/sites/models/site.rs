use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use typed_builder::TypedBuilder;

use crate::common::{MemberId, SiteId};

/// A remote WordPress site and the application password used to act on it.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Site {
    pub id: SiteId,
    pub owner_id: MemberId,
    pub name: String,
    pub base_url: String,
    pub username: Option<String>,
    #[serde(skip_serializing, default)]
    pub application_password: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct CreateSite {
    pub owner_id: MemberId,
    pub name: String,
    pub base_url: String,
    #[builder(default)]
    pub username: Option<String>,
    #[builder(default)]
    pub application_password: Option<String>,
}

impl Site {
    /// Both halves of the application-password pair are present.
    pub fn has_credentials(&self) -> bool {
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        present(&self.username) && present(&self.application_password)
    }

    /// REST root, without a trailing slash.
    pub fn api_root(&self) -> String {
        format!("{}/wp-json/wp/v2", self.base_url.trim_end_matches('/'))
    }

    pub fn new(input: CreateSite) -> Self {
        let now = Utc::now();
        Self {
            id: SiteId::new(),
            owner_id: input.owner_id,
            name: input.name,
            base_url: input.base_url,
            username: input.username,
            application_password: input.application_password,
            created_at: now,
            updated_at: now,
        }
    }

    pub async fn insert(&self, pool: &PgPool) -> Result<Self> {
        sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO sites (id, owner_id, name, base_url, username, application_password, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING *
            "#,
        )
        .bind(self.id)
        .bind(self.owner_id)
        .bind(&self.name)
        .bind(&self.base_url)
        .bind(&self.username)
        .bind(&self.application_password)
        .bind(self.created_at)
        .bind(self.updated_at)
        .fetch_one(pool)
        .await
        .map_err(Into::into)
    }

    pub async fn find_by_id(id: SiteId, pool: &PgPool) -> Result<Option<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM sites WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(Into::into)
    }

    pub async fn find_for_owner(owner_id: MemberId, pool: &PgPool) -> Result<Vec<Self>> {
        sqlx::query_as::<_, Self>("SELECT * FROM sites WHERE owner_id = $1 ORDER BY id")
            .bind(owner_id)
            .fetch_all(pool)
            .await
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(username: Option<&str>, password: Option<&str>) -> Site {
        Site::new(
            CreateSite::builder()
                .owner_id(MemberId::new())
                .name("Blog")
                .base_url("https://blog.example.com/")
                .username(username.map(String::from))
                .application_password(password.map(String::from))
                .build(),
        )
    }

    #[test]
    fn credentials_need_both_halves() {
        assert!(site(Some("admin"), Some("abcd efgh")).has_credentials());
        assert!(!site(Some("admin"), None).has_credentials());
        assert!(!site(None, Some("abcd")).has_credentials());
        assert!(!site(Some("admin"), Some("   ")).has_credentials());
    }

    #[test]
    fn api_root_strips_trailing_slash() {
        assert_eq!(
            site(None, None).api_root(),
            "https://blog.example.com/wp-json/wp/v2"
        );
    }

    #[test]
    fn password_is_never_serialized() {
        let json = serde_json::to_value(site(Some("admin"), Some("secret"))).unwrap();
        assert!(json.get("application_password").is_none());
        assert_eq!(json["username"], "admin");
    }
}
