// Content generation using OpenAI
//
// Infrastructure implementation of BaseContentGenerator. The prompt only asks
// for articles; deciding whether to publish them is the automation pipeline's job.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{BaseContentGenerator, GeneratedArticle, GenerationError};

const CHAT_COMPLETIONS_URL: &str = "https://api.openai.com/v1/chat/completions";

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    response_format: ResponseFormat,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ArticleBatch {
    articles: Vec<GeneratedArticle>,
}

/// OpenAI implementation of content generation
#[derive(Clone)]
pub struct OpenAiContentGenerator {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAiContentGenerator {
    pub fn new(api_key: String, model: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            api_key,
            model,
        })
    }
}

fn build_prompt(source_ref: Option<&str>, max_items: usize) -> String {
    let source = match source_ref {
        Some(src) => format!("Base the articles on the content source at {src}."),
        None => "Pick timely topics for a general-interest blog.".to_string(),
    };
    format!(
        "Write {max_items} distinct blog article(s). {source}\n\
         Respond with JSON of the form \
         {{\"articles\": [{{\"title\": \"...\", \"content\": \"<p>...</p>\", \"excerpt\": \"...\"}}]}}."
    )
}

/// Pull articles out of the model's JSON reply.
fn parse_articles(raw: &str, max_items: usize) -> Result<Vec<GeneratedArticle>, GenerationError> {
    let batch: ArticleBatch = serde_json::from_str(raw)
        .map_err(|e| GenerationError::permanent(format!("model returned invalid JSON: {e}")))?;
    Ok(batch
        .articles
        .into_iter()
        .filter(|a| !a.title.trim().is_empty())
        .take(max_items)
        .collect())
}

#[async_trait]
impl BaseContentGenerator for OpenAiContentGenerator {
    async fn generate(
        &self,
        source_ref: Option<&str>,
        max_items: usize,
    ) -> Result<Vec<GeneratedArticle>, GenerationError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "You write well-structured blog articles in HTML.".to_string(),
                },
                ChatMessage {
                    role: "user",
                    content: build_prompt(source_ref, max_items),
                },
            ],
            response_format: ResponseFormat {
                kind: "json_object",
            },
        };

        let response = self
            .client
            .post(CHAT_COMPLETIONS_URL)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| GenerationError::transient(format!("OpenAI request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("OpenAI returned {}: {}", status.as_u16(), body);
            return Err(if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                GenerationError::transient(message)
            } else {
                GenerationError::permanent(message)
            });
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| GenerationError::transient(format!("unreadable OpenAI response: {e}")))?;
        let content = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| GenerationError::permanent("OpenAI returned no content"))?;

        let articles = parse_articles(&content, max_items)?;
        debug!(count = articles.len(), "articles generated");
        Ok(articles)
    }
}

/// Used when no API key is configured. Every run fails with a clear message.
pub struct NoopContentGenerator;

#[async_trait]
impl BaseContentGenerator for NoopContentGenerator {
    async fn generate(
        &self,
        _source_ref: Option<&str>,
        _max_items: usize,
    ) -> Result<Vec<GeneratedArticle>, GenerationError> {
        Err(GenerationError::permanent(
            "content generation is not configured (OPENAI_API_KEY is unset)",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_and_caps_articles() {
        let raw = r#"{"articles":[
            {"title":"One","content":"<p>1</p>"},
            {"title":"","content":"dropped"},
            {"title":"Two","content":"<p>2</p>","excerpt":"e"},
            {"title":"Three","content":"<p>3</p>"}
        ]}"#;
        let articles = parse_articles(raw, 2).unwrap();
        assert_eq!(articles.len(), 2);
        assert_eq!(articles[0].title, "One");
        assert_eq!(articles[1].excerpt.as_deref(), Some("e"));
    }

    #[test]
    fn invalid_json_is_permanent() {
        let err = parse_articles("not json", 3).unwrap_err();
        assert!(!err.transient);
    }

    #[test]
    fn prompt_mentions_source() {
        let prompt = build_prompt(Some("https://example.com/feed"), 3);
        assert!(prompt.contains("https://example.com/feed"));
        assert!(prompt.contains("Write 3"));
    }

    #[tokio::test]
    async fn noop_generator_reports_missing_configuration() {
        let err = NoopContentGenerator.generate(None, 1).await.unwrap_err();
        assert!(err.message.contains("not configured"));
    }
}
