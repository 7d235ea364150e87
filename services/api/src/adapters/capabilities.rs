//! services/api/src/adapters/capabilities.rs
//!
//! Concrete implementation of the `CapabilityService` port: the external
//! tools the generation stages may call. Web and video search go through a
//! configurable HTTP search API; `browse_page` fetches a URL and converts
//! the HTML to markdown; diagram drawing and code writing are plain
//! (schema-less) model calls with their own fixed roles.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use courseforge_core::ports::{CapabilityService, PortError, PortResult, SearchHit, VideoHit};
use serde::Deserialize;
use tracing::warn;

use crate::llm::{ChatApi, ChatMessage, ChatOutcome, ChatRequest};

const DIAGRAM_ROLE: &str = "You are an expert in data visualization and mermaid diagrams. \
Turn the user's request into a single correct, ready-to-use mermaid diagram. \
Pick the most fitting diagram kind (flowchart, sequence, class, state, ER, gantt, pie) \
from the context, use clear node names and readable indentation, and reply with ONLY \
the mermaid code inside a ```mermaid fenced block, no prose around it.";

const CODE_ROLE: &str = "You are a developer assistant writing example code for students. \
Produce the highest-quality, idiomatic code for the request in the language given. \
Reply with ONLY the code, no prose around it.";

/// Location and credentials of the external search API.
#[derive(Debug, Clone)]
pub struct SearchApiConfig {
    pub base_url: String,
    pub api_key: String,
}

/// An adapter implementing the `CapabilityService` port.
#[derive(Clone)]
pub struct ExternalCapabilities {
    http: reqwest::Client,
    search: Option<SearchApiConfig>,
    chat: Arc<dyn ChatApi>,
    model: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchResult>,
}

#[derive(Deserialize)]
struct SearchResult {
    title: String,
    url: String,
    #[serde(default)]
    snippet: String,
}

#[derive(Deserialize)]
struct VideoResponse {
    #[serde(default)]
    results: Vec<VideoResult>,
}

#[derive(Deserialize)]
struct VideoResult {
    title: String,
    url: String,
    #[serde(default)]
    platform: String,
    #[serde(default)]
    duration_seconds: u32,
}

impl ExternalCapabilities {
    pub fn new(
        search: Option<SearchApiConfig>,
        chat: Arc<dyn ChatApi>,
        model: String,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            http,
            search,
            chat,
            model,
        })
    }

    async fn plain_completion(&self, role: &str, prompt: String) -> PortResult<String> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage::System(role.to_string()),
                ChatMessage::User(prompt),
            ],
            tools: Vec::new(),
            schema: None,
        };
        match self.chat.complete(&request).await {
            Ok(ChatOutcome::Content(text)) => Ok(text),
            Ok(ChatOutcome::ToolCalls(_)) => Err(PortError::Unexpected(
                "model requested tools in a tool-less capability call".to_string(),
            )),
            Err(e) => Err(PortError::Unexpected(e.to_string())),
        }
    }
}

#[async_trait]
impl CapabilityService for ExternalCapabilities {
    async fn web_search(&self, query: &str) -> PortResult<Vec<SearchHit>> {
        let Some(search) = &self.search else {
            warn!("web_search requested but no search API is configured");
            return Ok(Vec::new());
        };
        let response: SearchResponse = self
            .http
            .get(format!("{}/search", search.base_url))
            .query(&[("query", query), ("api_key", search.api_key.as_str())])
            .send()
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?
            .error_for_status()
            .map_err(|e| PortError::Unexpected(e.to_string()))?
            .json()
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(response
            .results
            .into_iter()
            .map(|result| SearchHit {
                title: result.title,
                url: result.url,
                snippet: result.snippet,
            })
            .collect())
    }

    async fn browse_page(&self, url: &str) -> PortResult<String> {
        let html = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?
            .error_for_status()
            .map_err(|e| PortError::Unexpected(e.to_string()))?
            .text()
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        htmd::convert(&html).map_err(|e| PortError::Unexpected(e.to_string()))
    }

    async fn video_search(&self, query: &str) -> PortResult<Vec<VideoHit>> {
        let Some(search) = &self.search else {
            warn!("video_search requested but no search API is configured");
            return Ok(Vec::new());
        };
        let response: VideoResponse = self
            .http
            .get(format!("{}/videos", search.base_url))
            .query(&[("query", query), ("api_key", search.api_key.as_str())])
            .send()
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?
            .error_for_status()
            .map_err(|e| PortError::Unexpected(e.to_string()))?
            .json()
            .await
            .map_err(|e| PortError::Unexpected(e.to_string()))?;
        Ok(response
            .results
            .into_iter()
            .map(|result| VideoHit {
                title: result.title,
                url: result.url,
                platform: result.platform,
                duration_seconds: result.duration_seconds,
            })
            .collect())
    }

    async fn draw_diagram(&self, prompt: &str) -> PortResult<String> {
        self.plain_completion(DIAGRAM_ROLE, prompt.to_string()).await
    }

    async fn write_code(&self, language: &str, prompt: &str) -> PortResult<String> {
        self.plain_completion(
            CODE_ROLE,
            format!("Language: {language}\n\nTask:\n{prompt}"),
        )
        .await
    }
}
