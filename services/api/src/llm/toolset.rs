//! services/api/src/llm/toolset.rs
//!
//! Allow-listed tool sets for generation stages. Each stage hands the client
//! a `ToolSet` naming exactly the capabilities its model may call, with a
//! per-run and a per-session invocation cap per tool. Dispatch results are
//! always fed back to the model as text; a failing or over-budget tool
//! produces an explanatory message instead of killing the stage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use courseforge_core::ports::{CapabilityService, KnowledgeIndexService};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use super::{ToolCall, ToolSpec};

pub const WEB_SEARCH: &str = "web_search";
pub const BROWSE_PAGE: &str = "browse_page";
pub const VIDEO_SEARCH: &str = "video_search";
pub const DRAW_DIAGRAM: &str = "draw_diagram";
pub const WRITE_CODE: &str = "write_code";
pub const KNOWLEDGE_SEARCH: &str = "knowledge_search";

/// Invocation caps for one tool.
#[derive(Debug, Clone, Copy)]
pub struct ToolBudget {
    /// Calls allowed within a single `generate` run.
    pub per_run: u32,
    /// Calls allowed across the lifetime of this tool set (one pipeline
    /// stage session, e.g. one module).
    pub per_session: u32,
}

impl ToolBudget {
    pub const fn new(per_run: u32, per_session: u32) -> Self {
        Self {
            per_run,
            per_session,
        }
    }
}

struct ToolEntry {
    spec: ToolSpec,
    budget: ToolBudget,
}

/// The allow-list of named capabilities for one stage, with budgets and
/// dispatch. Cloning is deliberately not provided: a tool set's session
/// counters belong to exactly one stage.
pub struct ToolSet {
    tenant_id: String,
    entries: Vec<ToolEntry>,
    capabilities: Arc<dyn CapabilityService>,
    knowledge: Arc<dyn KnowledgeIndexService>,
    session_counts: Mutex<HashMap<String, u32>>,
}

#[derive(Deserialize)]
struct QueryArgs {
    query: String,
}

#[derive(Deserialize)]
struct BrowseArgs {
    url: String,
}

#[derive(Deserialize)]
struct CodeArgs {
    language: String,
    prompt: String,
}

#[derive(Deserialize)]
struct DiagramArgs {
    prompt: String,
}

#[derive(Deserialize)]
struct KnowledgeArgs {
    query: String,
    #[serde(default)]
    category: Option<String>,
}

fn spec_for(name: &'static str) -> ToolSpec {
    match name {
        WEB_SEARCH => ToolSpec {
            name: WEB_SEARCH,
            description: "Search the web. Use for fact checking or finding fresh material.",
            parameters: json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"],
                "additionalProperties": false
            }),
        },
        BROWSE_PAGE => ToolSpec {
            name: BROWSE_PAGE,
            description: "Fetch a web page by URL and return its content as markdown.",
            parameters: json!({
                "type": "object",
                "properties": {"url": {"type": "string"}},
                "required": ["url"],
                "additionalProperties": false
            }),
        },
        VIDEO_SEARCH => ToolSpec {
            name: VIDEO_SEARCH,
            description: "Search for educational videos matching a query.",
            parameters: json!({
                "type": "object",
                "properties": {"query": {"type": "string"}},
                "required": ["query"],
                "additionalProperties": false
            }),
        },
        DRAW_DIAGRAM => ToolSpec {
            name: DRAW_DIAGRAM,
            description: "Produce mermaid markup for the described diagram.",
            parameters: json!({
                "type": "object",
                "properties": {"prompt": {"type": "string"}},
                "required": ["prompt"],
                "additionalProperties": false
            }),
        },
        WRITE_CODE => ToolSpec {
            name: WRITE_CODE,
            description: "Write example code in the given programming language.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "language": {"type": "string"},
                    "prompt": {"type": "string"}
                },
                "required": ["language", "prompt"],
                "additionalProperties": false
            }),
        },
        KNOWLEDGE_SEARCH => ToolSpec {
            name: KNOWLEDGE_SEARCH,
            description: "Search the teacher's private materials and previously generated theory.",
            parameters: json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "category": {"type": "string"}
                },
                "required": ["query"],
                "additionalProperties": false
            }),
        },
        other => unreachable!("unknown tool '{other}' requested at allow-list build time"),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let cut: String = text.chars().take(max).collect();
        format!("{cut}…")
    }
}

impl ToolSet {
    pub fn new(
        tenant_id: impl Into<String>,
        capabilities: Arc<dyn CapabilityService>,
        knowledge: Arc<dyn KnowledgeIndexService>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            entries: Vec::new(),
            capabilities,
            knowledge,
            session_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Adds a tool to the allow-list. Panics on an unknown tool name, which
    /// is a programming error caught by the stage's own tests.
    pub fn with(mut self, name: &'static str, budget: ToolBudget) -> Self {
        self.entries.push(ToolEntry {
            spec: spec_for(name),
            budget,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Tool declarations to send with the model request.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.entries.iter().map(|entry| entry.spec.clone()).collect()
    }

    /// Executes one tool call and renders its result as text for the model.
    /// Unknown tools, exhausted budgets and capability failures all come
    /// back as explanatory text so the model can finish without them.
    pub async fn dispatch(
        &self,
        call: &ToolCall,
        run_counts: &mut HashMap<String, u32>,
    ) -> String {
        let Some(entry) = self.entries.iter().find(|entry| entry.spec.name == call.name) else {
            warn!(tool = %call.name, "model requested a tool outside its allow-list");
            return format!("Tool '{}' is not available. Answer with what you have.", call.name);
        };

        let run_count = run_counts.entry(call.name.clone()).or_insert(0);
        let session_count = {
            let counts = self.session_counts.lock().expect("tool counter poisoned");
            counts.get(&call.name).copied().unwrap_or(0)
        };
        if *run_count >= entry.budget.per_run || session_count >= entry.budget.per_session {
            warn!(
                tool = %call.name,
                run = *run_count,
                session = session_count,
                "tool budget exhausted"
            );
            return format!(
                "The budget for tool '{}' is exhausted. Do not call it again; \
                 answer with the information you already have.",
                call.name
            );
        }
        *run_count += 1;
        {
            let mut counts = self.session_counts.lock().expect("tool counter poisoned");
            *counts.entry(call.name.clone()).or_insert(0) += 1;
        }

        let started = Instant::now();
        let result = self.invoke(&call.name, &call.arguments).await;
        let elapsed = started.elapsed();
        match result {
            Ok(output) => {
                info!(
                    tool = %call.name,
                    duration_ms = elapsed.as_millis() as u64,
                    input = %truncate(&call.arguments, 120),
                    output = %truncate(&output, 120),
                    "tool call finished"
                );
                output
            }
            Err(detail) => {
                warn!(
                    tool = %call.name,
                    duration_ms = elapsed.as_millis() as u64,
                    error = %detail,
                    "tool call failed"
                );
                format!("Tool '{}' failed: {detail}. Answer with what you have.", call.name)
            }
        }
    }

    async fn invoke(&self, name: &str, arguments: &str) -> Result<String, String> {
        match name {
            WEB_SEARCH => {
                let args: QueryArgs = parse_args(arguments)?;
                let hits = self
                    .capabilities
                    .web_search(&args.query)
                    .await
                    .map_err(|e| e.to_string())?;
                if hits.is_empty() {
                    return Ok("No results found.".to_string());
                }
                Ok(hits
                    .iter()
                    .enumerate()
                    .map(|(i, hit)| {
                        format!("{}. {} — {}\n{}", i + 1, hit.title, hit.url, hit.snippet)
                    })
                    .collect::<Vec<_>>()
                    .join("\n\n"))
            }
            BROWSE_PAGE => {
                let args: BrowseArgs = parse_args(arguments)?;
                self.capabilities
                    .browse_page(&args.url)
                    .await
                    .map_err(|e| e.to_string())
            }
            VIDEO_SEARCH => {
                let args: QueryArgs = parse_args(arguments)?;
                let hits = self
                    .capabilities
                    .video_search(&args.query)
                    .await
                    .map_err(|e| e.to_string())?;
                if hits.is_empty() {
                    return Ok("No videos found.".to_string());
                }
                Ok(hits
                    .iter()
                    .enumerate()
                    .map(|(i, hit)| {
                        format!(
                            "{}. {} — {} ({}, {} seconds)",
                            i + 1,
                            hit.title,
                            hit.url,
                            hit.platform,
                            hit.duration_seconds
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n"))
            }
            DRAW_DIAGRAM => {
                let args: DiagramArgs = parse_args(arguments)?;
                self.capabilities
                    .draw_diagram(&args.prompt)
                    .await
                    .map_err(|e| e.to_string())
            }
            WRITE_CODE => {
                let args: CodeArgs = parse_args(arguments)?;
                self.capabilities
                    .write_code(&args.language, &args.prompt)
                    .await
                    .map_err(|e| e.to_string())
            }
            KNOWLEDGE_SEARCH => {
                let args: KnowledgeArgs = parse_args(arguments)?;
                let documents = self
                    .knowledge
                    .search(&self.tenant_id, &args.query, args.category.as_deref(), 10)
                    .await
                    .map_err(|e| e.to_string())?;
                if documents.is_empty() {
                    return Ok("Nothing relevant found in the teacher's materials.".to_string());
                }
                Ok(documents.join("\n\n---\n\n"))
            }
            other => Err(format!("unknown tool '{other}'")),
        }
    }
}

fn parse_args<T: serde::de::DeserializeOwned>(arguments: &str) -> Result<T, String> {
    serde_json::from_str(arguments).map_err(|e| format!("invalid tool arguments: {e}"))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use courseforge_core::ports::{PortError, PortResult, SearchHit, VideoHit};
    use uuid::Uuid;

    use super::*;

    struct FakeCapabilities;

    #[async_trait]
    impl CapabilityService for FakeCapabilities {
        async fn web_search(&self, query: &str) -> PortResult<Vec<SearchHit>> {
            Ok(vec![SearchHit {
                title: format!("Result for {query}"),
                url: "https://example.org".to_string(),
                snippet: "A snippet".to_string(),
            }])
        }

        async fn browse_page(&self, _url: &str) -> PortResult<String> {
            Err(PortError::Unexpected("connection refused".to_string()))
        }

        async fn video_search(&self, _query: &str) -> PortResult<Vec<VideoHit>> {
            Ok(vec![])
        }

        async fn draw_diagram(&self, _prompt: &str) -> PortResult<String> {
            Ok("flowchart TD".to_string())
        }

        async fn write_code(&self, language: &str, _prompt: &str) -> PortResult<String> {
            Ok(format!("// {language}"))
        }
    }

    struct FakeKnowledge;

    #[async_trait]
    impl KnowledgeIndexService for FakeKnowledge {
        async fn index(
            &self,
            _tenant_id: &str,
            _category: &str,
            _source: &str,
            _text: &str,
        ) -> PortResult<Vec<Uuid>> {
            Ok(vec![])
        }

        async fn search(
            &self,
            _tenant_id: &str,
            _query: &str,
            _category: Option<&str>,
            _limit: usize,
        ) -> PortResult<Vec<String>> {
            Ok(vec!["chunk one".to_string()])
        }
    }

    fn tool_set() -> ToolSet {
        ToolSet::new("tenant-1", Arc::new(FakeCapabilities), Arc::new(FakeKnowledge))
            .with(WEB_SEARCH, ToolBudget::new(1, 2))
            .with(BROWSE_PAGE, ToolBudget::new(2, 4))
            .with(KNOWLEDGE_SEARCH, ToolBudget::new(2, 4))
    }

    fn call(name: &str, arguments: &str) -> ToolCall {
        ToolCall {
            id: "call-1".to_string(),
            name: name.to_string(),
            arguments: arguments.to_string(),
        }
    }

    #[tokio::test]
    async fn dispatch_formats_search_results() {
        let tools = tool_set();
        let mut run_counts = HashMap::new();
        let output = tools
            .dispatch(&call(WEB_SEARCH, r#"{"query":"joins"}"#), &mut run_counts)
            .await;
        assert!(output.contains("Result for joins"));
        assert!(output.contains("https://example.org"));
    }

    #[tokio::test]
    async fn dispatch_reports_exhausted_run_budget() {
        let tools = tool_set();
        let mut run_counts = HashMap::new();
        let first = tools
            .dispatch(&call(WEB_SEARCH, r#"{"query":"a"}"#), &mut run_counts)
            .await;
        assert!(first.contains("Result for a"));
        let second = tools
            .dispatch(&call(WEB_SEARCH, r#"{"query":"b"}"#), &mut run_counts)
            .await;
        assert!(second.contains("budget"));
    }

    #[tokio::test]
    async fn session_budget_survives_across_runs() {
        let tools = tool_set();
        // per_run = 1, per_session = 2: two runs succeed, the third is cut off
        for expected_hit in [true, true, false] {
            let mut run_counts = HashMap::new();
            let output = tools
                .dispatch(&call(WEB_SEARCH, r#"{"query":"x"}"#), &mut run_counts)
                .await;
            assert_eq!(output.contains("Result for"), expected_hit, "{output}");
        }
    }

    #[tokio::test]
    async fn dispatch_rejects_tools_outside_allow_list() {
        let tools = tool_set();
        let mut run_counts = HashMap::new();
        let output = tools
            .dispatch(&call(WRITE_CODE, r#"{"language":"rust","prompt":"x"}"#), &mut run_counts)
            .await;
        assert!(output.contains("not available"));
    }

    #[tokio::test]
    async fn dispatch_surfaces_capability_failures_as_text() {
        let tools = tool_set();
        let mut run_counts = HashMap::new();
        let output = tools
            .dispatch(&call(BROWSE_PAGE, r#"{"url":"https://x"}"#), &mut run_counts)
            .await;
        assert!(output.contains("failed"));
        assert!(output.contains("connection refused"));
    }
}
