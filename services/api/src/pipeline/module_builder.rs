//! services/api/src/pipeline/module_builder.rs
//!
//! The per-module pipeline: plan the module structure, generate its content
//! blocks in plan order, generate the assignment, and re-index the produced
//! theory into the tenant knowledge index so later modules (and the Q&A
//! assistant) can retrieve it.
//!
//! Every stage returns an owned value; the module being built is assembled
//! here and handed back to the orchestrator, never mutated behind its back.

use std::sync::Arc;

use courseforge_core::domain::{
    Assignment, AssignmentKind, ContentBlock, Course, InvariantViolation, Module, QuizQuestion,
    TestQuestion,
};
use courseforge_core::plan::{
    AssignmentSpec, AssignmentType, ContentPlanItem, CourseStructurePlan, ModuleStructure,
    PlannedContentType, TeacherContext, MIN_CONTENT_BLOCKS,
};
use courseforge_core::ports::{CapabilityService, CourseRepository, KnowledgeIndexService};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::PipelineError;
use crate::llm::{
    toolset, ChatMessage, GenerationClient, GenerationError, StructuredOutput, ToolBudget, ToolSet,
};

/// Knowledge index category for generated module theory.
pub const THEORY_CATEGORY: &str = "theory";

//=========================================================================================
// System roles
//=========================================================================================

const MODULE_PLANNER_ROLE: &str = "You are a helpful assistant planning the structure of one \
educational module from its description. You write the briefs for the assistants that will \
fill the module with content and an assignment; they have tools for web search, page \
browsing, diagram drawing, video search and searching the teacher's materials.\n\n\
For every entry of content_plan write a detailed prompt that:\n\
 1. carries the course and module context,\n\
 2. states concretely what the block must cover,\n\
 3. sets the style of exposition,\n\
 4. fixes the structure of the content,\n\
 5. includes examples where useful.\n\n\
Block kinds: text (theory/lecture), program_code (worked code example), mermaid (diagram), \
video (a fitting video to find online), quiz (self-check questions). Plan at least three \
blocks, in the exact order students should read them. Finish with one assignment \
specification (test, file_upload or github) with an equally detailed prompt.";

const TEXT_ROLE: &str = "You are a helpful assistant writing educational theory material. \
Write the most informative and clear markdown material for the request, using the module \
context.\n\nAvailable tools:\n - web_search: fact checking or finding missing material\n \
- browse_page: fetch the content of a page by URL\n - draw_diagram: produce a mermaid \
diagram to embed\n - knowledge_search: search the teacher's own materials and earlier \
modules\n\nUse tools only when your own knowledge is not enough.";

const VIDEO_ROLE: &str = "You are a helpful assistant finding one fitting educational video. \
Use the video_search tool, pick the best match for the request and the module context, and \
describe it with its url, platform, title and duration, adding key moments and discussion \
questions when you can derive them.";

const CODE_BLOCK_ROLE: &str = "You are a helpful developer assistant writing example program \
code for course students. Produce the highest-quality code for the request with a clear \
explanation. Use the write_code tool when you want a draft to refine.";

const QUIZ_ROLE: &str = "You are a helpful assistant creating self-check questions for the \
module. Cover all key topics and knowledge of the module. Use knowledge_search to ground \
questions in the teacher's materials and the generated theory.";

const MERMAID_ROLE: &str = "You are an expert in mermaid diagrams. Turn the request into one \
correct, readable mermaid diagram with a title and a short explanation. Choose the diagram \
kind that fits the content best.";

const TEST_ROLE: &str = "You are an assistant creating a graded test for a module. Create a \
high-quality test; prefer questions that require understanding over recall. Points must add \
up so the test is passable; the passing score can never exceed the maximum score.";

const FILE_UPLOAD_ROLE: &str = "You are an assistant creating a file-upload assignment. \
Write a detailed task including requirements, deliverables and submission instructions, and \
choose sensible allowed file extensions.";

const GITHUB_ROLE: &str = "You are an assistant creating a GitHub repository assignment. \
Describe the expected project and its requirements in detail, plus the repository rules \
(commit discipline, layout) and the branch to review.";

//=========================================================================================
// Structured outputs
//=========================================================================================

impl StructuredOutput for ModuleStructure {
    const NAME: &'static str = "module_structure";

    fn schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "title": {"type": "string"},
                "description": {"type": "string"},
                "learning_objectives": {
                    "type": "array",
                    "items": {"type": "string"},
                    "minItems": 1
                },
                "content_plan": {
                    "type": "array",
                    "minItems": MIN_CONTENT_BLOCKS,
                    "items": {
                        "type": "object",
                        "properties": {
                            "content_type": {
                                "type": "string",
                                "enum": ["text", "video", "program_code", "quiz", "mermaid"]
                            },
                            "prompt": {"type": "string"}
                        },
                        "required": ["content_type", "prompt"],
                        "additionalProperties": false
                    }
                },
                "assignment_specification": {
                    "type": "object",
                    "properties": {
                        "assignment_type": {
                            "type": "string",
                            "enum": ["test", "file_upload", "github"]
                        },
                        "prompt": {"type": "string"}
                    },
                    "required": ["assignment_type", "prompt"],
                    "additionalProperties": false
                }
            },
            "required": [
                "title", "description", "learning_objectives",
                "content_plan", "assignment_specification"
            ],
            "additionalProperties": false
        })
    }

    fn validate(&self) -> Result<(), String> {
        ModuleStructure::validate(self).map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TextDraft {
    md_content: String,
}

impl StructuredOutput for TextDraft {
    const NAME: &'static str = "text_block";

    fn schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {"md_content": {"type": "string"}},
            "required": ["md_content"],
            "additionalProperties": false
        })
    }

    fn validate(&self) -> Result<(), String> {
        if self.md_content.trim().is_empty() {
            return Err("md_content must not be empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct KeyMoment {
    timestamp: String,
    label: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct VideoDraft {
    url: String,
    platform: String,
    title: String,
    duration_seconds: u32,
    #[serde(default)]
    key_moments: Vec<KeyMoment>,
    #[serde(default)]
    discussion_questions: Vec<String>,
}

impl StructuredOutput for VideoDraft {
    const NAME: &'static str = "video_block";

    fn schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "url": {"type": "string"},
                "platform": {"type": "string"},
                "title": {"type": "string"},
                "duration_seconds": {"type": "integer", "minimum": 1},
                "key_moments": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "timestamp": {"type": "string"},
                            "label": {"type": "string"}
                        },
                        "required": ["timestamp", "label"],
                        "additionalProperties": false
                    }
                },
                "discussion_questions": {"type": "array", "items": {"type": "string"}}
            },
            "required": [
                "url", "platform", "title", "duration_seconds",
                "key_moments", "discussion_questions"
            ],
            "additionalProperties": false
        })
    }

    fn validate(&self) -> Result<(), String> {
        if self.url.trim().is_empty() {
            return Err("url must not be empty".to_string());
        }
        if self.duration_seconds == 0 {
            return Err("duration_seconds must be positive".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CodeDraft {
    language: String,
    code: String,
    explanation: String,
}

impl StructuredOutput for CodeDraft {
    const NAME: &'static str = "code_block";

    fn schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "language": {"type": "string"},
                "code": {"type": "string"},
                "explanation": {"type": "string"}
            },
            "required": ["language", "code", "explanation"],
            "additionalProperties": false
        })
    }

    fn validate(&self) -> Result<(), String> {
        if self.code.trim().is_empty() {
            return Err("code must not be empty".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct QuizDraft {
    questions: Vec<QuizQuestion>,
}

impl StructuredOutput for QuizDraft {
    const NAME: &'static str = "quiz_block";

    fn schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "questions": {
                    "type": "array",
                    "minItems": 1,
                    "items": {
                        "type": "object",
                        "properties": {
                            "question": {"type": "string"},
                            "answer": {"type": "string"}
                        },
                        "required": ["question", "answer"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["questions"],
            "additionalProperties": false
        })
    }

    fn validate(&self) -> Result<(), String> {
        if self.questions.is_empty() {
            return Err("a quiz needs at least one question".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct MermaidDraft {
    title: String,
    mermaid_code: String,
    explanation: String,
}

impl StructuredOutput for MermaidDraft {
    const NAME: &'static str = "mermaid_block";

    fn schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "title": {"type": "string"},
                "mermaid_code": {"type": "string"},
                "explanation": {"type": "string"}
            },
            "required": ["title", "mermaid_code", "explanation"],
            "additionalProperties": false
        })
    }

    fn validate(&self) -> Result<(), String> {
        if self.mermaid_code.trim().is_empty() {
            return Err("mermaid_code must not be empty".to_string());
        }
        Ok(())
    }
}

fn assignment_score_schema() -> serde_json::Value {
    json!({
        "title": {"type": "string"},
        "max_score": {"type": "integer", "minimum": 1},
        "passing_score": {"type": "integer", "minimum": 1}
    })
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TestAssignmentDraft {
    title: String,
    max_score: u32,
    passing_score: u32,
    questions: Vec<TestQuestion>,
}

impl TestAssignmentDraft {
    fn into_assignment(self) -> Result<Assignment, InvariantViolation> {
        Assignment::new(
            self.title,
            self.max_score,
            self.passing_score,
            AssignmentKind::Test {
                questions: self.questions,
            },
        )
    }
}

impl StructuredOutput for TestAssignmentDraft {
    const NAME: &'static str = "test_assignment";

    fn schema() -> serde_json::Value {
        let mut properties = assignment_score_schema();
        properties["questions"] = json!({
            "type": "array",
            "minItems": 1,
            "items": {
                "type": "object",
                "properties": {
                    "text": {"type": "string"},
                    "options": {
                        "type": "array",
                        "items": {"type": "string"},
                        "minItems": 2,
                        "maxItems": 7
                    },
                    "correct_answers": {
                        "type": "array",
                        "items": {"type": "integer", "minimum": 0},
                        "minItems": 1
                    },
                    "points": {"type": "integer", "minimum": 1}
                },
                "required": ["text", "options", "correct_answers", "points"],
                "additionalProperties": false
            }
        });
        json!({
            "type": "object",
            "properties": properties,
            "required": ["title", "max_score", "passing_score", "questions"],
            "additionalProperties": false
        })
    }

    fn validate(&self) -> Result<(), String> {
        self.clone().into_assignment().map(drop).map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileUploadAssignmentDraft {
    title: String,
    max_score: u32,
    passing_score: u32,
    task: String,
    allowed_extensions: Vec<String>,
    submission_instructions: String,
}

impl FileUploadAssignmentDraft {
    fn into_assignment(self) -> Result<Assignment, InvariantViolation> {
        Assignment::new(
            self.title,
            self.max_score,
            self.passing_score,
            AssignmentKind::FileUpload {
                task: self.task,
                allowed_extensions: self.allowed_extensions,
                submission_instructions: self.submission_instructions,
            },
        )
    }
}

impl StructuredOutput for FileUploadAssignmentDraft {
    const NAME: &'static str = "file_upload_assignment";

    fn schema() -> serde_json::Value {
        let mut properties = assignment_score_schema();
        properties["task"] = json!({"type": "string"});
        properties["allowed_extensions"] = json!({"type": "array", "items": {"type": "string"}});
        properties["submission_instructions"] = json!({"type": "string"});
        json!({
            "type": "object",
            "properties": properties,
            "required": [
                "title", "max_score", "passing_score", "task",
                "allowed_extensions", "submission_instructions"
            ],
            "additionalProperties": false
        })
    }

    fn validate(&self) -> Result<(), String> {
        self.clone().into_assignment().map(drop).map_err(|e| e.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct GitHubAssignmentDraft {
    title: String,
    max_score: u32,
    passing_score: u32,
    repository_task: String,
    repository_rules: String,
    required_branch: String,
}

impl GitHubAssignmentDraft {
    fn into_assignment(self) -> Result<Assignment, InvariantViolation> {
        Assignment::new(
            self.title,
            self.max_score,
            self.passing_score,
            AssignmentKind::GitHub {
                repository_task: self.repository_task,
                repository_rules: self.repository_rules,
                required_branch: self.required_branch,
            },
        )
    }
}

impl StructuredOutput for GitHubAssignmentDraft {
    const NAME: &'static str = "github_assignment";

    fn schema() -> serde_json::Value {
        let mut properties = assignment_score_schema();
        properties["repository_task"] = json!({"type": "string"});
        properties["repository_rules"] = json!({"type": "string"});
        properties["required_branch"] = json!({"type": "string"});
        json!({
            "type": "object",
            "properties": properties,
            "required": [
                "title", "max_score", "passing_score",
                "repository_task", "repository_rules", "required_branch"
            ],
            "additionalProperties": false
        })
    }

    fn validate(&self) -> Result<(), String> {
        self.clone().into_assignment().map(drop).map_err(|e| e.to_string())
    }
}

//=========================================================================================
// The Module Pipeline
//=========================================================================================

/// Per-content-type tool sets for one module run. Session budgets span the
/// whole module, run budgets a single block.
struct RunToolSets {
    text: ToolSet,
    video: ToolSet,
    quiz: ToolSet,
    code: ToolSet,
}

impl RunToolSets {
    fn new(
        ctx: &TeacherContext,
        capabilities: &Arc<dyn CapabilityService>,
        knowledge: &Arc<dyn KnowledgeIndexService>,
    ) -> Self {
        let build = || {
            ToolSet::new(
                ctx.tenant_id.clone(),
                Arc::clone(capabilities),
                Arc::clone(knowledge),
            )
        };
        Self {
            text: build()
                .with(toolset::WEB_SEARCH, ToolBudget::new(2, 4))
                .with(toolset::BROWSE_PAGE, ToolBudget::new(2, 4))
                .with(toolset::DRAW_DIAGRAM, ToolBudget::new(1, 2))
                .with(toolset::KNOWLEDGE_SEARCH, ToolBudget::new(2, 6)),
            video: build().with(toolset::VIDEO_SEARCH, ToolBudget::new(2, 4)),
            quiz: build().with(toolset::KNOWLEDGE_SEARCH, ToolBudget::new(2, 4)),
            code: build().with(toolset::WRITE_CODE, ToolBudget::new(2, 4)),
        }
    }
}

/// The 3-stage pipeline run once per module description.
pub struct ModulePipeline {
    client: GenerationClient,
    repository: Arc<dyn CourseRepository>,
    capabilities: Arc<dyn CapabilityService>,
    knowledge: Arc<dyn KnowledgeIndexService>,
    planner_model: String,
    content_model: String,
}

impl ModulePipeline {
    pub fn new(
        client: GenerationClient,
        repository: Arc<dyn CourseRepository>,
        capabilities: Arc<dyn CapabilityService>,
        knowledge: Arc<dyn KnowledgeIndexService>,
        planner_model: String,
        content_model: String,
    ) -> Self {
        Self {
            client,
            repository,
            capabilities,
            knowledge,
            planner_model,
            content_model,
        }
    }

    /// Builds one complete module. `course` is the aggregate as accumulated
    /// so far (read-only); the module shell is persisted through `refresh`
    /// before content generation starts so partial progress is observable.
    pub async fn run(
        &self,
        ctx: &TeacherContext,
        course: &Course,
        plan: &CourseStructurePlan,
        order: u32,
        description: &str,
        cancel: &CancellationToken,
    ) -> Result<Module, PipelineError> {
        info!(order, "planning module structure");
        let structure = self.plan_structure(plan, order, description, cancel).await?;

        let mut module = Module::shell(
            structure.title.clone(),
            structure.description.clone(),
            structure.learning_objectives.clone(),
            order,
        );
        let mut shell_course = course.clone();
        shell_course.append_module(module.clone());
        self.repository.refresh(&shell_course).await?;

        let tools = RunToolSets::new(ctx, &self.capabilities, &self.knowledge);
        let total = structure.content_plan.len();
        for (position, item) in structure.content_plan.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(GenerationError::Cancelled {
                    stage: "content_blocks".to_string(),
                }
                .into());
            }
            info!(
                order,
                block = position + 1,
                of = total,
                content_type = item.content_type.as_str(),
                "generating content block"
            );
            let block = self.generate_block(&tools, &module, item, cancel).await?;
            module.append_content_block(block);
        }

        let theory = module.theory_text();
        if theory.is_empty() {
            warn!(order, "module produced no indexable theory");
        } else if let Err(e) = self
            .knowledge
            .index(&ctx.tenant_id, THEORY_CATEGORY, &module.title, &theory)
            .await
        {
            // Retrieval quality for later modules degrades, but the module
            // itself is intact; not worth failing the course over.
            warn!(order, error = %e, "failed to index module theory");
        }

        info!(order, "generating assignment");
        let assignment = self
            .generate_assignment(&module, &structure.assignment_specification, cancel)
            .await?;
        module.add_assignment(assignment);

        info!(order, title = %module.title, "module complete");
        Ok(module)
    }

    async fn plan_structure(
        &self,
        plan: &CourseStructurePlan,
        order: u32,
        description: &str,
        cancel: &CancellationToken,
    ) -> Result<ModuleStructure, GenerationError> {
        let message = format!(
            "Generate the module structure from this information:\n\
             - **Course audience:** {}\n\
             - **Course learning objectives:** {}\n\
             - **Module position (0-based):** {order}\n\
             - **Module description:** {description}",
            plan.audience_description,
            plan.learning_objectives.join("; "),
        );
        self.client
            .generate(
                "module_planning",
                &self.planner_model,
                MODULE_PLANNER_ROLE,
                vec![ChatMessage::User(message)],
                None,
                cancel,
            )
            .await
    }

    async fn generate_block(
        &self,
        tools: &RunToolSets,
        module: &Module,
        item: &ContentPlanItem,
        cancel: &CancellationToken,
    ) -> Result<ContentBlock, GenerationError> {
        let message = format!(
            "# Current module context\n{}\n\n## Content brief\n{}",
            module_context(module),
            item.prompt
        );
        let conversation = vec![ChatMessage::User(message)];
        let model = self.content_model.as_str();
        match item.content_type {
            PlannedContentType::Text => {
                let draft: TextDraft = self
                    .client
                    .generate("content_text", model, TEXT_ROLE, conversation, Some(&tools.text), cancel)
                    .await?;
                Ok(ContentBlock::Text {
                    md_content: draft.md_content,
                    ai_generated: true,
                })
            }
            PlannedContentType::Video => {
                let draft: VideoDraft = self
                    .client
                    .generate("content_video", model, VIDEO_ROLE, conversation, Some(&tools.video), cancel)
                    .await?;
                Ok(ContentBlock::Video {
                    url: draft.url,
                    platform: draft.platform,
                    title: draft.title,
                    duration_seconds: draft.duration_seconds,
                    key_moments: draft
                        .key_moments
                        .into_iter()
                        .map(|moment| (moment.timestamp, moment.label))
                        .collect(),
                    discussion_questions: draft.discussion_questions,
                    ai_generated: true,
                })
            }
            PlannedContentType::ProgramCode => {
                let draft: CodeDraft = self
                    .client
                    .generate("content_code", model, CODE_BLOCK_ROLE, conversation, Some(&tools.code), cancel)
                    .await?;
                Ok(ContentBlock::ProgramCode {
                    language: draft.language,
                    code: draft.code,
                    explanation: draft.explanation,
                    ai_generated: true,
                })
            }
            PlannedContentType::Quiz => {
                let draft: QuizDraft = self
                    .client
                    .generate("content_quiz", model, QUIZ_ROLE, conversation, Some(&tools.quiz), cancel)
                    .await?;
                Ok(ContentBlock::Quiz {
                    questions: draft.questions,
                    ai_generated: true,
                })
            }
            PlannedContentType::Mermaid => {
                let draft: MermaidDraft = self
                    .client
                    .generate("content_mermaid", model, MERMAID_ROLE, conversation, None, cancel)
                    .await?;
                Ok(ContentBlock::Mermaid {
                    title: draft.title,
                    mermaid_code: draft.mermaid_code,
                    explanation: draft.explanation,
                    ai_generated: true,
                })
            }
        }
    }

    async fn generate_assignment(
        &self,
        module: &Module,
        spec: &AssignmentSpec,
        cancel: &CancellationToken,
    ) -> Result<Assignment, GenerationError> {
        let message = format!(
            "# Current module context\n{}\n\n## Assignment brief\n{}",
            module_context(module),
            spec.prompt
        );
        let conversation = vec![ChatMessage::User(message)];
        let model = self.content_model.as_str();
        let built = match spec.assignment_type {
            AssignmentType::Test => {
                let draft: TestAssignmentDraft = self
                    .client
                    .generate("assignment_test", model, TEST_ROLE, conversation, None, cancel)
                    .await?;
                draft.into_assignment()
            }
            AssignmentType::FileUpload => {
                let draft: FileUploadAssignmentDraft = self
                    .client
                    .generate("assignment_file_upload", model, FILE_UPLOAD_ROLE, conversation, None, cancel)
                    .await?;
                draft.into_assignment()
            }
            AssignmentType::GitHub => {
                let draft: GitHubAssignmentDraft = self
                    .client
                    .generate("assignment_github", model, GITHUB_ROLE, conversation, None, cancel)
                    .await?;
                draft.into_assignment()
            }
        };
        // The draft already validated itself; a failure here means the
        // schema and the domain rules drifted apart.
        built.map_err(|e| GenerationError::SchemaValidation {
            stage: "assignment".to_string(),
            attempts: 1,
            detail: e.to_string(),
        })
    }
}

/// Renders the module-so-far as prompt context for content and assignment
/// generation.
fn module_context(module: &Module) -> String {
    let mut lines = vec![
        format!("Title: {}", module.title),
        format!("Description: {}", module.description),
        format!("Learning objectives: {}", module.learning_objectives.join("; ")),
    ];
    if !module.content_blocks.is_empty() {
        lines.push("Blocks generated so far:".to_string());
        for block in &module.content_blocks {
            let label = match block {
                ContentBlock::Text { md_content, .. } => {
                    let first_line = md_content.lines().next().unwrap_or_default();
                    format!("text ({first_line})")
                }
                ContentBlock::Video { title, .. } => format!("video ({title})"),
                ContentBlock::ProgramCode { language, .. } => format!("program_code ({language})"),
                ContentBlock::Quiz { questions, .. } => {
                    format!("quiz ({} questions)", questions.len())
                }
                ContentBlock::Mermaid { title, .. } => format!("mermaid ({title})"),
                ContentBlock::Link { title, .. } => format!("link ({title})"),
            };
            lines.push(format!(" - {label}"));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use courseforge_core::domain::GenerationStatus;

    use super::super::test_support::{
        InMemoryRepository, NullCapabilities, RecordingKnowledge, SchemaRouterApi,
    };
    use super::*;
    use crate::llm::RetryPolicy;

    const STRUCTURE_JSON: &str = r#"{
        "title": "Relational model",
        "description": "Tables, keys and constraints",
        "learning_objectives": ["Understand keys", "Design tables"],
        "content_plan": [
            {"content_type": "text", "prompt": "Explain the relational model"},
            {"content_type": "program_code", "prompt": "Show a CREATE TABLE example"},
            {"content_type": "quiz", "prompt": "Quiz the key concepts"}
        ],
        "assignment_specification": {"assignment_type": "test", "prompt": "A test on keys"}
    }"#;

    const TEXT_JSON: &str = r##"{"md_content": "# The relational model\nRows and columns."}"##;
    const CODE_JSON: &str =
        r#"{"language": "sql", "code": "CREATE TABLE t (id INT);", "explanation": "A table."}"#;
    const QUIZ_JSON: &str =
        r#"{"questions": [{"question": "What is a key?", "answer": "A unique identifier."}]}"#;
    const TEST_JSON: &str = r#"{
        "title": "Keys test", "max_score": 100, "passing_score": 60,
        "questions": [{"text": "Pick the key", "options": ["id", "name"],
                       "correct_answers": [0], "points": 10}]
    }"#;

    fn pipeline(
        api: SchemaRouterApi,
        repository: Arc<InMemoryRepository>,
        knowledge: Arc<RecordingKnowledge>,
    ) -> ModulePipeline {
        let client = GenerationClient::new(
            Arc::new(api),
            RetryPolicy {
                max_attempts: 2,
                schema_retries: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
            Duration::from_secs(5),
        );
        ModulePipeline::new(
            client,
            repository,
            Arc::new(NullCapabilities),
            knowledge,
            "planner-model".to_string(),
            "content-model".to_string(),
        )
    }

    fn course_and_plan() -> (Course, CourseStructurePlan) {
        let mut course = Course::shell(7);
        course.title = "Intro to Databases".to_string();
        course.learning_objectives = vec!["Model data".to_string(), "Query data".to_string()];
        course.generation_status = GenerationStatus::GeneratingModules;
        let plan = CourseStructurePlan {
            title: course.title.clone(),
            description: "A beginner course".to_string(),
            audience_description: "First-year students".to_string(),
            learning_objectives: course.learning_objectives.clone(),
            module_descriptions: vec![
                "Relational model".to_string(),
                "SQL basics".to_string(),
                "Transactions".to_string(),
            ],
            final_assessment_description: None,
        };
        (course, plan)
    }

    #[tokio::test]
    async fn run_builds_module_with_blocks_in_plan_order() {
        let api = SchemaRouterApi::new(vec![
            ("module_structure", vec![STRUCTURE_JSON]),
            ("text_block", vec![TEXT_JSON]),
            ("code_block", vec![CODE_JSON]),
            ("quiz_block", vec![QUIZ_JSON]),
            ("test_assignment", vec![TEST_JSON]),
        ]);
        let repository = Arc::new(InMemoryRepository::default());
        let knowledge = Arc::new(RecordingKnowledge::default());
        let (course, plan) = course_and_plan();
        repository.create(&course).await.unwrap();

        let ctx = TeacherContext::new(7, "db course");
        let module = pipeline(api, repository.clone(), knowledge.clone())
            .run(&ctx, &course, &plan, 0, &plan.module_descriptions[0], &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(module.order, 0);
        assert_eq!(module.content_blocks.len(), 3);
        // Persisted order equals the content_plan order used to generate.
        let kinds: Vec<&str> = module
            .content_blocks
            .iter()
            .map(ContentBlock::content_type)
            .collect();
        assert_eq!(kinds, vec!["text", "program_code", "quiz"]);
        assert!(module.assignment.is_some());
    }

    #[tokio::test]
    async fn run_persists_shell_before_content_generation() {
        let api = SchemaRouterApi::new(vec![
            ("module_structure", vec![STRUCTURE_JSON]),
            ("text_block", vec![TEXT_JSON]),
            ("code_block", vec![CODE_JSON]),
            ("quiz_block", vec![QUIZ_JSON]),
            ("test_assignment", vec![TEST_JSON]),
        ]);
        let repository = Arc::new(InMemoryRepository::default());
        let knowledge = Arc::new(RecordingKnowledge::default());
        let (course, plan) = course_and_plan();
        repository.create(&course).await.unwrap();

        let ctx = TeacherContext::new(7, "db course");
        pipeline(api, repository.clone(), knowledge)
            .run(&ctx, &course, &plan, 0, &plan.module_descriptions[0], &CancellationToken::new())
            .await
            .unwrap();

        let refreshes = repository.refresh_log.lock().unwrap();
        let shell = &refreshes[0];
        assert_eq!(shell.modules.len(), 1);
        assert_eq!(shell.modules[0].title, "Relational model");
        assert!(shell.modules[0].content_blocks.is_empty());
    }

    #[tokio::test]
    async fn run_indexes_generated_theory_for_the_tenant() {
        let api = SchemaRouterApi::new(vec![
            ("module_structure", vec![STRUCTURE_JSON]),
            ("text_block", vec![TEXT_JSON]),
            ("code_block", vec![CODE_JSON]),
            ("quiz_block", vec![QUIZ_JSON]),
            ("test_assignment", vec![TEST_JSON]),
        ]);
        let repository = Arc::new(InMemoryRepository::default());
        let knowledge = Arc::new(RecordingKnowledge::default());
        let (course, plan) = course_and_plan();
        repository.create(&course).await.unwrap();

        let ctx = TeacherContext::new(7, "db course");
        pipeline(api, repository, knowledge.clone())
            .run(&ctx, &course, &plan, 0, &plan.module_descriptions[0], &CancellationToken::new())
            .await
            .unwrap();

        let indexed = knowledge.indexed.lock().unwrap();
        assert_eq!(indexed.len(), 1);
        let (tenant, category, source, text) = &indexed[0];
        assert_eq!(tenant, "tenant-7");
        assert_eq!(category, THEORY_CATEGORY);
        assert_eq!(source, "Relational model");
        assert!(text.contains("relational model"));
    }

    #[tokio::test]
    async fn invalid_assignment_scores_are_reprompted() {
        let bad_test = r#"{
            "title": "Broken", "max_score": 100, "passing_score": 120,
            "questions": [{"text": "q", "options": ["a", "b"],
                           "correct_answers": [0], "points": 10}]
        }"#;
        let api = SchemaRouterApi::new(vec![
            ("module_structure", vec![STRUCTURE_JSON]),
            ("text_block", vec![TEXT_JSON]),
            ("code_block", vec![CODE_JSON]),
            ("quiz_block", vec![QUIZ_JSON]),
            // First reply violates passing_score <= max_score, the retry fixes it.
            ("test_assignment", vec![bad_test, TEST_JSON]),
        ]);
        let repository = Arc::new(InMemoryRepository::default());
        let knowledge = Arc::new(RecordingKnowledge::default());
        let (course, plan) = course_and_plan();
        repository.create(&course).await.unwrap();

        let ctx = TeacherContext::new(7, "db course");
        let module = pipeline(api, repository, knowledge)
            .run(&ctx, &course, &plan, 0, &plan.module_descriptions[0], &CancellationToken::new())
            .await
            .unwrap();
        let assignment = module.assignment.unwrap();
        assert_eq!(assignment.passing_score, 60);
    }

    #[tokio::test]
    async fn failed_block_generation_surfaces_schema_error() {
        let api = SchemaRouterApi::new(vec![
            ("module_structure", vec![STRUCTURE_JSON]),
            ("text_block", vec!["not json", "still not json"]),
        ]);
        let repository = Arc::new(InMemoryRepository::default());
        let knowledge = Arc::new(RecordingKnowledge::default());
        let (course, plan) = course_and_plan();
        repository.create(&course).await.unwrap();

        let ctx = TeacherContext::new(7, "db course");
        let err = pipeline(api, repository, knowledge)
            .run(&ctx, &course, &plan, 0, &plan.module_descriptions[0], &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Generation(GenerationError::SchemaValidation { .. })
        ));
    }
}
