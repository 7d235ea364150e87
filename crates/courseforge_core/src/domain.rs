//! crates/courseforge_core/src/domain.rs
//!
//! Defines the pure, core data structures for the course aggregate.
//! These structs are independent of any database engine; the JSON shape
//! produced by their serde derives is the persisted document format for
//! content blocks and assignments (dispatch on the discriminator field
//! before touching variant fields).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Raised when an aggregate would violate one of its structural invariants.
/// Assembly and construction paths abort with this instead of silently
/// truncating or clamping.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invariant violation: {0}")]
pub struct InvariantViolation(pub String);

/// Lifecycle status of a course as exposed to external observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CourseStatus {
    Draft,
    Generating,
    Review,
    Published,
    Archived,
}

impl CourseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CourseStatus::Draft => "draft",
            CourseStatus::Generating => "generating",
            CourseStatus::Review => "review",
            CourseStatus::Published => "published",
            CourseStatus::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Result<Self, InvariantViolation> {
        match s {
            "draft" => Ok(CourseStatus::Draft),
            "generating" => Ok(CourseStatus::Generating),
            "review" => Ok(CourseStatus::Review),
            "published" => Ok(CourseStatus::Published),
            "archived" => Ok(CourseStatus::Archived),
            other => Err(InvariantViolation(format!("unknown course status '{other}'"))),
        }
    }
}

/// Progress of the generation pipeline for a course. Persisted next to the
/// lifecycle status so observers can poll stage transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Pending,
    Interviewing,
    Planning,
    GeneratingModules,
    GeneratingAssessment,
    Completed,
    Failed,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Pending => "pending",
            GenerationStatus::Interviewing => "interviewing",
            GenerationStatus::Planning => "planning",
            GenerationStatus::GeneratingModules => "generating_modules",
            GenerationStatus::GeneratingAssessment => "generating_assessment",
            GenerationStatus::Completed => "completed",
            GenerationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, InvariantViolation> {
        match s {
            "pending" => Ok(GenerationStatus::Pending),
            "interviewing" => Ok(GenerationStatus::Interviewing),
            "planning" => Ok(GenerationStatus::Planning),
            "generating_modules" => Ok(GenerationStatus::GeneratingModules),
            "generating_assessment" => Ok(GenerationStatus::GeneratingAssessment),
            "completed" => Ok(GenerationStatus::Completed),
            "failed" => Ok(GenerationStatus::Failed),
            other => Err(InvariantViolation(format!(
                "unknown generation status '{other}'"
            ))),
        }
    }

    /// A generation is in flight until it reaches one of the two terminal
    /// states. Used by the orchestrator's duplicate-command check.
    pub fn is_terminal(&self) -> bool {
        matches!(self, GenerationStatus::Completed | GenerationStatus::Failed)
    }
}

fn default_true() -> bool {
    true
}

/// A single question-with-answer pair inside a quiz block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QuizQuestion {
    pub question: String,
    pub answer: String,
}

/// One unit of instructional material inside a module.
///
/// A closed tagged union: the `content_type` discriminator is immutable once
/// produced and readers must dispatch on it before accessing variant fields.
/// Adding a new block type is a compile-time-checked change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "content_type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Markdown lecture / theory material.
    Text {
        md_content: String,
        #[serde(default = "default_true")]
        ai_generated: bool,
    },
    /// A video found on an external platform.
    Video {
        url: String,
        platform: String,
        title: String,
        duration_seconds: u32,
        /// Timestamped key moments, e.g. `("1:05", "Introduction")`.
        #[serde(default)]
        key_moments: Vec<(String, String)>,
        #[serde(default)]
        discussion_questions: Vec<String>,
        #[serde(default = "default_true")]
        ai_generated: bool,
    },
    /// A worked code example with explanation.
    ProgramCode {
        language: String,
        code: String,
        explanation: String,
        #[serde(default = "default_true")]
        ai_generated: bool,
    },
    /// Self-check questions with answers.
    Quiz {
        questions: Vec<QuizQuestion>,
        #[serde(default = "default_true")]
        ai_generated: bool,
    },
    /// A mermaid diagram in markdown form.
    Mermaid {
        title: String,
        mermaid_code: String,
        explanation: String,
        #[serde(default = "default_true")]
        ai_generated: bool,
    },
    /// An external link attached by the instructor (cloud drive, article, ...).
    Link {
        title: String,
        url: String,
        #[serde(default)]
        ai_generated: bool,
    },
}

impl ContentBlock {
    /// The wire value of the discriminator field.
    pub fn content_type(&self) -> &'static str {
        match self {
            ContentBlock::Text { .. } => "text",
            ContentBlock::Video { .. } => "video",
            ContentBlock::ProgramCode { .. } => "program_code",
            ContentBlock::Quiz { .. } => "quiz",
            ContentBlock::Mermaid { .. } => "mermaid",
            ContentBlock::Link { .. } => "link",
        }
    }

    /// Plain-text rendering of the block's teachable content, used when
    /// re-indexing generated theory into the knowledge index. Links and
    /// videos carry no indexable theory of their own.
    pub fn theory_text(&self) -> Option<String> {
        match self {
            ContentBlock::Text { md_content, .. } => Some(md_content.clone()),
            ContentBlock::ProgramCode {
                language,
                code,
                explanation,
                ..
            } => Some(format!("{explanation}\n\n```{language}\n{code}\n```")),
            ContentBlock::Mermaid {
                title, explanation, ..
            } => Some(format!("{title}\n\n{explanation}")),
            ContentBlock::Quiz { questions, .. } => Some(
                questions
                    .iter()
                    .map(|q| format!("Q: {}\nA: {}", q.question, q.answer))
                    .collect::<Vec<_>>()
                    .join("\n\n"),
            ),
            ContentBlock::Video { .. } | ContentBlock::Link { .. } => None,
        }
    }
}

/// A question inside a test assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TestQuestion {
    /// The question or task statement shown to the student.
    pub text: String,
    /// Answer options; order is significant.
    pub options: Vec<String>,
    /// Zero-based indices of the correct options.
    pub correct_answers: Vec<usize>,
    pub points: u32,
}

impl TestQuestion {
    fn validate(&self) -> Result<(), InvariantViolation> {
        if self.options.len() < 2 {
            return Err(InvariantViolation(format!(
                "test question '{}' needs at least 2 options",
                self.text
            )));
        }
        if self.correct_answers.is_empty() {
            return Err(InvariantViolation(format!(
                "test question '{}' has no correct answers",
                self.text
            )));
        }
        if let Some(&idx) = self
            .correct_answers
            .iter()
            .find(|&&idx| idx >= self.options.len())
        {
            return Err(InvariantViolation(format!(
                "test question '{}' marks option {} correct but only {} options exist",
                self.text,
                idx,
                self.options.len()
            )));
        }
        Ok(())
    }
}

/// Variant-specific payload of an assignment, discriminated by
/// `assignment_type` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "assignment_type", rename_all = "snake_case")]
pub enum AssignmentKind {
    /// A graded multiple-choice test.
    Test { questions: Vec<TestQuestion> },
    /// The student uploads a file with their solution.
    FileUpload {
        task: String,
        allowed_extensions: Vec<String>,
        submission_instructions: String,
    },
    /// The student works in a GitHub repository.
    #[serde(rename = "github")]
    GitHub {
        repository_task: String,
        repository_rules: String,
        required_branch: String,
    },
}

impl AssignmentKind {
    pub fn assignment_type(&self) -> &'static str {
        match self {
            AssignmentKind::Test { .. } => "test",
            AssignmentKind::FileUpload { .. } => "file_upload",
            AssignmentKind::GitHub { .. } => "github",
        }
    }
}

/// The graded practical task attached to a module.
///
/// `version` 0 is the instructor's original; positive versions are generated
/// variants handed to individual students.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    #[serde(default)]
    pub version: u32,
    pub title: String,
    pub max_score: u32,
    pub passing_score: u32,
    #[serde(flatten)]
    pub kind: AssignmentKind,
}

impl Assignment {
    /// Builds an assignment, rejecting score and question-set combinations
    /// that can never be satisfied by a student.
    pub fn new(
        title: String,
        max_score: u32,
        passing_score: u32,
        kind: AssignmentKind,
    ) -> Result<Self, InvariantViolation> {
        let assignment = Self {
            version: 0,
            title,
            max_score,
            passing_score,
            kind,
        };
        assignment.validate()?;
        Ok(assignment)
    }

    pub fn validate(&self) -> Result<(), InvariantViolation> {
        if self.passing_score > self.max_score {
            return Err(InvariantViolation(format!(
                "assignment '{}': passing_score {} exceeds max_score {}",
                self.title, self.passing_score, self.max_score
            )));
        }
        if let AssignmentKind::Test { questions } = &self.kind {
            if questions.is_empty() {
                return Err(InvariantViolation(format!(
                    "test assignment '{}' has no questions",
                    self.title
                )));
            }
            for question in questions {
                question.validate()?;
            }
        }
        Ok(())
    }
}

/// The final assessment closing out a course (project, presentation, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FinalAssessment {
    #[serde(default)]
    pub version: u32,
    /// Task text shown to the student.
    pub task: String,
    pub evaluation_criteria: Vec<String>,
}

/// A module: one ordered part of a course. Owned exclusively by its course,
/// never shared between courses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub learning_objectives: Vec<String>,
    /// Zero-based position inside the course; also the rendering order.
    pub order: u32,
    pub content_blocks: Vec<ContentBlock>,
    pub assignment: Option<Assignment>,
}

impl Module {
    /// Creates the module shell persisted before content generation starts,
    /// so partial progress is observable.
    pub fn shell(title: String, description: String, objectives: Vec<String>, order: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            title,
            description,
            learning_objectives: objectives,
            order,
            content_blocks: Vec::new(),
            assignment: None,
        }
    }

    pub fn append_content_block(&mut self, block: ContentBlock) {
        self.content_blocks.push(block);
    }

    pub fn add_assignment(&mut self, assignment: Assignment) {
        self.assignment = Some(assignment);
    }

    /// Concatenated theory text of all blocks, for re-indexing into the
    /// tenant knowledge index.
    pub fn theory_text(&self) -> String {
        self.content_blocks
            .iter()
            .filter_map(ContentBlock::theory_text)
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn validate(&self) -> Result<(), InvariantViolation> {
        if self.content_blocks.is_empty() {
            return Err(InvariantViolation(format!(
                "module {} ('{}') has no content blocks",
                self.order, self.title
            )));
        }
        if let Some(assignment) = &self.assignment {
            assignment.validate()?;
        }
        Ok(())
    }
}

/// The course aggregate root.
///
/// Created with `status = generating` the instant the orchestrator accepts a
/// request; mutated only by the owning pipeline task; transitions to a
/// terminal status exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Course {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub creator_id: i64,
    pub status: CourseStatus,
    pub generation_status: GenerationStatus,
    /// Human-readable reason recorded when generation fails.
    pub failure_reason: Option<String>,
    pub title: String,
    pub description: String,
    pub learning_objectives: Vec<String>,
    pub modules: Vec<Module>,
    pub final_assessment: Option<FinalAssessment>,
}

impl Course {
    /// Creates the empty aggregate shell stored when a generation request is
    /// accepted. Title and description are filled by the structure planner.
    pub fn shell(creator_id: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            creator_id,
            status: CourseStatus::Generating,
            generation_status: GenerationStatus::Pending,
            failure_reason: None,
            title: String::new(),
            description: String::new(),
            learning_objectives: Vec::new(),
            modules: Vec::new(),
            final_assessment: None,
        }
    }

    pub fn append_module(&mut self, module: Module) {
        self.modules.push(module);
    }

    pub fn add_final_assessment(&mut self, final_assessment: FinalAssessment) {
        self.final_assessment = Some(final_assessment);
    }

    /// Full validation pass run by assembly before a course may leave the
    /// GENERATING state: modules non-empty, `order` a contiguous 0-based
    /// sequence matching position, every module holding content, at least
    /// two course learning objectives.
    pub fn validate_for_completion(&self) -> Result<(), InvariantViolation> {
        if self.title.trim().is_empty() {
            return Err(InvariantViolation("course has no title".to_string()));
        }
        if self.learning_objectives.len() < 2 {
            return Err(InvariantViolation(format!(
                "course '{}' has {} learning objectives, minimum is 2",
                self.title,
                self.learning_objectives.len()
            )));
        }
        if self.modules.is_empty() {
            return Err(InvariantViolation(format!(
                "course '{}' has no modules",
                self.title
            )));
        }
        for (position, module) in self.modules.iter().enumerate() {
            if module.order as usize != position {
                return Err(InvariantViolation(format!(
                    "module '{}' has order {} but sits at position {}",
                    module.title, module.order, position
                )));
            }
            module.validate()?;
        }
        Ok(())
    }
}
