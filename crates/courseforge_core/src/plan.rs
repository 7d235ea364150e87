//! crates/courseforge_core/src/plan.rs
//!
//! Ephemeral types that exist only while a generation pipeline runs: the
//! requesting teacher's context, the insights extracted by the interview,
//! and the structure plans produced by the planning stages. None of these
//! are persisted independently; they are consumed by the next stage and
//! dropped.

use serde::{Deserialize, Serialize};

use crate::domain::InvariantViolation;

/// Identifies the requester and their private knowledge-index partition.
/// Created once per generation request and passed to every generation call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeacherContext {
    pub user_id: i64,
    /// Isolation boundary for the teacher's private knowledge index.
    pub tenant_id: String,
    /// The teacher's free-form request or interview hand-off.
    pub comment: String,
}

impl TeacherContext {
    pub fn new(user_id: i64, comment: impl Into<String>) -> Self {
        Self {
            user_id,
            tenant_id: format!("tenant-{user_id}"),
            comment: comment.into(),
        }
    }
}

const NOT_OBTAINED: &str = "(not obtained during the interview)";

/// Structured summary extracted from the interview with the teacher.
///
/// Every section is optional: a section the interview did not cover stays
/// `None` and renders as an explicit "not obtained" marker, it is never
/// fabricated. Produced once by the interview session, consumed by the
/// structure planner, never mutated afterward.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TeacherInsights {
    pub audience: Option<String>,
    #[serde(default)]
    pub objectives: Vec<String>,
    #[serde(default)]
    pub topics: Vec<String>,
    /// Misconceptions the teacher wants addressed head-on.
    #[serde(default)]
    pub misconceptions: Vec<String>,
    /// Concrete examples the teacher likes to use.
    #[serde(default)]
    pub examples: Vec<String>,
}

impl TeacherInsights {
    /// Renders the insights as the planner's input prompt. Missing sections
    /// are marked, not invented.
    pub fn to_prompt(&self) -> String {
        fn section(title: &str, items: &[String]) -> String {
            if items.is_empty() {
                format!("## {title}\n{NOT_OBTAINED}")
            } else {
                let bullets = items
                    .iter()
                    .map(|item| format!("- {item}"))
                    .collect::<Vec<_>>()
                    .join("\n");
                format!("## {title}\n{bullets}")
            }
        }
        let audience = match &self.audience {
            Some(audience) => format!("## Audience\n{audience}"),
            None => format!("## Audience\n{NOT_OBTAINED}"),
        };
        [
            audience,
            section("Learning objectives", &self.objectives),
            section("Topics to cover", &self.topics),
            section("Common misconceptions", &self.misconceptions),
            section("Preferred examples", &self.examples),
        ]
        .join("\n\n")
    }
}

/// Bounds on the number of modules a plan may propose.
pub const MIN_MODULES: usize = 3;
pub const MAX_MODULES: usize = 12;

/// The course skeleton produced by the structure planner.
///
/// `module_descriptions` ordering is significant: it becomes module `order`
/// downstream, verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CourseStructurePlan {
    pub title: String,
    pub description: String,
    pub audience_description: String,
    pub learning_objectives: Vec<String>,
    pub module_descriptions: Vec<String>,
    #[serde(default)]
    pub final_assessment_description: Option<String>,
}

impl CourseStructurePlan {
    pub fn validate(&self) -> Result<(), InvariantViolation> {
        if self.title.trim().is_empty() {
            return Err(InvariantViolation("plan has an empty title".to_string()));
        }
        if self.learning_objectives.len() < 2 {
            return Err(InvariantViolation(format!(
                "plan proposes {} learning objectives, minimum is 2",
                self.learning_objectives.len()
            )));
        }
        let count = self.module_descriptions.len();
        if !(MIN_MODULES..=MAX_MODULES).contains(&count) {
            return Err(InvariantViolation(format!(
                "plan proposes {count} modules, expected between {MIN_MODULES} and {MAX_MODULES}"
            )));
        }
        Ok(())
    }
}

/// Content types the module planner may schedule. `link` is deliberately
/// absent: link blocks are instructor attachments, never generated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlannedContentType {
    Text,
    Video,
    ProgramCode,
    Quiz,
    Mermaid,
}

impl PlannedContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlannedContentType::Text => "text",
            PlannedContentType::Video => "video",
            PlannedContentType::ProgramCode => "program_code",
            PlannedContentType::Quiz => "quiz",
            PlannedContentType::Mermaid => "mermaid",
        }
    }
}

/// Assignment types the module planner may pick for a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentType {
    Test,
    FileUpload,
    #[serde(rename = "github")]
    GitHub,
}

impl AssignmentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AssignmentType::Test => "test",
            AssignmentType::FileUpload => "file_upload",
            AssignmentType::GitHub => "github",
        }
    }
}

/// One planned content block: which generator to run and the detailed prompt
/// to run it with. Plan order is the student-visible reading order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContentPlanItem {
    pub content_type: PlannedContentType,
    pub prompt: String,
}

/// The planned assignment for a module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssignmentSpec {
    pub assignment_type: AssignmentType,
    pub prompt: String,
}

/// Minimum number of content blocks a module plan must schedule.
pub const MIN_CONTENT_BLOCKS: usize = 3;

/// The per-module plan produced by the first stage of the module pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModuleStructure {
    pub title: String,
    pub description: String,
    pub learning_objectives: Vec<String>,
    /// Ordered generation plan; its order is the rendering order of the
    /// module's content blocks.
    pub content_plan: Vec<ContentPlanItem>,
    pub assignment_specification: AssignmentSpec,
}

impl ModuleStructure {
    pub fn validate(&self) -> Result<(), InvariantViolation> {
        if self.title.trim().is_empty() {
            return Err(InvariantViolation(
                "module structure has an empty title".to_string(),
            ));
        }
        if self.content_plan.len() < MIN_CONTENT_BLOCKS {
            return Err(InvariantViolation(format!(
                "module '{}' plans {} content blocks, minimum is {MIN_CONTENT_BLOCKS}",
                self.title,
                self.content_plan.len()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_with_modules(count: usize) -> CourseStructurePlan {
        CourseStructurePlan {
            title: "Intro to Databases".to_string(),
            description: "A one-semester beginner course".to_string(),
            audience_description: "First-year students".to_string(),
            learning_objectives: vec!["Model data".to_string(), "Query data".to_string()],
            module_descriptions: (0..count).map(|i| format!("Module {i}")).collect(),
            final_assessment_description: None,
        }
    }

    #[test]
    fn plan_accepts_module_counts_in_bounds() {
        assert!(plan_with_modules(3).validate().is_ok());
        assert!(plan_with_modules(12).validate().is_ok());
    }

    #[test]
    fn plan_rejects_module_counts_out_of_bounds() {
        assert!(plan_with_modules(2).validate().is_err());
        assert!(plan_with_modules(13).validate().is_err());
    }

    #[test]
    fn module_structure_requires_three_blocks() {
        let structure = ModuleStructure {
            title: "Relational model".to_string(),
            description: "Tables and keys".to_string(),
            learning_objectives: vec!["Understand keys".to_string()],
            content_plan: vec![
                ContentPlanItem {
                    content_type: PlannedContentType::Text,
                    prompt: "Explain tables".to_string(),
                },
                ContentPlanItem {
                    content_type: PlannedContentType::Quiz,
                    prompt: "Quiz on keys".to_string(),
                },
            ],
            assignment_specification: AssignmentSpec {
                assignment_type: AssignmentType::Test,
                prompt: "A short test".to_string(),
            },
        };
        assert!(structure.validate().is_err());
    }

    #[test]
    fn insights_prompt_marks_missing_sections() {
        let insights = TeacherInsights {
            audience: Some("Working engineers".to_string()),
            objectives: vec!["Ship faster".to_string()],
            ..Default::default()
        };
        let prompt = insights.to_prompt();
        assert!(prompt.contains("Working engineers"));
        assert!(prompt.contains("- Ship faster"));
        assert!(prompt.contains("(not obtained during the interview)"));
    }

    #[test]
    fn planned_content_type_uses_wire_names() {
        let json = serde_json::to_value(PlannedContentType::ProgramCode).unwrap();
        assert_eq!(json, "program_code");
        let json = serde_json::to_value(AssignmentType::GitHub).unwrap();
        assert_eq!(json, "github");
    }
}
