//! services/api/src/pipeline/planner.rs
//!
//! The structure planner: one structured generation call that turns teacher
//! insights (or a raw prompt when no interview was run) into a
//! `CourseStructurePlan`. No retries beyond the generation client's own
//! schema retry; downstream stages rely on `module_descriptions` ordering
//! being preserved verbatim as module order.

use courseforge_core::domain::FinalAssessment;
use courseforge_core::plan::{CourseStructurePlan, TeacherInsights, MAX_MODULES, MIN_MODULES};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::llm::{ChatMessage, GenerationClient, GenerationError, StructuredOutput};

const PLANNER_ROLE: &str = "You are an experienced instructional designer planning the skeleton \
of an online course from a teacher's notes. Produce a course title, a short description for \
students, a description of the target audience, at least two course-level learning objectives, \
and an ordered list of module descriptions. Each module description must be detailed enough \
for another assistant to build the whole module from it alone: name the topics, the depth, and \
how it builds on earlier modules. Propose a final assessment description when the subject \
calls for one. Respond with a single JSON object matching the requested schema.";

const ASSESSMENT_ROLE: &str = "You are an assistant writing the final assessment that closes \
out a course. From the course context and the assessment description, produce the task text \
the student will see and a list of evaluation criteria. Respond with a single JSON object \
matching the requested schema.";

/// What the planner starts from: the interview's insights, or the teacher's
/// raw prompt when no interview was run.
#[derive(Debug, Clone)]
pub enum PlanSource {
    Prompt(String),
    Insights(TeacherInsights),
}

impl PlanSource {
    fn to_message(&self) -> String {
        match self {
            PlanSource::Prompt(prompt) => format!(
                "Plan a course from this teacher request:\n\n{prompt}"
            ),
            PlanSource::Insights(insights) => format!(
                "Plan a course from these interview insights. Sections marked as not obtained \
                 were not covered in the interview; do not invent their content.\n\n{}",
                insights.to_prompt()
            ),
        }
    }
}

impl StructuredOutput for CourseStructurePlan {
    const NAME: &'static str = "course_structure_plan";

    fn schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "title": {"type": "string"},
                "description": {"type": "string"},
                "audience_description": {"type": "string"},
                "learning_objectives": {
                    "type": "array",
                    "items": {"type": "string"},
                    "minItems": 2
                },
                "module_descriptions": {
                    "type": "array",
                    "items": {"type": "string"},
                    "minItems": MIN_MODULES,
                    "maxItems": MAX_MODULES
                },
                "final_assessment_description": {"type": ["string", "null"]}
            },
            "required": [
                "title", "description", "audience_description",
                "learning_objectives", "module_descriptions",
                "final_assessment_description"
            ],
            "additionalProperties": false
        })
    }

    fn validate(&self) -> Result<(), String> {
        CourseStructurePlan::validate(self).map_err(|e| e.to_string())
    }
}

/// Runs the single planning call.
pub async fn plan_course_structure(
    client: &GenerationClient,
    model: &str,
    source: &PlanSource,
    cancel: &CancellationToken,
) -> Result<CourseStructurePlan, GenerationError> {
    let plan: CourseStructurePlan = client
        .generate(
            "structure_planning",
            model,
            PLANNER_ROLE,
            vec![ChatMessage::User(source.to_message())],
            None,
            cancel,
        )
        .await?;
    info!(
        title = %plan.title,
        modules = plan.module_descriptions.len(),
        "course structure planned"
    );
    Ok(plan)
}

/// Model output for the final assessment; `version` stays 0 (the instructor
/// original) and is not the model's to set.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FinalAssessmentDraft {
    pub task: String,
    pub evaluation_criteria: Vec<String>,
}

impl StructuredOutput for FinalAssessmentDraft {
    const NAME: &'static str = "final_assessment";

    fn schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "task": {"type": "string"},
                "evaluation_criteria": {
                    "type": "array",
                    "items": {"type": "string"},
                    "minItems": 1
                }
            },
            "required": ["task", "evaluation_criteria"],
            "additionalProperties": false
        })
    }

    fn validate(&self) -> Result<(), String> {
        if self.task.trim().is_empty() {
            return Err("task must not be empty".to_string());
        }
        if self.evaluation_criteria.is_empty() {
            return Err("at least one evaluation criterion is required".to_string());
        }
        Ok(())
    }
}

/// Generates the optional final assessment from the plan's description.
pub async fn generate_final_assessment(
    client: &GenerationClient,
    model: &str,
    plan: &CourseStructurePlan,
    description: &str,
    cancel: &CancellationToken,
) -> Result<FinalAssessment, GenerationError> {
    let message = format!(
        "# Course\n{} — {}\n\n# Audience\n{}\n\n# Final assessment description\n{description}",
        plan.title, plan.description, plan.audience_description
    );
    let draft: FinalAssessmentDraft = client
        .generate(
            "final_assessment",
            model,
            ASSESSMENT_ROLE,
            vec![ChatMessage::User(message)],
            None,
            cancel,
        )
        .await?;
    Ok(FinalAssessment {
        version: 0,
        task: draft.task,
        evaluation_criteria: draft.evaluation_criteria,
    })
}
