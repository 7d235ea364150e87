//! services/api/src/web/rest.rs
//!
//! Contains the Axum handlers for the REST API endpoints and the master
//! definition for the OpenAPI specification. This surface is deliberately
//! thin: it pushes generation commands in and serves course/module reads
//! out; all real work happens in the pipeline.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use courseforge_core::domain::{Course, Module};
use courseforge_core::plan::TeacherContext;
use serde::{Deserialize, Serialize};
use tracing::error;
use utoipa::{OpenApi, ToSchema};
use uuid::Uuid;

use crate::pipeline::interview::InterviewError;
use crate::pipeline::{GenerationCommand, InterviewTurn};
use crate::queue::enqueue_or_log;
use crate::web::state::AppState;

//=========================================================================================
// OpenAPI Master Definition
//=========================================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        create_course_handler,
        get_course_handler,
        get_course_status_handler,
        get_module_handler,
        start_interview_handler,
        answer_interview_handler,
    ),
    components(
        schemas(
            CreateCourseRequest,
            CreateCourseResponse,
            CourseResponse,
            CourseStatusResponse,
            ModuleResponse,
            StartInterviewRequest,
            AnswerInterviewRequest,
            InterviewTurnResponse
        )
    ),
    tags(
        (name = "Courseforge API", description = "Course generation pipeline endpoints.")
    )
)]
pub struct ApiDoc;

//=========================================================================================
// API Response and Payload Structs
//=========================================================================================

/// Request to create a course and start generating it.
#[derive(Deserialize, ToSchema)]
pub struct CreateCourseRequest {
    pub user_id: i64,
    /// The teacher's free-form description of the course they want.
    pub prompt: String,
    /// When true, an interview is run first instead of planning directly
    /// from the prompt.
    #[serde(default)]
    pub interview: bool,
}

#[derive(Serialize, ToSchema)]
pub struct CreateCourseResponse {
    pub course_id: Uuid,
    pub status: String,
    pub generation_status: String,
    /// First interview question, when an interview was requested.
    pub question: Option<String>,
}

#[derive(Serialize, ToSchema)]
pub struct ModuleResponse {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub learning_objectives: Vec<String>,
    pub order: u32,
    /// Content block documents, each carrying its `content_type`
    /// discriminator.
    #[schema(value_type = Vec<Object>)]
    pub content_blocks: Vec<serde_json::Value>,
    /// Assignment document carrying its `assignment_type` discriminator.
    #[schema(value_type = Option<Object>)]
    pub assignment: Option<serde_json::Value>,
}

impl ModuleResponse {
    fn from_domain(module: Module) -> Self {
        Self {
            id: module.id,
            title: module.title,
            description: module.description,
            learning_objectives: module.learning_objectives,
            order: module.order,
            content_blocks: module
                .content_blocks
                .iter()
                .map(|block| serde_json::to_value(block).unwrap_or_default())
                .collect(),
            assignment: module
                .assignment
                .as_ref()
                .map(|assignment| serde_json::to_value(assignment).unwrap_or_default()),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct CourseResponse {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub creator_id: i64,
    pub status: String,
    pub generation_status: String,
    pub failure_reason: Option<String>,
    pub title: String,
    pub description: String,
    pub learning_objectives: Vec<String>,
    pub modules: Vec<ModuleResponse>,
    #[schema(value_type = Option<Object>)]
    pub final_assessment: Option<serde_json::Value>,
}

impl CourseResponse {
    fn from_domain(course: Course) -> Self {
        Self {
            id: course.id,
            created_at: course.created_at,
            creator_id: course.creator_id,
            status: course.status.as_str().to_string(),
            generation_status: course.generation_status.as_str().to_string(),
            failure_reason: course.failure_reason.clone(),
            title: course.title.clone(),
            description: course.description.clone(),
            learning_objectives: course.learning_objectives.clone(),
            final_assessment: course
                .final_assessment
                .as_ref()
                .map(|assessment| serde_json::to_value(assessment).unwrap_or_default()),
            modules: course
                .modules
                .into_iter()
                .map(ModuleResponse::from_domain)
                .collect(),
        }
    }
}

/// Progress snapshot for polling observers.
#[derive(Serialize, ToSchema)]
pub struct CourseStatusResponse {
    pub course_id: Uuid,
    pub status: String,
    pub generation_status: String,
    pub failure_reason: Option<String>,
    pub modules_generated: usize,
}

#[derive(Deserialize, ToSchema)]
pub struct StartInterviewRequest {
    pub user_id: i64,
    /// What the teacher wants a course about.
    pub comment: String,
    /// Existing course to attach the interview to, if any.
    pub course_id: Option<Uuid>,
}

#[derive(Deserialize, ToSchema)]
pub struct AnswerInterviewRequest {
    pub user_id: i64,
    pub answer: String,
}

#[derive(Serialize, ToSchema)]
pub struct InterviewTurnResponse {
    /// The next question, when the interview continues.
    pub question: Option<String>,
    pub completed: bool,
    /// Course the completed interview handed off to, when one was attached.
    pub course_id: Option<Uuid>,
}

//=========================================================================================
// REST API Handlers
//=========================================================================================

/// Create a course and start its generation pipeline.
#[utoipa::path(
    post,
    path = "/courses",
    request_body = CreateCourseRequest,
    responses(
        (status = 202, description = "Course accepted for generation", body = CreateCourseResponse),
        (status = 409, description = "An interview is already active for this user"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn create_course_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<CreateCourseRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let course = Course::shell(payload.user_id);
    app_state.repository.create(&course).await.map_err(|e| {
        error!("Failed to create course shell: {e}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to create course".to_string(),
        )
    })?;

    let question = if payload.interview {
        let ctx = TeacherContext::new(payload.user_id, payload.prompt.clone());
        let turn = app_state
            .interviews
            .start(ctx, Some(course.id))
            .await
            .map_err(interview_error_response)?;
        match turn {
            InterviewTurn::Question(question) => Some(question),
            InterviewTurn::Completed {
                insights,
                course_id,
            } => {
                // Degenerate interview that finished immediately; hand off.
                enqueue_or_log(
                    &app_state.queue,
                    GenerationCommand::FromInterview {
                        course_id,
                        user_id: payload.user_id,
                        insights,
                    },
                )
                .await;
                None
            }
        }
    } else {
        enqueue_or_log(
            &app_state.queue,
            GenerationCommand::FromPrompt {
                course_id: course.id,
                user_id: payload.user_id,
                prompt: payload.prompt,
            },
        )
        .await;
        None
    };

    let response = CreateCourseResponse {
        course_id: course.id,
        status: course.status.as_str().to_string(),
        generation_status: course.generation_status.as_str().to_string(),
        question,
    };
    Ok((StatusCode::ACCEPTED, Json(response)))
}

/// Read a full course aggregate.
#[utoipa::path(
    get,
    path = "/courses/{id}",
    responses(
        (status = 200, description = "The course", body = CourseResponse),
        (status = 404, description = "Course not found"),
        (status = 500, description = "Internal server error")
    ),
    params(("id" = Uuid, Path, description = "Course id"))
)]
pub async fn get_course_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let course = read_course(&app_state, id).await?;
    Ok(Json(CourseResponse::from_domain(course)))
}

/// Poll generation progress for a course.
#[utoipa::path(
    get,
    path = "/courses/{id}/status",
    responses(
        (status = 200, description = "Progress snapshot", body = CourseStatusResponse),
        (status = 404, description = "Course not found"),
        (status = 500, description = "Internal server error")
    ),
    params(("id" = Uuid, Path, description = "Course id"))
)]
pub async fn get_course_status_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let course = read_course(&app_state, id).await?;
    Ok(Json(CourseStatusResponse {
        course_id: course.id,
        status: course.status.as_str().to_string(),
        generation_status: course.generation_status.as_str().to_string(),
        failure_reason: course.failure_reason,
        modules_generated: course.modules.len(),
    }))
}

/// Read a single module.
#[utoipa::path(
    get,
    path = "/modules/{id}",
    responses(
        (status = 200, description = "The module", body = ModuleResponse),
        (status = 404, description = "Module not found"),
        (status = 500, description = "Internal server error")
    ),
    params(("id" = Uuid, Path, description = "Module id"))
)]
pub async fn get_module_handler(
    State(app_state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let module = app_state
        .repository
        .get_module(id)
        .await
        .map_err(|e| {
            error!("Failed to read module {id}: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read module".to_string(),
            )
        })?
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Module {id} not found")))?;
    Ok(Json(ModuleResponse::from_domain(module)))
}

/// Start an interview for a teacher.
#[utoipa::path(
    post,
    path = "/interviews",
    request_body = StartInterviewRequest,
    responses(
        (status = 200, description = "First interview turn", body = InterviewTurnResponse),
        (status = 409, description = "An interview is already active for this user"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn start_interview_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<StartInterviewRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let ctx = TeacherContext::new(payload.user_id, payload.comment);
    let turn = app_state
        .interviews
        .start(ctx, payload.course_id)
        .await
        .map_err(interview_error_response)?;
    Ok(Json(turn_response(&app_state, payload.user_id, turn).await))
}

/// Submit the teacher's answer and get the next turn.
#[utoipa::path(
    post,
    path = "/interviews/answer",
    request_body = AnswerInterviewRequest,
    responses(
        (status = 200, description = "Next interview turn", body = InterviewTurnResponse),
        (status = 404, description = "No active interview for this user"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn answer_interview_handler(
    State(app_state): State<Arc<AppState>>,
    Json(payload): Json<AnswerInterviewRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let ctx = TeacherContext::new(payload.user_id, String::new());
    let turn = app_state
        .interviews
        .answer(&ctx.tenant_id, payload.user_id, payload.answer)
        .await
        .map_err(interview_error_response)?;
    Ok(Json(turn_response(&app_state, payload.user_id, turn).await))
}

//=========================================================================================
// Helpers
//=========================================================================================

async fn read_course(app_state: &AppState, id: Uuid) -> Result<Course, (StatusCode, String)> {
    app_state
        .repository
        .read(id)
        .await
        .map_err(|e| {
            error!("Failed to read course {id}: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to read course".to_string(),
            )
        })?
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Course {id} not found")))
}

/// Converts a turn into its response; a completed interview enqueues the
/// generation command as a side effect.
async fn turn_response(app_state: &AppState, user_id: i64, turn: InterviewTurn) -> InterviewTurnResponse {
    match turn {
        InterviewTurn::Question(question) => InterviewTurnResponse {
            question: Some(question),
            completed: false,
            course_id: None,
        },
        InterviewTurn::Completed {
            insights,
            course_id,
        } => {
            enqueue_or_log(
                &app_state.queue,
                GenerationCommand::FromInterview {
                    course_id,
                    user_id,
                    insights,
                },
            )
            .await;
            InterviewTurnResponse {
                question: None,
                completed: true,
                course_id,
            }
        }
    }
}

fn interview_error_response(err: InterviewError) -> (StatusCode, String) {
    match &err {
        InterviewError::SessionConflict { .. } => (StatusCode::CONFLICT, err.to_string()),
        InterviewError::NotFound { .. } => (StatusCode::NOT_FOUND, err.to_string()),
        InterviewError::Generation(inner) => {
            error!("Interview turn failed: {inner}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Interview turn failed".to_string(),
            )
        }
    }
}
