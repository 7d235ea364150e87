//! services/api/src/pipeline/orchestrator.rs
//!
//! The top-level pipeline state machine:
//! `PENDING -> INTERVIEWING (optional) -> PLANNING -> GENERATING_MODULES ->
//! GENERATING_ASSESSMENT (optional) -> COMPLETED | FAILED`.
//!
//! The orchestrator owns the course aggregate for the whole run: stages
//! return values and the orchestrator applies them. The persisted status is
//! updated after every transition so external observers can poll progress,
//! and the atomic claim makes duplicate commands for an in-flight course a
//! no-op.

use std::sync::Arc;
use std::time::Duration;

use courseforge_core::domain::{Course, CourseStatus, GenerationStatus};
use courseforge_core::plan::{TeacherContext, TeacherInsights};
use courseforge_core::ports::CourseRepository;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::assembly::CourseAssembler;
use super::module_builder::ModulePipeline;
use super::planner::{self, PlanSource};
use super::PipelineError;
use crate::llm::{GenerationClient, GenerationError};

/// A generation request as consumed from the task queue. The transport does
/// not guarantee exactly-once delivery; the claim below is the actual
/// correctness boundary.
#[derive(Debug, Clone)]
pub enum GenerationCommand {
    /// Generate a course for an existing (or caller-identified) course id
    /// from a raw teacher prompt.
    FromPrompt {
        course_id: Uuid,
        user_id: i64,
        prompt: String,
    },
    /// Generate from completed interview insights. Without a course id a
    /// fresh course is created on acceptance.
    FromInterview {
        course_id: Option<Uuid>,
        user_id: i64,
        insights: TeacherInsights,
    },
}

impl GenerationCommand {
    pub fn user_id(&self) -> i64 {
        match self {
            GenerationCommand::FromPrompt { user_id, .. } => *user_id,
            GenerationCommand::FromInterview { user_id, .. } => *user_id,
        }
    }
}

/// Terminal result of handling one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed { course_id: Uuid },
    /// Another run owns this course; the command was dropped on purpose.
    AlreadyRunning { course_id: Uuid },
    Failed { course_id: Uuid, reason: String },
}

pub struct Orchestrator {
    repository: Arc<dyn CourseRepository>,
    client: GenerationClient,
    modules: ModulePipeline,
    assembler: CourseAssembler,
    planner_model: String,
    /// Overall wall-clock budget for one pipeline run (the sum of stage
    /// budgets); past it the course is failed and the claim released.
    pipeline_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        repository: Arc<dyn CourseRepository>,
        client: GenerationClient,
        modules: ModulePipeline,
        planner_model: String,
        pipeline_timeout: Duration,
    ) -> Self {
        let assembler = CourseAssembler::new(Arc::clone(&repository));
        Self {
            repository,
            client,
            modules,
            assembler,
            planner_model,
            pipeline_timeout,
        }
    }

    /// Drives one generation command to a terminal status. Never panics the
    /// worker: every failure ends as a FAILED course with a readable reason.
    pub async fn handle(
        &self,
        command: GenerationCommand,
        cancel: CancellationToken,
    ) -> GenerationOutcome {
        let (mut course, source) = match self.resolve_course(&command).await {
            Ok(resolved) => resolved,
            Err(e) => {
                // Without a course row there is nothing to attach a FAILED
                // status to; the queue just logs and drops the command.
                error!(error = %e, "could not resolve course for generation command");
                return GenerationOutcome::Failed {
                    course_id: Uuid::nil(),
                    reason: e.to_string(),
                };
            }
        };
        let course_id = course.id;

        match self.repository.claim_generation(course_id).await {
            Ok(true) => {}
            Ok(false) => {
                info!(%course_id, "generation already in flight, ignoring duplicate command");
                return GenerationOutcome::AlreadyRunning { course_id };
            }
            Err(e) => {
                error!(%course_id, error = %e, "claim check failed");
                return GenerationOutcome::Failed {
                    course_id,
                    reason: e.to_string(),
                };
            }
        }
        // The claim moved the persisted row into PLANNING; mirror it on the
        // working aggregate. A re-run over a failed course starts from a
        // clean aggregate; its retained partial modules are superseded.
        course.status = CourseStatus::Generating;
        course.generation_status = GenerationStatus::Planning;
        course.failure_reason = None;
        course.modules.clear();
        course.final_assessment = None;
        info!(%course_id, "generation accepted, entering planning");

        let ctx = TeacherContext::new(command.user_id(), source_comment(&source));
        let result = tokio::time::timeout(
            self.pipeline_timeout,
            self.execute(&mut course, &ctx, &source, &cancel),
        )
        .await
        .unwrap_or(Err(PipelineError::DeadlineExceeded));

        match result {
            Ok(()) => GenerationOutcome::Completed { course_id },
            Err(e) => {
                let reason = e.to_string();
                warn!(%course_id, %reason, "generation failed, retaining partial course");
                // Completed modules were checkpointed as they finished; only
                // the status flag and reason remain to be written.
                if let Err(status_err) = self
                    .repository
                    .update_status(
                        course_id,
                        CourseStatus::Draft,
                        GenerationStatus::Failed,
                        Some(&reason),
                    )
                    .await
                {
                    error!(%course_id, error = %status_err, "failed to record FAILED status");
                }
                GenerationOutcome::Failed { course_id, reason }
            }
        }
    }

    /// Loads or creates the course shell the command refers to.
    async fn resolve_course(
        &self,
        command: &GenerationCommand,
    ) -> Result<(Course, PlanSource), PipelineError> {
        match command {
            GenerationCommand::FromPrompt {
                course_id,
                user_id,
                prompt,
            } => {
                let course = match self.repository.read(*course_id).await? {
                    Some(course) => course,
                    None => {
                        let mut shell = Course::shell(*user_id);
                        shell.id = *course_id;
                        self.repository.create(&shell).await?;
                        shell
                    }
                };
                Ok((course, PlanSource::Prompt(prompt.clone())))
            }
            GenerationCommand::FromInterview {
                course_id,
                user_id,
                insights,
            } => {
                let course = match course_id {
                    Some(id) => self
                        .repository
                        .read(*id)
                        .await?
                        .ok_or_else(|| {
                            courseforge_core::ports::PortError::NotFound(format!(
                                "Course {id} not found"
                            ))
                        })?,
                    None => {
                        let shell = Course::shell(*user_id);
                        self.repository.create(&shell).await?;
                        shell
                    }
                };
                Ok((course, PlanSource::Insights(insights.clone())))
            }
        }
    }

    /// The stage sequence proper. Any error propagates to `handle`, which
    /// turns it into a FAILED status.
    async fn execute(
        &self,
        course: &mut Course,
        ctx: &TeacherContext,
        source: &PlanSource,
        cancel: &CancellationToken,
    ) -> Result<(), PipelineError> {
        let plan =
            planner::plan_course_structure(&self.client, &self.planner_model, source, cancel)
                .await?;
        course.title = plan.title.clone();
        course.description = plan.description.clone();
        course.learning_objectives = plan.learning_objectives.clone();
        self.assembler.checkpoint(course).await?;

        self.transition(course, GenerationStatus::GeneratingModules)
            .await?;
        let total = plan.module_descriptions.len();
        for (order, description) in plan.module_descriptions.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(GenerationError::Cancelled {
                    stage: "generating_modules".to_string(),
                }
                .into());
            }
            info!(course_id = %course.id, module = order + 1, of = total, "generating module");
            let module = self
                .modules
                .run(ctx, course, &plan, order as u32, description, cancel)
                .await?;
            course.append_module(module);
            self.assembler.checkpoint(course).await?;
        }

        if let Some(description) = plan
            .final_assessment_description
            .as_deref()
            .filter(|d| !d.trim().is_empty())
        {
            self.transition(course, GenerationStatus::GeneratingAssessment)
                .await?;
            let assessment = planner::generate_final_assessment(
                &self.client,
                &self.planner_model,
                &plan,
                description,
                cancel,
            )
            .await?;
            course.add_final_assessment(assessment);
        }

        self.assembler.finalize(course, total).await?;
        Ok(())
    }

    /// Persists a stage transition and mirrors it on the working aggregate.
    async fn transition(
        &self,
        course: &mut Course,
        generation_status: GenerationStatus,
    ) -> Result<(), PipelineError> {
        course.status = CourseStatus::Generating;
        course.generation_status = generation_status;
        self.repository
            .update_status(
                course.id,
                CourseStatus::Generating,
                generation_status,
                None,
            )
            .await?;
        info!(course_id = %course.id, status = generation_status.as_str(), "stage transition");
        Ok(())
    }
}

fn source_comment(source: &PlanSource) -> String {
    match source {
        PlanSource::Prompt(prompt) => prompt.clone(),
        PlanSource::Insights(_) => "interview hand-off".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::super::test_support::{
        InMemoryRepository, NullCapabilities, RecordingKnowledge, SchemaRouterApi,
    };
    use super::*;
    use crate::llm::{ChatApi, ChatApiError, ChatOutcome, ChatRequest, RetryPolicy};

    const PLAN_JSON: &str = r#"{
        "title": "Intro to Databases",
        "description": "A one-semester beginner course",
        "audience_description": "First-year students",
        "learning_objectives": ["Model data", "Query data"],
        "module_descriptions": ["Relational model", "SQL basics", "Transactions"],
        "final_assessment_description": "A final schema-design project"
    }"#;

    const STRUCTURE_JSON: &str = r#"{
        "title": "A module",
        "description": "Module content",
        "learning_objectives": ["Learn it"],
        "content_plan": [
            {"content_type": "text", "prompt": "Explain"},
            {"content_type": "quiz", "prompt": "Check"},
            {"content_type": "text", "prompt": "Deepen"}
        ],
        "assignment_specification": {"assignment_type": "test", "prompt": "Test it"}
    }"#;

    const TEXT_JSON: &str = r##"{"md_content": "# Theory"}"##;
    const QUIZ_JSON: &str = r#"{"questions": [{"question": "Q?", "answer": "A."}]}"#;
    const TEST_JSON: &str = r#"{
        "title": "Module test", "max_score": 100, "passing_score": 60,
        "questions": [{"text": "Pick", "options": ["a", "b"],
                       "correct_answers": [1], "points": 10}]
    }"#;
    const ASSESSMENT_JSON: &str =
        r#"{"task": "Design a library schema", "evaluation_criteria": ["Normalization"]}"#;

    fn happy_path_api() -> SchemaRouterApi {
        SchemaRouterApi::new(vec![
            ("course_structure_plan", vec![PLAN_JSON]),
            (
                "module_structure",
                vec![STRUCTURE_JSON, STRUCTURE_JSON, STRUCTURE_JSON],
            ),
            (
                "text_block",
                vec![TEXT_JSON, TEXT_JSON, TEXT_JSON, TEXT_JSON, TEXT_JSON, TEXT_JSON],
            ),
            ("quiz_block", vec![QUIZ_JSON, QUIZ_JSON, QUIZ_JSON]),
            ("test_assignment", vec![TEST_JSON, TEST_JSON, TEST_JSON]),
            ("final_assessment", vec![ASSESSMENT_JSON]),
        ])
    }

    fn orchestrator(
        api: Arc<dyn ChatApi>,
        repository: Arc<InMemoryRepository>,
        timeout: Duration,
    ) -> Orchestrator {
        let retry = RetryPolicy {
            max_attempts: 2,
            schema_retries: 1,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        };
        let client = GenerationClient::new(api, retry, Duration::from_secs(5));
        let modules = ModulePipeline::new(
            client.clone(),
            repository.clone(),
            Arc::new(NullCapabilities),
            Arc::new(RecordingKnowledge::default()),
            "planner-model".to_string(),
            "content-model".to_string(),
        );
        Orchestrator::new(
            repository,
            client,
            modules,
            "planner-model".to_string(),
            timeout,
        )
    }

    fn prompt_command(course_id: Uuid) -> GenerationCommand {
        GenerationCommand::FromPrompt {
            course_id,
            user_id: 11,
            prompt: "Intro to Databases, beginner audience, 1 semester".to_string(),
        }
    }

    #[tokio::test]
    async fn full_pipeline_produces_a_completed_course() {
        let repository = Arc::new(InMemoryRepository::default());
        let orchestrator = orchestrator(
            Arc::new(happy_path_api()),
            repository.clone(),
            Duration::from_secs(30),
        );
        let course_id = Uuid::new_v4();

        let outcome = orchestrator
            .handle(prompt_command(course_id), CancellationToken::new())
            .await;
        assert_eq!(outcome, GenerationOutcome::Completed { course_id });

        let course = repository.course(course_id).unwrap();
        assert_eq!(course.status, CourseStatus::Review);
        assert_eq!(course.generation_status, GenerationStatus::Completed);
        assert_eq!(course.title, "Intro to Databases");
        assert_eq!(course.modules.len(), 3);
        for (position, module) in course.modules.iter().enumerate() {
            assert_eq!(module.order as usize, position);
            assert!(!module.content_blocks.is_empty());
            assert!(module.assignment.is_some());
        }
        assert!(course.final_assessment.is_some());
        assert!(course.validate_for_completion().is_ok());
    }

    #[tokio::test]
    async fn duplicate_concurrent_commands_run_exactly_once() {
        let repository = Arc::new(InMemoryRepository::default());
        let orchestrator = Arc::new(orchestrator(
            Arc::new(happy_path_api()),
            repository.clone(),
            Duration::from_secs(30),
        ));
        let course_id = Uuid::new_v4();
        // Pre-create so both commands race on the same row.
        let mut shell = Course::shell(11);
        shell.id = course_id;
        repository.create(&shell).await.unwrap();

        let (first, second) = tokio::join!(
            orchestrator.handle(prompt_command(course_id), CancellationToken::new()),
            orchestrator.handle(prompt_command(course_id), CancellationToken::new()),
        );

        let completed = [&first, &second]
            .iter()
            .filter(|outcome| matches!(outcome, GenerationOutcome::Completed { .. }))
            .count();
        let ignored = [&first, &second]
            .iter()
            .filter(|outcome| matches!(outcome, GenerationOutcome::AlreadyRunning { .. }))
            .count();
        assert_eq!(completed, 1, "exactly one pipeline must reach a terminal status");
        assert_eq!(ignored, 1, "the duplicate must be a no-op");
    }

    #[tokio::test]
    async fn module_failure_fails_course_but_retains_prior_modules() {
        // Module 0 succeeds; module 1's text generation never parses.
        let api = SchemaRouterApi::new(vec![
            ("course_structure_plan", vec![PLAN_JSON]),
            ("module_structure", vec![STRUCTURE_JSON, STRUCTURE_JSON]),
            ("text_block", vec![TEXT_JSON, TEXT_JSON, "garbage", "garbage"]),
            ("quiz_block", vec![QUIZ_JSON]),
            ("test_assignment", vec![TEST_JSON]),
        ]);
        let repository = Arc::new(InMemoryRepository::default());
        let orchestrator = orchestrator(Arc::new(api), repository.clone(), Duration::from_secs(30));
        let course_id = Uuid::new_v4();

        let outcome = orchestrator
            .handle(prompt_command(course_id), CancellationToken::new())
            .await;
        match outcome {
            GenerationOutcome::Failed { reason, .. } => {
                assert!(reason.contains("schema"), "unexpected reason: {reason}");
            }
            other => panic!("expected failure, got {other:?}"),
        }

        let course = repository.course(course_id).unwrap();
        assert_eq!(course.status, CourseStatus::Draft);
        assert_eq!(course.generation_status, GenerationStatus::Failed);
        assert!(course.failure_reason.is_some());
        // The completed first module is still attached and intact.
        assert!(!course.modules.is_empty());
        assert_eq!(course.modules[0].order, 0);
        assert!(!course.modules[0].content_blocks.is_empty());
    }

    #[tokio::test]
    async fn failed_course_can_be_claimed_again() {
        let api = SchemaRouterApi::new(vec![
            // First run: the plan never parses. Second run: everything works.
            (
                "course_structure_plan",
                vec!["bad", "bad", PLAN_JSON],
            ),
            (
                "module_structure",
                vec![STRUCTURE_JSON, STRUCTURE_JSON, STRUCTURE_JSON],
            ),
            (
                "text_block",
                vec![TEXT_JSON, TEXT_JSON, TEXT_JSON, TEXT_JSON, TEXT_JSON, TEXT_JSON],
            ),
            ("quiz_block", vec![QUIZ_JSON, QUIZ_JSON, QUIZ_JSON]),
            ("test_assignment", vec![TEST_JSON, TEST_JSON, TEST_JSON]),
            ("final_assessment", vec![ASSESSMENT_JSON]),
        ]);
        let repository = Arc::new(InMemoryRepository::default());
        let orchestrator = orchestrator(Arc::new(api), repository.clone(), Duration::from_secs(30));
        let course_id = Uuid::new_v4();

        let first = orchestrator
            .handle(prompt_command(course_id), CancellationToken::new())
            .await;
        assert!(matches!(first, GenerationOutcome::Failed { .. }));

        let second = orchestrator
            .handle(prompt_command(course_id), CancellationToken::new())
            .await;
        assert_eq!(second, GenerationOutcome::Completed { course_id });
    }

    struct StallingApi;

    #[async_trait]
    impl ChatApi for StallingApi {
        async fn complete(&self, _request: &ChatRequest) -> Result<ChatOutcome, ChatApiError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(ChatApiError::Timeout)
        }
    }

    #[tokio::test]
    async fn pipeline_deadline_fails_the_course() {
        let repository = Arc::new(InMemoryRepository::default());
        let orchestrator = orchestrator(
            Arc::new(StallingApi),
            repository.clone(),
            Duration::from_millis(20),
        );
        let course_id = Uuid::new_v4();

        let outcome = orchestrator
            .handle(prompt_command(course_id), CancellationToken::new())
            .await;
        match outcome {
            GenerationOutcome::Failed { reason, .. } => {
                assert!(reason.contains("deadline"), "unexpected reason: {reason}");
            }
            other => panic!("expected deadline failure, got {other:?}"),
        }
        let course = repository.course(course_id).unwrap();
        assert_eq!(course.generation_status, GenerationStatus::Failed);
    }

    #[tokio::test]
    async fn cancellation_fails_the_course_between_stages() {
        let repository = Arc::new(InMemoryRepository::default());
        let orchestrator = orchestrator(
            Arc::new(happy_path_api()),
            repository.clone(),
            Duration::from_secs(30),
        );
        let course_id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = orchestrator.handle(prompt_command(course_id), cancel).await;
        match outcome {
            GenerationOutcome::Failed { reason, .. } => {
                assert!(reason.contains("cancelled"), "unexpected reason: {reason}");
            }
            other => panic!("expected cancellation failure, got {other:?}"),
        }
    }
}
