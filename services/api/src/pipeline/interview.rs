//! services/api/src/pipeline/interview.rs
//!
//! The interview session: a bounded multi-turn dialogue that extracts
//! structured teacher insights from free-form conversation, optionally
//! grounded in the tenant's attached materials.
//!
//! State machine: `Started -> (Ask -> Answer)* -> Summarizing -> Completed`.
//! One session is keyed by `(tenant_id, user_id)`; starting a second while
//! one is active is rejected. The model decides when it has learned enough
//! via an explicit `finish` action, but a hard turn cap guarantees the
//! pipeline never blocks on this stage.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use courseforge_core::plan::{TeacherContext, TeacherInsights};
use courseforge_core::ports::{CapabilityService, CourseRepository, KnowledgeIndexService};
use courseforge_core::domain::{CourseStatus, GenerationStatus};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::llm::{
    toolset, ChatMessage, GenerationClient, GenerationError, StructuredOutput, ToolBudget, ToolSet,
};

const INTERVIEWER_ROLE: &str = "You are interviewing a teacher to prepare an online course on \
their subject. Ask one short, focused question at a time about the audience, the learning \
objectives, the topics to cover, common misconceptions and the teacher's favourite examples. \
Use the knowledge_search tool to peek at the teacher's attached materials before asking, so \
you do not ask what the materials already answer. When you have learned enough, or the \
teacher has nothing more to add, emit the finish action instead of another question.";

const SUMMARY_ROLE: &str = "You extract structured insights from an interview with a teacher. \
Fill each section only from what the interview actually established: the audience, the \
learning objectives, the topics to cover, the misconceptions to address and the preferred \
examples. Leave a section null or empty when the interview did not cover it; never invent \
content for a missing section.";

/// Caps on interview length.
#[derive(Debug, Clone, Copy)]
pub struct InterviewLimits {
    /// Questions the interviewer may ask before being forced to summarize.
    pub soft_question_cap: u32,
    /// Teacher turns after which summarization happens no matter what the
    /// model signals.
    pub hard_turn_cap: u32,
}

impl Default for InterviewLimits {
    fn default() -> Self {
        Self {
            soft_question_cap: 5,
            hard_turn_cap: 8,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InterviewError {
    #[error("an interview is already active for user {user_id} in tenant {tenant_id}")]
    SessionConflict { tenant_id: String, user_id: i64 },

    #[error("no active interview for user {user_id} in tenant {tenant_id}")]
    NotFound { tenant_id: String, user_id: i64 },

    #[error(transparent)]
    Generation(#[from] GenerationError),
}

/// What the caller gets back after a turn: the next question, or the
/// completed insights.
#[derive(Debug)]
pub enum InterviewTurn {
    Question(String),
    Completed {
        insights: TeacherInsights,
        course_id: Option<Uuid>,
    },
}

/// The interviewer's structured next move.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct InterviewerAction {
    action: InterviewerActionKind,
    question: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum InterviewerActionKind {
    Ask,
    Finish,
}

impl StructuredOutput for InterviewerAction {
    const NAME: &'static str = "interviewer_action";

    fn schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "action": {"type": "string", "enum": ["ask", "finish"]},
                "question": {"type": ["string", "null"]}
            },
            "required": ["action", "question"],
            "additionalProperties": false
        })
    }

    fn validate(&self) -> Result<(), String> {
        if self.action == InterviewerActionKind::Ask
            && self.question.as_deref().map_or(true, |q| q.trim().is_empty())
        {
            return Err("the ask action requires a non-empty question".to_string());
        }
        Ok(())
    }
}

impl StructuredOutput for TeacherInsights {
    const NAME: &'static str = "teacher_insights";

    fn schema() -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "audience": {"type": ["string", "null"]},
                "objectives": {"type": "array", "items": {"type": "string"}},
                "topics": {"type": "array", "items": {"type": "string"}},
                "misconceptions": {"type": "array", "items": {"type": "string"}},
                "examples": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["audience", "objectives", "topics", "misconceptions", "examples"],
            "additionalProperties": false
        })
    }
}

/// One active interview. Turns are serialized by the session mutex; the
/// transcript alternates interviewer questions and teacher answers.
struct InterviewSession {
    ctx: TeacherContext,
    course_id: Option<Uuid>,
    /// `(is_interviewer, text)` in chronological order.
    transcript: Vec<(bool, String)>,
    questions_asked: u32,
    teacher_turns: u32,
    tools: ToolSet,
}

impl InterviewSession {
    fn conversation(&self) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage::User(format!(
            "Interview topic, in the teacher's words: {}",
            self.ctx.comment
        ))];
        for (is_interviewer, text) in &self.transcript {
            if *is_interviewer {
                messages.push(ChatMessage::Assistant {
                    content: Some(text.clone()),
                    tool_calls: Vec::new(),
                });
            } else {
                messages.push(ChatMessage::User(text.clone()));
            }
        }
        messages
    }
}

type SessionKey = (String, i64);

/// Owns all active interview sessions and drives their turns.
pub struct InterviewManager {
    client: GenerationClient,
    repository: Arc<dyn CourseRepository>,
    capabilities: Arc<dyn CapabilityService>,
    knowledge: Arc<dyn KnowledgeIndexService>,
    model: String,
    limits: InterviewLimits,
    cancel: CancellationToken,
    sessions: Mutex<HashMap<SessionKey, Arc<tokio::sync::Mutex<InterviewSession>>>>,
}

impl InterviewManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: GenerationClient,
        repository: Arc<dyn CourseRepository>,
        capabilities: Arc<dyn CapabilityService>,
        knowledge: Arc<dyn KnowledgeIndexService>,
        model: String,
        limits: InterviewLimits,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            repository,
            capabilities,
            knowledge,
            model,
            limits,
            cancel,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Starts an interview for the teacher, returning the first turn. A
    /// second start while a session is active for the same key is rejected
    /// with `SessionConflict`, not surfaced as a failure.
    pub async fn start(
        &self,
        ctx: TeacherContext,
        course_id: Option<Uuid>,
    ) -> Result<InterviewTurn, InterviewError> {
        let key = (ctx.tenant_id.clone(), ctx.user_id);
        let session = {
            let mut sessions = self.sessions.lock().expect("session map poisoned");
            if sessions.contains_key(&key) {
                return Err(InterviewError::SessionConflict {
                    tenant_id: key.0,
                    user_id: key.1,
                });
            }
            let tools = ToolSet::new(
                ctx.tenant_id.clone(),
                Arc::clone(&self.capabilities),
                Arc::clone(&self.knowledge),
            )
            .with(toolset::KNOWLEDGE_SEARCH, ToolBudget::new(2, 12));
            let session = Arc::new(tokio::sync::Mutex::new(InterviewSession {
                ctx,
                course_id,
                transcript: Vec::new(),
                questions_asked: 0,
                teacher_turns: 0,
                tools,
            }));
            sessions.insert(key.clone(), session.clone());
            session
        };

        if let Some(course_id) = course_id {
            self.repository
                .update_status(
                    course_id,
                    CourseStatus::Generating,
                    GenerationStatus::Interviewing,
                    None,
                )
                .await
                .map_err(GenerationError::from)?;
        }

        let mut session = session.lock().await;
        info!(user_id = session.ctx.user_id, "interview started");
        self.advance(&mut session, &key).await
    }

    /// Records the teacher's answer and produces the next turn. Concurrent
    /// answers for one session are serialized by the session mutex.
    pub async fn answer(
        &self,
        tenant_id: &str,
        user_id: i64,
        text: String,
    ) -> Result<InterviewTurn, InterviewError> {
        let key = (tenant_id.to_string(), user_id);
        let session = {
            let sessions = self.sessions.lock().expect("session map poisoned");
            sessions
                .get(&key)
                .cloned()
                .ok_or_else(|| InterviewError::NotFound {
                    tenant_id: key.0.clone(),
                    user_id,
                })?
        };
        let mut session = session.lock().await;
        session.transcript.push((false, text));
        session.teacher_turns += 1;
        self.advance(&mut session, &key).await
    }

    /// Decides the next turn: ask another question, or summarize. The hard
    /// turn cap and the soft question cap both force summarization so the
    /// stage always terminates.
    async fn advance(
        &self,
        session: &mut InterviewSession,
        key: &SessionKey,
    ) -> Result<InterviewTurn, InterviewError> {
        if session.teacher_turns >= self.limits.hard_turn_cap
            || session.questions_asked >= self.limits.soft_question_cap
        {
            return self.complete(session, key).await;
        }

        let action: InterviewerAction = self
            .client
            .generate(
                "interview",
                &self.model,
                INTERVIEWER_ROLE,
                session.conversation(),
                Some(&session.tools),
                &self.cancel,
            )
            .await?;

        match action.action {
            InterviewerActionKind::Finish => self.complete(session, key).await,
            InterviewerActionKind::Ask => {
                // validate() guarantees the question is present and non-empty
                let question = action.question.unwrap_or_default();
                session.transcript.push((true, question.clone()));
                session.questions_asked += 1;
                Ok(InterviewTurn::Question(question))
            }
        }
    }

    /// One bounded summarization call, then the session is over.
    async fn complete(
        &self,
        session: &mut InterviewSession,
        key: &SessionKey,
    ) -> Result<InterviewTurn, InterviewError> {
        info!(
            user_id = session.ctx.user_id,
            questions = session.questions_asked,
            "summarizing interview"
        );
        let mut conversation = session.conversation();
        conversation.push(ChatMessage::User(
            "The interview is over. Produce the structured insights now.".to_string(),
        ));
        let insights: TeacherInsights = self
            .client
            .generate(
                "interview_summary",
                &self.model,
                SUMMARY_ROLE,
                conversation,
                None,
                &self.cancel,
            )
            .await?;

        self.sessions
            .lock()
            .expect("session map poisoned")
            .remove(key);
        info!(user_id = session.ctx.user_id, "interview completed");
        Ok(InterviewTurn::Completed {
            insights,
            course_id: session.course_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::super::test_support::{
        InMemoryRepository, NullCapabilities, RecordingKnowledge,
    };
    use super::*;
    use crate::llm::client::tests::ScriptedApi;
    use crate::llm::{ChatApiError, ChatOutcome, RetryPolicy};

    const ASK_1: &str = r#"{"action":"ask","question":"Who is the audience?"}"#;
    const ASK_2: &str = r#"{"action":"ask","question":"Which topics matter most?"}"#;
    const FINISH: &str = r#"{"action":"finish","question":null}"#;
    const INSIGHTS: &str = r#"{
        "audience": "Beginners",
        "objectives": ["Understand tables"],
        "topics": ["SQL"],
        "misconceptions": [],
        "examples": []
    }"#;

    fn manager(replies: Vec<&str>, limits: InterviewLimits) -> InterviewManager {
        let script: Vec<Result<ChatOutcome, ChatApiError>> = replies
            .into_iter()
            .map(|text| Ok(ChatOutcome::Content(text.to_string())))
            .collect();
        let client = GenerationClient::new(
            Arc::new(ScriptedApi::new(script)),
            RetryPolicy {
                max_attempts: 2,
                schema_retries: 1,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(1),
            },
            Duration::from_secs(5),
        );
        InterviewManager::new(
            client,
            Arc::new(InMemoryRepository::default()),
            Arc::new(NullCapabilities),
            Arc::new(RecordingKnowledge::default()),
            "interviewer-model".to_string(),
            limits,
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn interview_completes_when_model_signals_finish() {
        let manager = manager(vec![ASK_1, FINISH, INSIGHTS], InterviewLimits::default());
        let ctx = TeacherContext::new(1, "databases");

        let turn = manager.start(ctx, None).await.unwrap();
        let question = match turn {
            InterviewTurn::Question(q) => q,
            other => panic!("expected a question, got {other:?}"),
        };
        assert_eq!(question, "Who is the audience?");

        let turn = manager
            .answer("tenant-1", 1, "First-year students".to_string())
            .await
            .unwrap();
        match turn {
            InterviewTurn::Completed { insights, .. } => {
                assert_eq!(insights.audience.as_deref(), Some("Beginners"));
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_start_for_same_key_is_a_session_conflict() {
        let manager = manager(vec![ASK_1, ASK_2], InterviewLimits::default());
        manager
            .start(TeacherContext::new(1, "databases"), None)
            .await
            .unwrap();
        let err = manager
            .start(TeacherContext::new(1, "databases again"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, InterviewError::SessionConflict { .. }));
    }

    #[tokio::test]
    async fn different_users_can_interview_concurrently() {
        let manager = manager(vec![ASK_1, ASK_1], InterviewLimits::default());
        manager
            .start(TeacherContext::new(1, "databases"), None)
            .await
            .unwrap();
        manager
            .start(TeacherContext::new(2, "networking"), None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn hard_turn_cap_forces_summarization() {
        // The scripted model never finishes; the cap must end the interview.
        let limits = InterviewLimits {
            soft_question_cap: 10,
            hard_turn_cap: 2,
        };
        let manager = manager(vec![ASK_1, ASK_2, INSIGHTS], limits);
        let ctx = TeacherContext::new(3, "compilers");

        let mut turn = manager.start(ctx, None).await.unwrap();
        let mut answers = 0;
        loop {
            match turn {
                InterviewTurn::Question(_) => {
                    answers += 1;
                    assert!(answers <= limits.hard_turn_cap, "interview never terminated");
                    turn = manager
                        .answer("tenant-3", 3, format!("answer {answers}"))
                        .await
                        .unwrap();
                }
                InterviewTurn::Completed { .. } => break,
            }
        }
        assert_eq!(answers, 2);
    }

    #[tokio::test]
    async fn soft_question_cap_summarizes_without_asking_again() {
        let limits = InterviewLimits {
            soft_question_cap: 1,
            hard_turn_cap: 10,
        };
        // One ask allowed, then the next turn must summarize directly.
        let manager = manager(vec![ASK_1, INSIGHTS], limits);
        let ctx = TeacherContext::new(4, "statistics");

        manager.start(ctx, None).await.unwrap();
        let turn = manager
            .answer("tenant-4", 4, "Graduate students".to_string())
            .await
            .unwrap();
        assert!(matches!(turn, InterviewTurn::Completed { .. }));
    }

    #[tokio::test]
    async fn completed_session_frees_the_key() {
        let manager = manager(
            vec![ASK_1, FINISH, INSIGHTS, ASK_1],
            InterviewLimits::default(),
        );
        let ctx = TeacherContext::new(5, "history");
        manager.start(ctx.clone(), None).await.unwrap();
        manager
            .answer("tenant-5", 5, "done".to_string())
            .await
            .unwrap();
        // The key is free again.
        assert!(manager.start(ctx, None).await.is_ok());
    }
}
