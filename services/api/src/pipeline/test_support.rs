//! services/api/src/pipeline/test_support.rs
//!
//! In-memory fakes shared by the pipeline tests: a course repository over a
//! hash map, a chat backend that routes canned replies by schema name, and
//! no-op capability / knowledge implementations.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use courseforge_core::domain::{Course, CourseStatus, GenerationStatus, Module};
use courseforge_core::ports::{
    CapabilityService, CourseRepository, KnowledgeIndexService, PortError, PortResult, SearchHit,
    VideoHit,
};
use uuid::Uuid;

use crate::llm::{ChatApi, ChatApiError, ChatOutcome, ChatRequest};

/// Course repository over a mutex-guarded map, with the same claim semantics
/// as the SQL adapter.
#[derive(Default)]
pub(crate) struct InMemoryRepository {
    courses: Mutex<HashMap<Uuid, Course>>,
    pub refresh_log: Mutex<Vec<Course>>,
}

impl InMemoryRepository {
    pub fn course(&self, id: Uuid) -> Option<Course> {
        self.courses.lock().unwrap().get(&id).cloned()
    }
}

#[async_trait]
impl CourseRepository for InMemoryRepository {
    async fn create(&self, course: &Course) -> PortResult<()> {
        self.courses
            .lock()
            .unwrap()
            .insert(course.id, course.clone());
        Ok(())
    }

    async fn read(&self, id: Uuid) -> PortResult<Option<Course>> {
        Ok(self.courses.lock().unwrap().get(&id).cloned())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: CourseStatus,
        generation_status: GenerationStatus,
        failure_reason: Option<&str>,
    ) -> PortResult<()> {
        let mut courses = self.courses.lock().unwrap();
        let course = courses
            .get_mut(&id)
            .ok_or_else(|| PortError::NotFound(format!("Course {id} not found")))?;
        course.status = status;
        course.generation_status = generation_status;
        course.failure_reason = failure_reason.map(str::to_string);
        Ok(())
    }

    async fn claim_generation(&self, id: Uuid) -> PortResult<bool> {
        let mut courses = self.courses.lock().unwrap();
        let course = courses
            .get_mut(&id)
            .ok_or_else(|| PortError::NotFound(format!("Course {id} not found")))?;
        let claimable = matches!(
            course.generation_status,
            GenerationStatus::Pending | GenerationStatus::Interviewing | GenerationStatus::Failed
        );
        if claimable {
            course.status = CourseStatus::Generating;
            course.generation_status = GenerationStatus::Planning;
            course.failure_reason = None;
        }
        Ok(claimable)
    }

    async fn refresh(&self, course: &Course) -> PortResult<()> {
        self.refresh_log.lock().unwrap().push(course.clone());
        self.courses
            .lock()
            .unwrap()
            .insert(course.id, course.clone());
        Ok(())
    }

    async fn get_module(&self, id: Uuid) -> PortResult<Option<Module>> {
        let courses = self.courses.lock().unwrap();
        Ok(courses
            .values()
            .flat_map(|course| course.modules.iter())
            .find(|module| module.id == id)
            .cloned())
    }
}

/// Chat backend that answers by the requested schema name, popping canned
/// replies in order. Robust to call ordering across stages.
pub(crate) struct SchemaRouterApi {
    replies: Mutex<HashMap<&'static str, Vec<String>>>,
}

impl SchemaRouterApi {
    pub fn new(replies: Vec<(&'static str, Vec<&str>)>) -> Self {
        Self {
            replies: Mutex::new(
                replies
                    .into_iter()
                    .map(|(name, texts)| {
                        (name, texts.into_iter().map(str::to_string).collect())
                    })
                    .collect(),
            ),
        }
    }
}

#[async_trait]
impl ChatApi for SchemaRouterApi {
    async fn complete(&self, request: &ChatRequest) -> Result<ChatOutcome, ChatApiError> {
        let name = request
            .schema
            .as_ref()
            .map(|schema| schema.name)
            .unwrap_or("plain");
        let mut replies = self.replies.lock().unwrap();
        let queue = replies
            .get_mut(name)
            .ok_or_else(|| ChatApiError::Provider(format!("no scripted reply for '{name}'")))?;
        if queue.is_empty() {
            return Err(ChatApiError::Provider(format!(
                "scripted replies for '{name}' exhausted"
            )));
        }
        Ok(ChatOutcome::Content(queue.remove(0)))
    }
}

/// Capabilities that return empty results; pipeline tests never need real
/// tool output.
pub(crate) struct NullCapabilities;

#[async_trait]
impl CapabilityService for NullCapabilities {
    async fn web_search(&self, _query: &str) -> PortResult<Vec<SearchHit>> {
        Ok(Vec::new())
    }

    async fn browse_page(&self, _url: &str) -> PortResult<String> {
        Ok(String::new())
    }

    async fn video_search(&self, _query: &str) -> PortResult<Vec<VideoHit>> {
        Ok(Vec::new())
    }

    async fn draw_diagram(&self, _prompt: &str) -> PortResult<String> {
        Ok("flowchart TD".to_string())
    }

    async fn write_code(&self, _language: &str, _prompt: &str) -> PortResult<String> {
        Ok("fn main() {}".to_string())
    }
}

/// Knowledge index that records writes and serves canned search results.
#[derive(Default)]
pub(crate) struct RecordingKnowledge {
    pub indexed: Mutex<Vec<(String, String, String, String)>>,
}

#[async_trait]
impl KnowledgeIndexService for RecordingKnowledge {
    async fn index(
        &self,
        tenant_id: &str,
        category: &str,
        source: &str,
        text: &str,
    ) -> PortResult<Vec<Uuid>> {
        self.indexed.lock().unwrap().push((
            tenant_id.to_string(),
            category.to_string(),
            source.to_string(),
            text.to_string(),
        ));
        Ok(vec![Uuid::new_v4()])
    }

    async fn search(
        &self,
        _tenant_id: &str,
        _query: &str,
        _category: Option<&str>,
        _limit: usize,
    ) -> PortResult<Vec<String>> {
        Ok(vec!["recalled material".to_string()])
    }
}
