//! crates/courseforge_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the generation pipeline.
//! These traits form the boundary of the hexagonal architecture, allowing the
//! core to be independent of specific external implementations like databases,
//! vector stores or search APIs.

use async_trait::async_trait;
use uuid::Uuid;

use crate::domain::{Course, CourseStatus, GenerationStatus, Module};

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services
/// (e.g., database, network).
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Repository Port
//=========================================================================================

/// Persistence contract for the course aggregate.
///
/// During generation the aggregate is written exclusively by the owning
/// pipeline task; `claim_generation` is the atomic check-and-set that makes
/// that exclusivity hold across duplicate commands.
#[async_trait]
pub trait CourseRepository: Send + Sync {
    /// Stores a freshly created aggregate.
    async fn create(&self, course: &Course) -> PortResult<()>;

    /// Reads the full aggregate, modules ordered by `order`.
    async fn read(&self, id: Uuid) -> PortResult<Option<Course>>;

    /// Updates lifecycle + generation status (and the failure reason) without
    /// touching the aggregate body. Called after every stage transition so
    /// external observers can poll progress.
    async fn update_status(
        &self,
        id: Uuid,
        status: CourseStatus,
        generation_status: GenerationStatus,
        failure_reason: Option<&str>,
    ) -> PortResult<()>;

    /// Atomically claims a course for generation: succeeds (returns `true`)
    /// only if no other run owns the course (its generation status is
    /// pending, interviewing or failed), moving it into the planning stage
    /// in the same operation. A `false` return means another run owns the
    /// course and the caller must treat its command as a no-op.
    async fn claim_generation(&self, id: Uuid) -> PortResult<bool>;

    /// Merges the full aggregate back into the store (course row + module
    /// rows), replacing what is persisted. Used after each completed module
    /// for progress visibility and by the final assembly pass.
    async fn refresh(&self, course: &Course) -> PortResult<()>;

    /// Reads a single module by id.
    async fn get_module(&self, id: Uuid) -> PortResult<Option<Module>>;
}

//=========================================================================================
// Knowledge Index Port
//=========================================================================================

/// Per-tenant semantic store of chunked text with metadata filtering.
///
/// Writes to one tenant's partition must be serialized by the implementation;
/// reads are safe to run concurrently with each other and with writes to
/// other tenants.
#[async_trait]
pub trait KnowledgeIndexService: Send + Sync {
    /// Chunks, embeds and stores a document under the tenant's partition.
    /// Returns the ids of the stored chunks.
    async fn index(
        &self,
        tenant_id: &str,
        category: &str,
        source: &str,
        text: &str,
    ) -> PortResult<Vec<Uuid>>;

    /// Similarity search over the tenant's partition, optionally restricted
    /// to one category (`materials`, `theory`, ...).
    async fn search(
        &self,
        tenant_id: &str,
        query: &str,
        category: Option<&str>,
        limit: usize,
    ) -> PortResult<Vec<String>>;
}

//=========================================================================================
// Capability Port (external tool collaborators)
//=========================================================================================

/// One hit returned by the web search capability.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

/// One hit returned by the video search capability.
#[derive(Debug, Clone)]
pub struct VideoHit {
    pub title: String,
    pub url: String,
    pub platform: String,
    pub duration_seconds: u32,
}

/// External tools the generation stages may call, behind their allow-lists.
#[async_trait]
pub trait CapabilityService: Send + Sync {
    async fn web_search(&self, query: &str) -> PortResult<Vec<SearchHit>>;

    /// Fetches a page and returns its content as markdown.
    async fn browse_page(&self, url: &str) -> PortResult<String>;

    async fn video_search(&self, query: &str) -> PortResult<Vec<VideoHit>>;

    /// Produces mermaid markup for the described diagram.
    async fn draw_diagram(&self, prompt: &str) -> PortResult<String>;

    /// Produces example code in the given language.
    async fn write_code(&self, language: &str, prompt: &str) -> PortResult<String>;
}
