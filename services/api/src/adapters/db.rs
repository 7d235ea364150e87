//! services/api/src/adapters/db.rs
//!
//! The database adapter: the concrete implementation of the
//! `CourseRepository` port against PostgreSQL via `sqlx`. Content blocks and
//! assignments are persisted as JSONB documents carrying their discriminator
//! fields; the aggregate is reassembled on read with modules ordered by
//! `module_order`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use courseforge_core::domain::{
    Assignment, ContentBlock, Course, CourseStatus, FinalAssessment, GenerationStatus, Module,
};
use courseforge_core::ports::{CourseRepository, PortError, PortResult};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

/// A database adapter that implements the `CourseRepository` port.
#[derive(Clone)]
pub struct PgCourseRepository {
    pool: PgPool,
}

impl PgCourseRepository {
    /// Creates a new `PgCourseRepository`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// A helper function to run database migrations at startup.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

fn unexpected(e: sqlx::Error) -> PortError {
    PortError::Unexpected(e.to_string())
}

//=========================================================================================
// "Impure" Database Record Structs
//=========================================================================================

#[derive(FromRow)]
struct CourseRecord {
    id: Uuid,
    created_at: DateTime<Utc>,
    creator_id: i64,
    status: String,
    generation_status: String,
    failure_reason: Option<String>,
    title: String,
    description: String,
    learning_objectives: Json<Vec<String>>,
    final_assessment: Option<Json<FinalAssessment>>,
}

impl CourseRecord {
    fn to_domain(self, modules: Vec<Module>) -> PortResult<Course> {
        Ok(Course {
            id: self.id,
            created_at: self.created_at,
            creator_id: self.creator_id,
            status: CourseStatus::parse(&self.status)
                .map_err(|e| PortError::Unexpected(e.to_string()))?,
            generation_status: GenerationStatus::parse(&self.generation_status)
                .map_err(|e| PortError::Unexpected(e.to_string()))?,
            failure_reason: self.failure_reason,
            title: self.title,
            description: self.description,
            learning_objectives: self.learning_objectives.0,
            modules,
            final_assessment: self.final_assessment.map(|json| json.0),
        })
    }
}

#[derive(FromRow)]
struct ModuleRecord {
    id: Uuid,
    title: String,
    description: String,
    learning_objectives: Json<Vec<String>>,
    module_order: i32,
    content_blocks: Json<Vec<ContentBlock>>,
    assignment: Option<Json<Assignment>>,
}

impl ModuleRecord {
    fn to_domain(self) -> Module {
        Module {
            id: self.id,
            title: self.title,
            description: self.description,
            learning_objectives: self.learning_objectives.0,
            order: self.module_order as u32,
            content_blocks: self.content_blocks.0,
            assignment: self.assignment.map(|json| json.0),
        }
    }
}

const SELECT_COURSE: &str = "SELECT id, created_at, creator_id, status, generation_status, \
     failure_reason, title, description, learning_objectives, final_assessment \
     FROM courses WHERE id = $1";

const SELECT_MODULES: &str = "SELECT id, title, description, learning_objectives, module_order, \
     content_blocks, assignment \
     FROM modules WHERE course_id = $1 ORDER BY module_order";

const SELECT_MODULE: &str = "SELECT id, title, description, learning_objectives, module_order, \
     content_blocks, assignment \
     FROM modules WHERE id = $1";

const INSERT_COURSE: &str = "INSERT INTO courses (id, created_at, creator_id, status, generation_status, \
     failure_reason, title, description, learning_objectives, final_assessment) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)";

const UPDATE_COURSE_BODY: &str = "UPDATE courses SET status = $2, generation_status = $3, failure_reason = $4, \
     title = $5, description = $6, learning_objectives = $7, final_assessment = $8 \
     WHERE id = $1";

const UPSERT_MODULE: &str = "INSERT INTO modules (id, course_id, title, description, learning_objectives, \
     module_order, content_blocks, assignment) \
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
     ON CONFLICT (id) DO UPDATE SET title = $3, description = $4, \
     learning_objectives = $5, module_order = $6, content_blocks = $7, assignment = $8";

// The claimable set: not currently running and not completed. Moving the row
// to 'planning' in the same statement is what makes the claim atomic.
const CLAIM_GENERATION: &str = "UPDATE courses SET status = 'generating', generation_status = 'planning', \
     failure_reason = NULL \
     WHERE id = $1 AND generation_status IN ('pending', 'interviewing', 'failed') \
     RETURNING id";

//=========================================================================================
// `CourseRepository` Trait Implementation
//=========================================================================================

#[async_trait]
impl CourseRepository for PgCourseRepository {
    async fn create(&self, course: &Course) -> PortResult<()> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;
        sqlx::query(INSERT_COURSE)
            .bind(course.id)
            .bind(course.created_at)
            .bind(course.creator_id)
            .bind(course.status.as_str())
            .bind(course.generation_status.as_str())
            .bind(course.failure_reason.as_deref())
            .bind(&course.title)
            .bind(&course.description)
            .bind(Json(&course.learning_objectives))
            .bind(course.final_assessment.as_ref().map(Json))
            .execute(&mut *tx)
            .await
            .map_err(unexpected)?;
        for module in &course.modules {
            upsert_module(&mut tx, course.id, module).await?;
        }
        tx.commit().await.map_err(unexpected)
    }

    async fn read(&self, id: Uuid) -> PortResult<Option<Course>> {
        let record = sqlx::query_as::<_, CourseRecord>(SELECT_COURSE)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?;
        let Some(record) = record else {
            return Ok(None);
        };
        let modules = sqlx::query_as::<_, ModuleRecord>(SELECT_MODULES)
            .bind(id)
            .fetch_all(&self.pool)
            .await
            .map_err(unexpected)?
            .into_iter()
            .map(ModuleRecord::to_domain)
            .collect();
        record.to_domain(modules).map(Some)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: CourseStatus,
        generation_status: GenerationStatus,
        failure_reason: Option<&str>,
    ) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE courses SET status = $2, generation_status = $3, failure_reason = $4 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(generation_status.as_str())
        .bind(failure_reason)
        .execute(&self.pool)
        .await
        .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Course {id} not found")));
        }
        Ok(())
    }

    async fn claim_generation(&self, id: Uuid) -> PortResult<bool> {
        let claimed = sqlx::query(CLAIM_GENERATION)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(claimed.is_some())
    }

    async fn refresh(&self, course: &Course) -> PortResult<()> {
        let mut tx = self.pool.begin().await.map_err(unexpected)?;
        let result = sqlx::query(UPDATE_COURSE_BODY)
            .bind(course.id)
            .bind(course.status.as_str())
            .bind(course.generation_status.as_str())
            .bind(course.failure_reason.as_deref())
            .bind(&course.title)
            .bind(&course.description)
            .bind(Json(&course.learning_objectives))
            .bind(course.final_assessment.as_ref().map(Json))
            .execute(&mut *tx)
            .await
            .map_err(unexpected)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("Course {} not found", course.id)));
        }
        // Replace semantics: the aggregate in memory is the truth, including
        // modules dropped by a fresh generation run over a failed course.
        sqlx::query("DELETE FROM modules WHERE course_id = $1")
            .bind(course.id)
            .execute(&mut *tx)
            .await
            .map_err(unexpected)?;
        for module in &course.modules {
            upsert_module(&mut tx, course.id, module).await?;
        }
        tx.commit().await.map_err(unexpected)
    }

    async fn get_module(&self, id: Uuid) -> PortResult<Option<Module>> {
        let record = sqlx::query_as::<_, ModuleRecord>(SELECT_MODULE)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(unexpected)?;
        Ok(record.map(ModuleRecord::to_domain))
    }
}

async fn upsert_module(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    course_id: Uuid,
    module: &Module,
) -> PortResult<()> {
    sqlx::query(UPSERT_MODULE)
        .bind(module.id)
        .bind(course_id)
        .bind(&module.title)
        .bind(&module.description)
        .bind(Json(&module.learning_objectives))
        .bind(module.order as i32)
        .bind(Json(&module.content_blocks))
        .bind(module.assignment.as_ref().map(Json))
        .execute(&mut **tx)
        .await
        .map_err(unexpected)?;
    Ok(())
}
