//! services/api/src/pipeline/assembly.rs
//!
//! Course assembly and persistence: checkpoints the accumulating aggregate
//! after each completed module (for progress visibility) and runs the final
//! validation pass before a course may leave the GENERATING state. Invariant
//! violations abort persistence; nothing partial is committed by the final
//! pass.

use std::sync::Arc;

use courseforge_core::domain::{Course, CourseStatus, GenerationStatus, InvariantViolation};
use courseforge_core::ports::CourseRepository;
use tracing::info;

use super::PipelineError;

pub struct CourseAssembler {
    repository: Arc<dyn CourseRepository>,
}

impl CourseAssembler {
    pub fn new(repository: Arc<dyn CourseRepository>) -> Self {
        Self { repository }
    }

    /// Persists the aggregate mid-generation so observers can see partial
    /// progress. No validation: the course is allowed to be incomplete here.
    pub async fn checkpoint(&self, course: &Course) -> Result<(), PipelineError> {
        self.repository.refresh(course).await?;
        Ok(())
    }

    /// Final pass: validates the finished aggregate against its structural
    /// invariants, marks it completed and persists. `expected_modules` is
    /// the length of the plan's module descriptions; a mismatch means a
    /// module was silently dropped and is rejected rather than truncated.
    pub async fn finalize(
        &self,
        course: &mut Course,
        expected_modules: usize,
    ) -> Result<(), PipelineError> {
        if course.modules.len() != expected_modules {
            return Err(InvariantViolation(format!(
                "course '{}' has {} modules but the plan described {expected_modules}",
                course.title,
                course.modules.len()
            ))
            .into());
        }
        course.validate_for_completion()?;

        course.status = CourseStatus::Review;
        course.generation_status = GenerationStatus::Completed;
        course.failure_reason = None;
        self.repository.refresh(course).await?;
        info!(course_id = %course.id, title = %course.title, "course assembled and persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use courseforge_core::domain::{ContentBlock, Module};

    use super::super::test_support::InMemoryRepository;
    use super::*;

    fn module_with_block(order: u32) -> Module {
        let mut module = Module::shell(
            format!("Module {order}"),
            "desc".to_string(),
            vec!["objective".to_string()],
            order,
        );
        module.append_content_block(ContentBlock::Text {
            md_content: "theory".to_string(),
            ai_generated: true,
        });
        module
    }

    fn generated_course(module_orders: &[u32]) -> Course {
        let mut course = Course::shell(9);
        course.title = "Networking".to_string();
        course.description = "Packets and protocols".to_string();
        course.learning_objectives = vec!["Read a pcap".to_string(), "Subnet".to_string()];
        for &order in module_orders {
            course.append_module(module_with_block(order));
        }
        course
    }

    #[tokio::test]
    async fn finalize_marks_course_completed_and_persists() {
        let repository = Arc::new(InMemoryRepository::default());
        let assembler = CourseAssembler::new(repository.clone());
        let mut course = generated_course(&[0, 1, 2]);
        repository.create(&course).await.unwrap();

        assembler.finalize(&mut course, 3).await.unwrap();

        let stored = repository.course(course.id).unwrap();
        assert_eq!(stored.status, CourseStatus::Review);
        assert_eq!(stored.generation_status, GenerationStatus::Completed);
    }

    #[tokio::test]
    async fn finalize_rejects_order_gap() {
        let repository = Arc::new(InMemoryRepository::default());
        let assembler = CourseAssembler::new(repository.clone());
        // Module 1 carries order 2: a gap.
        let mut course = generated_course(&[0, 2]);
        repository.create(&course).await.unwrap();

        let err = assembler.finalize(&mut course, 2).await.unwrap_err();
        assert!(matches!(err, PipelineError::Invariant(_)));
        // Nothing was committed by the failed pass.
        let stored = repository.course(course.id).unwrap();
        assert_eq!(stored.generation_status, GenerationStatus::Pending);
    }

    #[tokio::test]
    async fn created_course_reads_back_identical() {
        let repository = Arc::new(InMemoryRepository::default());
        let course = generated_course(&[0, 1]);
        repository.create(&course).await.unwrap();
        let read_back = repository.read(course.id).await.unwrap().unwrap();
        assert_eq!(read_back, course);
    }

    #[tokio::test]
    async fn finalize_rejects_module_count_mismatch() {
        let repository = Arc::new(InMemoryRepository::default());
        let assembler = CourseAssembler::new(repository.clone());
        let mut course = generated_course(&[0, 1]);
        repository.create(&course).await.unwrap();

        let err = assembler.finalize(&mut course, 3).await.unwrap_err();
        assert!(matches!(err, PipelineError::Invariant(_)));
    }
}
