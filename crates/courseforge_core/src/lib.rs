pub mod domain;
pub mod plan;
pub mod ports;

pub use domain::{
    Assignment, AssignmentKind, ContentBlock, Course, CourseStatus, FinalAssessment,
    GenerationStatus, InvariantViolation, Module, QuizQuestion, TestQuestion,
};
pub use plan::{
    AssignmentSpec, AssignmentType, ContentPlanItem, CourseStructurePlan, ModuleStructure,
    PlannedContentType, TeacherContext, TeacherInsights,
};
pub use ports::{
    CapabilityService, CourseRepository, KnowledgeIndexService, PortError, PortResult, SearchHit,
    VideoHit,
};
