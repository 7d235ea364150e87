pub mod capabilities;
pub mod db;
pub mod index;

pub use capabilities::{ExternalCapabilities, SearchApiConfig};
pub use db::PgCourseRepository;
pub use index::PgKnowledgeIndex;
