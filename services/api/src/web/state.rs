//! services/api/src/web/state.rs
//!
//! Defines the application's shared state.

use std::sync::Arc;

use courseforge_core::ports::CourseRepository;

use crate::config::Config;
use crate::pipeline::InterviewManager;
use crate::queue::GenerationQueue;

/// The shared application state, created once at startup and passed to all
/// handlers.
#[derive(Clone)]
pub struct AppState {
    pub repository: Arc<dyn CourseRepository>,
    pub interviews: Arc<InterviewManager>,
    pub queue: GenerationQueue,
    pub config: Arc<Config>,
}
