pub mod rest;
pub mod state;

pub use rest::{
    answer_interview_handler, create_course_handler, get_course_handler,
    get_course_status_handler, get_module_handler, start_interview_handler, ApiDoc,
};
pub use state::AppState;
