//! services/api/src/bin/api.rs

use std::sync::Arc;

use async_openai::{config::OpenAIConfig, Client};
use axum::{
    http::{
        header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE},
        HeaderValue, Method,
    },
    routing::{get, post},
    Router,
};
use courseforge_api::{
    adapters::{ExternalCapabilities, PgCourseRepository, PgKnowledgeIndex, SearchApiConfig},
    config::Config,
    error::ApiError,
    llm::{GenerationClient, OpenAiChatApi, RetryPolicy},
    pipeline::{interview::InterviewLimits, InterviewManager, ModulePipeline, Orchestrator},
    queue::spawn_worker,
    web::{
        answer_interview_handler, create_course_handler, get_course_handler,
        get_course_status_handler, get_module_handler, rest::ApiDoc, start_interview_handler,
        AppState,
    },
};
use courseforge_core::ports::{CapabilityService, CourseRepository, KnowledgeIndexService};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Connect to Database & Run Migrations ---
    info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;
    let repository = Arc::new(PgCourseRepository::new(db_pool.clone()));
    info!("Running database migrations...");
    repository.run_migrations().await?;
    info!("Database migrations complete.");

    // --- 3. Initialize the Model Client ---
    let mut openai_config = OpenAIConfig::new().with_api_key(
        config
            .openai_api_key
            .as_ref()
            .ok_or_else(|| ApiError::Internal("OPENAI_API_KEY is required".to_string()))?,
    );
    if let Some(base_url) = &config.openai_base_url {
        openai_config = openai_config.with_api_base(base_url);
    }
    let openai_client = Client::with_config(openai_config);

    let chat_api = Arc::new(OpenAiChatApi::new(openai_client.clone()));
    let generation_client = GenerationClient::new(
        chat_api.clone(),
        RetryPolicy::default(),
        config.call_timeout,
    );

    // --- 4. Initialize Adapters ---
    let repository: Arc<dyn CourseRepository> = repository;
    let knowledge: Arc<dyn KnowledgeIndexService> = Arc::new(PgKnowledgeIndex::new(
        db_pool.clone(),
        openai_client.clone(),
        config.embedding_model.clone(),
    ));

    let search = match (&config.search_api_url, &config.search_api_key) {
        (Some(base_url), Some(api_key)) => Some(SearchApiConfig {
            base_url: base_url.clone(),
            api_key: api_key.clone(),
        }),
        _ => None,
    };
    let capabilities: Arc<dyn CapabilityService> = Arc::new(
        ExternalCapabilities::new(search, chat_api.clone(), config.content_model.clone())
            .map_err(|e| ApiError::Internal(e.to_string()))?,
    );

    // --- 5. Assemble the Pipeline ---
    let shutdown = CancellationToken::new();
    let module_pipeline = ModulePipeline::new(
        generation_client.clone(),
        repository.clone(),
        capabilities.clone(),
        knowledge.clone(),
        config.planner_model.clone(),
        config.content_model.clone(),
    );
    let orchestrator = Arc::new(Orchestrator::new(
        repository.clone(),
        generation_client.clone(),
        module_pipeline,
        config.planner_model.clone(),
        config.pipeline_timeout,
    ));
    let queue = spawn_worker(
        orchestrator,
        64,
        config.max_concurrent_generations,
        shutdown.clone(),
    );

    let interviews = Arc::new(InterviewManager::new(
        generation_client,
        repository.clone(),
        capabilities,
        knowledge,
        config.interviewer_model.clone(),
        InterviewLimits::default(),
        shutdown.clone(),
    ));

    // --- 6. Build the Shared AppState & Router ---
    let app_state = Arc::new(AppState {
        repository: repository.clone(),
        interviews,
        queue,
        config: config.clone(),
    });

    let cors = CorsLayer::new()
        .allow_origin("http://localhost:3000".parse::<HeaderValue>().unwrap())
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([AUTHORIZATION, CONTENT_TYPE, ACCEPT]);

    let api_router = Router::new()
        .route("/courses", post(create_course_handler))
        .route("/courses/{id}", get(get_course_handler))
        .route("/courses/{id}/status", get(get_course_status_handler))
        .route("/modules/{id}", get(get_module_handler))
        .route("/interviews", post(start_interview_handler))
        .route("/interviews/answer", post(answer_interview_handler))
        .layer(cors)
        .with_state(app_state);

    // Merge the API router with the Swagger UI router for a complete application.
    let app = Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    // --- 7. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    axum::serve(listener, app).await?;
    shutdown.cancel();

    Ok(())
}
