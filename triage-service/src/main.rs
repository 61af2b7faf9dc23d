use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use triage_service::clients::{InferenceModel, LlmGateway, PgVectorRetriever, Retriever};
use triage_service::intake::{Directory, InMemoryDirectory};
use triage_service::logging::init_tracing;
use triage_service::{AppState, DepartmentValidator, Pipeline, ServiceConfig, Services, WorkerPool, build_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = match ServiceConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {:#}", e);
            std::process::exit(1);
        }
    };

    let services = init_services(&config).await;
    let validator = DepartmentValidator::new(&config.departments);
    let pipeline = Arc::new(Pipeline::new(services, validator));
    if !pipeline.is_ready() {
        warn!("Starting without a ready analysis pipeline; requests will be answered SERVICE_UNAVAILABLE");
    }

    let directory: Arc<dyn Directory> = match &config.directory_path {
        Some(path) => Arc::new(InMemoryDirectory::from_json_file(path).await?),
        None => {
            info!("No directory seed configured, departments addressable by name");
            Arc::new(InMemoryDirectory::with_departments(config.departments.clone()))
        }
    };

    let app = build_router(AppState {
        workers: WorkerPool::new(pipeline, config.max_workers),
        directory,
    });

    let listener = TcpListener::bind(config.addr).await?;
    info!(
        addr = %listener.local_addr()?,
        max_workers = config.max_workers,
        departments = ?config.departments,
        "Triage service listening"
    );

    axum::serve(listener, app).await?;
    Ok(())
}

/// Build the model and retrieval clients once. A failed subsystem is left
/// empty so the service still starts and reports itself unready.
async fn init_services(config: &ServiceConfig) -> Services {
    let model: Option<Arc<dyn InferenceModel>> = match &config.llm {
        Some(settings) => match LlmGateway::new(settings.clone()) {
            Ok(gateway) => Some(Arc::new(gateway)),
            Err(e) => {
                error!("Failed to initialize LLM gateway: {:#}", e);
                None
            }
        },
        None => {
            warn!("OPENROUTER_API_KEY not set, model unavailable");
            None
        }
    };

    let retriever: Option<Arc<dyn Retriever>> = match &config.knowledge_database_url {
        Some(url) => match PgVectorRetriever::connect(url, &config.knowledge_table).await {
            Ok(retriever) => Some(Arc::new(retriever)),
            Err(e) => {
                error!("Failed to initialize knowledge retriever: {:#}", e);
                None
            }
        },
        None => {
            warn!("KNOWLEDGE_DATABASE_URL not set, retrieval unavailable");
            None
        }
    };

    Services {
        model,
        retriever,
        top_k: config.top_k,
    }
}
