use clap::Parser;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

mod cache;
mod config;
mod db;
mod llm;
mod pipeline;
mod schema;
mod sql;
mod store;
mod util;
mod web;

use crate::cache::query_cache::QueryCache;
use crate::config::{AppConfig, CliArgs};
use crate::llm::{ChatModel, LlmManager};
use crate::pipeline::SessionOrchestrator;
use crate::schema::cache::{load_descriptions, SchemaCache};
use crate::util::logging::init_tracing;
use crate::util::metrics::PipelineMetrics;
use crate::web::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Provider keys usually live in .env during development
    let _ = dotenvy::dotenv();

    // Parse command line arguments
    let args = CliArgs::parse();

    // Load configuration
    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    // Initialize logging
    init_tracing(&config.logging.format);

    info!(
        "Opening {} database at {}",
        config.database.backend, config.database.connection_string
    );
    let backend = db::create_backend(&config.database)?;

    let descriptions = match &config.schema.descriptions_path {
        Some(path) => load_descriptions(path)?,
        None => HashMap::new(),
    };
    let schema = Arc::new(SchemaCache::new(
        backend,
        config.schema.clone(),
        descriptions,
    ));

    // Warm the schema cache; a failure here is retried on first use
    match schema.get(false).await {
        Ok(snapshot) => info!("Discovered {} tables", snapshot.tables.len()),
        Err(e) => warn!("Initial schema discovery failed: {}", e),
    }

    let metrics = Arc::new(PipelineMetrics::new());
    let llm: Arc<dyn ChatModel> = Arc::new(LlmManager::new(&config.llm, metrics.clone())?);

    info!("Using {} storage", config.storage.backend);
    let stores = store::create_stores(&config.storage)?;

    let query_cache = config
        .query_cache
        .enabled
        .then(|| Arc::new(QueryCache::new(Duration::from_secs(config.query_cache.ttl_secs))));

    let orchestrator = Arc::new(SessionOrchestrator::new(
        schema,
        llm,
        stores,
        query_cache,
        &config.pipeline,
        Duration::from_secs(config.database.query_timeout_secs),
        metrics,
    ));

    let app_state = Arc::new(AppState::new(config.clone(), orchestrator));

    // Start the web server
    info!("Starting NL-SQL server on {}:{}", config.web.host, config.web.port);
    match web::run_server(config.web, app_state).await {
        Ok(_) => info!("Server stopped gracefully"),
        Err(e) => {
            error!("Server error: {}", e);
            return Err(e.into());
        }
    }

    Ok(())
}
