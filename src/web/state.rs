use crate::config::AppConfig;
use crate::pipeline::SessionOrchestrator;
use crate::util::rate_limit::RateLimiter;
use std::sync::Arc;
use std::time::Duration;

/// Shared application state for the web server
pub struct AppState {
    pub config: AppConfig,
    pub orchestrator: Arc<SessionOrchestrator>,
    /// Applied to the routes that start or resume a query.
    pub rate_limiter: RateLimiter,
    pub startup_time: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    pub fn new(config: AppConfig, orchestrator: Arc<SessionOrchestrator>) -> Self {
        let rate_limiter = RateLimiter::new(
            config.rate_limit.max_requests,
            Duration::from_secs(config.rate_limit.window_secs),
        );
        Self {
            config,
            orchestrator,
            rate_limiter,
            startup_time: chrono::Utc::now(),
        }
    }
}
