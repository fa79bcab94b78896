use crate::auth::AuthKeys;
use crate::rate_limit::RateLimiter;
use execution_engine::config::GatewayConfig;
use execution_engine::engine::Engine;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub auth: Arc<AuthKeys>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, config: &GatewayConfig) -> Self {
        Self {
            engine,
            auth: Arc::new(AuthKeys::new(&config.jwt_secret)),
            rate_limiter: Arc::new(RateLimiter::new(config.burst, config.requests_per_second)),
        }
    }
}
