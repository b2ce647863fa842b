pub mod backend;
pub mod circuit_breaker;
pub mod orchestrator;
pub mod preprocess;
pub mod progress;
pub mod queue;
pub mod rate_limiter;
pub mod retry;
pub mod workers_ai;
