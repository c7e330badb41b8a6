pub mod loader;
pub mod schema;

pub use loader::{
    apply_env_overrides, load_config, load_config_from_str, parse_worker_concurrency,
    WORKER_CONCURRENCY_ENV,
};
pub use schema::{BatchConfig, RetryConfig, ServiceConfig, TransformConfig};
