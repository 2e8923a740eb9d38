pub mod config;

pub use config::{
    generate_replica_id, AppConfig, CacheSection, ClusterSection, ConfigError, GraphSection,
    NodeSection, CONFIG_ENV_VAR, CONFIG_FILE_NAME,
};
