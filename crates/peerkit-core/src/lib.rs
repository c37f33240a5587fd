mod config;
pub use config::{
    config_schema_json, load_config, parse_host_list, Config, FetcherConfig, ServerConfig,
    SignalingConfig,
};
