mod config;

pub use config::{ConfigError, EndpointConfig, LinkConfig, Side};
