//! Configuration loading: file discovery, `${ENV}` substitution, and the
//! root schema aggregating every subsystem's section.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{config_dir, discover_and_load, find_config_file, load_config, parse_config},
    schema::{GatewaySection, NachosConfig, ServerConfig},
};
