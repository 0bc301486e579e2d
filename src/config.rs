//! Configuration loading from environment variables.
//!
//! Uses the following environment variables:
//! - `KILN_NODE_NAME`: name this node registers under (default: kiln-node);
//!   nodes sharing a store must use distinct names
//! - `KILN_DATABASE_URL`: PostgreSQL connection string (optional; absent
//!   means the embedded in-memory store, single-node only)
//!
//! Everything else is runtime configuration and lives in the store's
//! global parameters.

use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    pub node_name: String,
    pub database_url: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        let node_name = env::var("KILN_NODE_NAME").unwrap_or_else(|_| "kiln-node".to_string());
        let database_url = env::var("KILN_DATABASE_URL")
            .ok()
            .filter(|value| !value.is_empty());
        Self {
            node_name,
            database_url,
        }
    }
}
