use crate::{cross_node::conn::PoolOptions, session::manager::SessionOptions};
use log::LevelFilter;
use serde::Deserialize;
use std::{env, fs::read_to_string, net::IpAddr, path::Path, time::Duration};

/// The server version extracted from the Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable key to load the config from
const CONFIG_ENV_KEY: &str = "RM_CONFIG_JSON";

pub fn load_config() -> Option<Config> {
    // Attempt to load the config from the env
    if let Ok(env) = env::var(CONFIG_ENV_KEY) {
        let config: Config = match serde_json::from_str(&env) {
            Ok(value) => value,
            Err(err) => {
                eprintln!("Failed to load env config (Using default): {:?}", err);
                return None;
            }
        };
        return Some(config);
    }

    // Attempt to load the config from disk
    let file = Path::new("config.json");
    if !file.exists() {
        return None;
    }

    let data = match read_to_string(file) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("Failed to load config file (Using defaults): {:?}", err);
            return None;
        }
    };

    let config: Config = match serde_json::from_str(&data) {
        Ok(value) => value,
        Err(err) => {
            eprintln!("Failed to load config file (Using default): {:?}", err);
            return None;
        }
    };

    Some(config)
}

#[derive(Deserialize)]
#[serde(default)]
pub struct Config {
    pub host: IpAddr,
    /// Port the client-facing control listener binds
    pub port: u16,
    /// Port the cross-node listener binds
    pub cross_node_port: u16,
    /// This gateway's identity within the mesh
    pub node_id: String,
    /// Address peers should dial to reach the cross-node listener;
    /// published to the shared store when set
    pub advertise_addr: Option<String>,
    pub max_connections: Option<usize>,
    pub max_control_connections: Option<usize>,
    pub heartbeat_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
    pub state_ttl_secs: u64,
    pub waiting_ttl_secs: u64,
    /// Secret behind tunnel state signatures and reconnect tokens; must
    /// match across the mesh
    pub state_signature_secret: String,
    pub pool: PoolConfig,
    pub logging: LevelFilter,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: IpAddr::from([0, 0, 0, 0]),
            port: 50051,
            cross_node_port: 50052,
            node_id: "node-1".to_string(),
            advertise_addr: None,
            max_connections: None,
            max_control_connections: None,
            heartbeat_timeout_secs: 90,
            cleanup_interval_secs: 30,
            state_ttl_secs: 300,
            waiting_ttl_secs: 10,
            state_signature_secret: "change-me".to_string(),
            pool: Default::default(),
            logging: LevelFilter::Info,
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub min_conns: usize,
    pub max_conns: usize,
    pub idle_timeout_secs: u64,
    pub dial_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_conns: 2,
            max_conns: 10,
            idle_timeout_secs: 300,
            dial_timeout_secs: 5,
        }
    }
}

impl Config {
    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            min_conns: self.pool.min_conns,
            max_conns: self.pool.max_conns,
            dial_timeout: Duration::from_secs(self.pool.dial_timeout_secs),
            idle_timeout: Duration::from_secs(self.pool.idle_timeout_secs),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            node_id: self.node_id.clone(),
            max_connections: self.max_connections,
            max_control_connections: self.max_control_connections,
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            cleanup_interval: Duration::from_secs(self.cleanup_interval_secs),
            state_ttl: Duration::from_secs(self.state_ttl_secs),
            waiting_ttl: Duration::from_secs(self.waiting_ttl_secs),
            pool: self.pool_options(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::Config;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.cross_node_port, 50052);
        assert_eq!(config.pool.max_conns, 10);
        assert_eq!(config.pool.min_conns, 2);
        assert_eq!(config.state_ttl_secs, 300);
    }

    #[test]
    fn test_partial_config_parses() {
        let config: Config =
            serde_json::from_str(r#"{"node_id":"gw-7","pool":{"max_conns":4}}"#).unwrap();
        assert_eq!(config.node_id, "gw-7");
        assert_eq!(config.pool.max_conns, 4);
        // Untouched fields keep their defaults
        assert_eq!(config.pool.min_conns, 2);
        assert_eq!(config.port, 50051);
    }
}
