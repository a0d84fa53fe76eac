use std::fs::File;
use std::io::Read;
use std::sync::{Arc, RwLock};

use serde::Deserialize;
use serde::Serialize;

use crate::common::Result;

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub master: MasterConfig,
    #[serde(default)]
    pub system: SystemConfig,
}

impl BridgeConfig {
    pub fn from_str(config_str: &str) -> Result<Self> {
        Ok(toml::from_str(config_str)?)
    }

    pub fn from_file(config_file: &str) -> Result<Self> {
        let mut file = File::open(config_file)?;
        let mut config_str = String::new();
        file.read_to_string(&mut config_str)?;
        Self::from_str(&config_str)
    }
}

/// Settings of the proxy listener: where to listen, which backends to relay
/// to and how to treat pooled backend connections.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProxyConfig {
    /// listening address:port of the proxy listener
    #[serde(default = "default_proxy_address")]
    pub address: String,
    /// address:port of the read-write backend servers
    #[serde(default = "default_backend_addresses")]
    pub backend_addresses: Vec<String>,
    /// address:port of the read-only backend servers
    #[serde(default)]
    pub read_only_backend_addresses: Vec<String>,
    /// suppress the duplicate ERR packet some older servers send on a failed auth
    #[serde(default)]
    pub fix_bug_25371: bool,
    /// issue a COM_CHANGE_USER to scrub session state when a connection is
    /// taken from the pool
    #[serde(default = "default_true")]
    pub pool_change_user: bool,
    /// connection script executed at every protocol transition
    #[serde(default)]
    pub script: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            address: default_proxy_address(),
            backend_addresses: default_backend_addresses(),
            read_only_backend_addresses: Vec::new(),
            fix_bug_25371: false,
            pool_change_user: true,
            script: None,
        }
    }
}

/// Settings of the master listener, which answers clients on its own from
/// scripted input instead of relaying to a backend.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct MasterConfig {
    /// listening address:port of the master listener
    #[serde(default = "default_master_address")]
    pub address: String,
    /// username allowed to log in
    #[serde(default = "default_master_username")]
    pub username: String,
    /// password of that user
    #[serde(default = "default_master_password")]
    pub password: String,
    /// connection script producing the synthesized responses
    #[serde(default)]
    pub script: Option<String>,
}

impl Default for MasterConfig {
    fn default() -> Self {
        MasterConfig {
            address: default_master_address(),
            username: default_master_username(),
            password: default_master_password(),
            script: None,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SystemConfig {
    /// worker threads of the runtime; a connection stays on the thread that
    /// accepted it
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            workers: default_workers(),
        }
    }
}

fn default_proxy_address() -> String {
    String::from(":4040")
}

fn default_master_address() -> String {
    String::from(":4041")
}

fn default_backend_addresses() -> Vec<String> {
    vec![String::from("127.0.0.1:3306")]
}

fn default_master_username() -> String {
    String::from("root")
}

fn default_master_password() -> String {
    String::from("secret")
}

fn default_workers() -> usize {
    1
}

fn default_true() -> bool {
    true
}

/// Expand a `:port` shorthand into a bindable `host:port` address.
pub fn listen_address(address: &str) -> String {
    if address.starts_with(':') {
        format!("0.0.0.0{}", address)
    } else {
        address.to_string()
    }
}

impl BridgeConfig {
    pub fn current() -> Arc<BridgeConfig> {
        BRIDGE_CONFIG_CACHE.read().unwrap().clone()
    }

    pub fn make_current(self) {
        *BRIDGE_CONFIG_CACHE.write().unwrap() = Arc::new(self)
    }
}

lazy_static! {
    static ref BRIDGE_CONFIG_CACHE: RwLock<Arc<BridgeConfig>> = RwLock::new(Default::default());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::from_str("").unwrap();
        assert_eq!(config.proxy.address, ":4040");
        assert_eq!(config.master.address, ":4041");
        assert_eq!(config.proxy.backend_addresses, vec!["127.0.0.1:3306"]);
        assert!(config.proxy.pool_change_user);
        assert!(!config.proxy.fix_bug_25371);
        assert_eq!(config.master.username, "root");
        assert_eq!(config.system.workers, 1);
    }

    #[test]
    fn test_from_str() {
        let config = BridgeConfig::from_str(
            r#"
            [proxy]
            address = ":14040"
            backend_addresses = ["10.0.0.1:3306", "10.0.0.2:3306"]
            read_only_backend_addresses = ["10.0.0.3:3306"]
            fix_bug_25371 = true
            pool_change_user = false

            [master]
            username = "repl"
            password = "repl-secret"

            [system]
            workers = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.proxy.address, ":14040");
        assert_eq!(config.proxy.backend_addresses.len(), 2);
        assert_eq!(config.proxy.read_only_backend_addresses.len(), 1);
        assert!(config.proxy.fix_bug_25371);
        assert!(!config.proxy.pool_change_user);
        assert_eq!(config.master.username, "repl");
        assert_eq!(config.system.workers, 4);
    }

    #[test]
    fn test_listen_address() {
        assert_eq!(listen_address(":4040"), "0.0.0.0:4040");
        assert_eq!(listen_address("127.0.0.1:4040"), "127.0.0.1:4040");
    }
}
