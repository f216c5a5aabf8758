use serde::Deserialize;
use serde_json::Value;

// ------------------------------------------------------------
// Root configuration
// ------------------------------------------------------------
//
// This is the top-level configuration structure loaded from
// `config.json`. Keys match the table in SPEC_FULL.md §6.
//
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    /// Bind address / port for the downstream broadcast server.
    pub repeater_server: ServerConfig,

    /// One upstream WebSocket URL per entry.
    pub okx_connections: Vec<String>,

    /// Sent verbatim (serialized to compact text) after every upstream
    /// handshake.
    pub subscription_message: Value,

    /// Event-loop worker count. Defaults to 1.
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Enables diagnostic logging at all named sites.
    #[serde(default)]
    pub debug: bool,
}

// ------------------------------------------------------------
// Broadcast server bind address
// ------------------------------------------------------------
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

fn default_threads() -> usize {
    1
}

impl Config {
    /// Parses and validates configuration from an in-memory JSON document.
    ///
    /// Split out from `load_config` so tests can exercise validation
    /// without touching the filesystem.
    pub fn from_str(data: &str) -> anyhow::Result<Config> {
        let cfg: Config = serde_json::from_str(data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.okx_connections.is_empty() {
            anyhow::bail!("okx_connections must contain at least one upstream URL");
        }
        if self.threads == 0 {
            anyhow::bail!("threads must be a positive integer");
        }
        Ok(())
    }
}

// ------------------------------------------------------------
// Configuration loader
// ------------------------------------------------------------
//
// Reads configuration from a fixed relative path. The repeater binary
// takes no CLI arguments (spec §6); this is the only entry point.
//
pub fn load_config(path: &str) -> anyhow::Result<Config> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read config file '{}': {}", path, e))?;
    Config::from_str(&data)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> &'static str {
        r#"{
            "repeater_server": { "host": "0.0.0.0", "port": 9001 },
            "okx_connections": ["wss://ws.okx.com:8443/ws/v5/public"],
            "subscription_message": { "op": "subscribe", "args": [{"channel":"trades","instId":"BTC-USDT"}] },
            "threads": 4,
            "debug": true
        }"#
    }

    #[test]
    fn parses_full_config() {
        let cfg = Config::from_str(sample()).unwrap();
        assert_eq!(cfg.repeater_server.host, "0.0.0.0");
        assert_eq!(cfg.repeater_server.port, 9001);
        assert_eq!(cfg.okx_connections.len(), 1);
        assert_eq!(cfg.threads, 4);
        assert!(cfg.debug);
    }

    #[test]
    fn defaults_threads_and_debug() {
        let data = r#"{
            "repeater_server": { "host": "127.0.0.1", "port": 9001 },
            "okx_connections": ["wss://ws.okx.com:8443/ws/v5/public"],
            "subscription_message": {}
        }"#;
        let cfg = Config::from_str(data).unwrap();
        assert_eq!(cfg.threads, 1);
        assert!(!cfg.debug);
    }

    #[test]
    fn rejects_empty_connections() {
        let data = r#"{
            "repeater_server": { "host": "127.0.0.1", "port": 9001 },
            "okx_connections": [],
            "subscription_message": {}
        }"#;
        assert!(Config::from_str(data).is_err());
    }
}
