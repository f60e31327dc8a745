//! Application configuration: a dotted-key tree loaded from TOML, with
//! typed accessors that write back a default the first time a key is read.
//!
//! Grounded in `original_source/src/config.{h,cpp}` and `configuration.cpp`'s
//! `set_defaults`. The original's `boost::property_tree` (INI) is replaced
//! with `toml` + `serde`, the pack's own nested-config idiom.

use std::path::{Path, PathBuf};

use log::{info, warn};
use toml::value::Table;
use toml::Value;

use crate::error::{Error, Result};

/// A nested key/value configuration tree, addressed by dotted paths
/// (`"device0.connection_string"`).
#[derive(Debug, Clone, Default)]
pub struct ConfigTree {
    root: Table,
}

impl ConfigTree {
    pub fn new() -> Self {
        ConfigTree { root: Table::new() }
    }

    /// Parse `text` as TOML, replacing the current tree.
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = toml::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        match value {
            Value::Table(root) => Ok(ConfigTree { root }),
            _ => Err(Error::Config("configuration root must be a table".into())),
        }
    }

    pub fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("configuration file {} doesn't exist", path.display());
            return Ok(ConfigTree::new());
        }
        info!("using configuration file: {}", path.display());
        let text = std::fs::read_to_string(path).map_err(|e| Error::Config(e.to_string()))?;
        Self::parse(&text)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        info!("writing configuration to: {}", path.display());
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| Error::Config(e.to_string()))?;
        }
        let text = toml::to_string_pretty(&Value::Table(self.root.clone()))
            .map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(path, text).map_err(|e| Error::Config(e.to_string()))
    }

    fn get(&self, key: &str) -> Option<&Value> {
        let mut node = &self.root;
        let mut parts = key.split('.').peekable();
        while let Some(part) = parts.next() {
            if parts.peek().is_none() {
                return node.get(part);
            }
            node = node.get(part)?.as_table()?;
        }
        None
    }

    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        let value = value.into();
        let parts: Vec<&str> = key.split('.').collect();
        let mut node = &mut self.root;
        for part in &parts[..parts.len() - 1] {
            node = node
                .entry(part.to_string())
                .or_insert_with(|| Value::Table(Table::new()))
                .as_table_mut()
                .expect("config path component is not a table");
        }
        node.insert(parts[parts.len() - 1].to_string(), value);
    }

    /// The nested table at `key` as its own tree, or an empty tree if `key`
    /// is absent or not itself a table. Used to hand a device's
    /// `device{i}.options` block to [`crate::device::Device::set_options`]
    /// without threading the whole configuration through it.
    pub fn table(&self, key: &str) -> ConfigTree {
        match self.get(key).and_then(|v| v.as_table()) {
            Some(t) => ConfigTree { root: t.clone() },
            None => ConfigTree::new(),
        }
    }

    fn or_default(&mut self, key: &str, default: Value) -> Value {
        match self.get(key) {
            Some(v) => v.clone(),
            None => {
                self.set(key, default.clone());
                default
            }
        }
    }

    pub fn bool_or(&mut self, key: &str, default: bool) -> bool {
        self.or_default(key, Value::Boolean(default)).as_bool().unwrap_or(default)
    }

    pub fn string_or(&mut self, key: &str, default: &str) -> String {
        self.or_default(key, Value::String(default.to_string()))
            .as_str()
            .map(str::to_string)
            .unwrap_or_else(|| default.to_string())
    }

    pub fn int_or(&mut self, key: &str, default: i64) -> i64 {
        self.or_default(key, Value::Integer(default)).as_integer().unwrap_or(default)
    }

    pub fn float_or(&mut self, key: &str, default: f64) -> f64 {
        self.or_default(key, Value::Float(default)).as_float().unwrap_or(default)
    }

    /// Apply the baseline defaults the daemon ships with: one HTTP view
    /// listener, one Modbus/TCP listener, and no enabled devices or
    /// processors, matching `configuration.cpp`'s `set_defaults` in shape
    /// (the original's bundled XSens/u-blox/processor sample configuration
    /// is left out here; the equivalent ships as a commented example
    /// configuration file rather than live in-process defaults).
    pub fn set_defaults(&mut self) {
        self.string_or("logging.level", "info");
        self.string_or("logging.device_log_dir", "");

        self.bool_or("http.enabled", true);
        self.string_or("http.address", "localhost");
        self.int_or("http.port", 16080);

        self.bool_or("modbus.enabled", true);
        self.int_or("modbus.port", 16502);

        self.int_or("devices.count", 0);
        self.int_or("processors.count", 0);
    }
}

/// Default configuration directory: `/etc/sensor_hub` if it exists or can
/// be created, falling back to `$HOME/.config/sensor_hub`.
pub fn default_config_dir() -> PathBuf {
    let system_dir = PathBuf::from("/etc/sensor_hub");
    if system_dir.exists() || std::fs::create_dir_all(&system_dir).is_ok() {
        return system_dir;
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config/sensor_hub")
}

pub fn default_config_file() -> PathBuf {
    default_config_dir().join("sensor_hub.conf")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_nested_keys() {
        let mut cfg = ConfigTree::new();
        cfg.set("device0.name", "MTi-G-710");
        cfg.set("device0.enabled", true);
        assert_eq!(cfg.get("device0.name").and_then(|v| v.as_str()), Some("MTi-G-710"));
        assert_eq!(cfg.bool_or("device0.enabled", false), true);
    }

    #[test]
    fn or_default_writes_back_missing_keys() {
        let mut cfg = ConfigTree::new();
        assert_eq!(cfg.int_or("modbus.port", 16502), 16502);
        assert_eq!(cfg.get("modbus.port").and_then(|v| v.as_integer()), Some(16502));
    }

    #[test]
    fn parse_reads_toml_text() {
        let cfg = ConfigTree::parse(
            r#"
            [http]
            enabled = true
            port = 16080

            [device0]
            type = "xsens_mti_g_710_usb"
            name = "MTi-G-710"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.get("http.port").and_then(|v| v.as_integer()), Some(16080));
        assert_eq!(cfg.get("device0.type").and_then(|v| v.as_str()), Some("xsens_mti_g_710_usb"));
    }

    #[test]
    fn set_defaults_is_idempotent() {
        let mut cfg = ConfigTree::new();
        cfg.set_defaults();
        let first = cfg.int_or("http.port", 0);
        cfg.set_defaults();
        assert_eq!(cfg.int_or("http.port", 0), first);
    }
}
