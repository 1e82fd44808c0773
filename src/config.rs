//! Configuration file handling.
//!
//! Config files are YAML documents. Any value can be overridden from the
//! environment: the key `url` of the `server` section is looked up as
//! `DAKARA_SERVER_URL` before the file is consulted.
//!
//! ```no_run
//! use dakara_base::config::{get_config_file, load_config};
//!
//! let path = get_config_file("player.yaml")?;
//! let config = load_config(&path, false, &["server"])?;
//! let server = config.section("server");
//! let url = server.get_str("url");
//! # Ok::<(), dakara_base::DakaraError>(())
//! ```

use dialoguer::Confirm;
use log::{debug, info};
use serde_json::{Map, Value};
use std::env;
use std::fmt::Display;
use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::{DakaraError, Result};
use crate::utils::strtobool;

pub const ENV_PREFIX: &str = "DAKARA";
pub const DEFAULT_LOG_LEVEL: &str = "INFO";

#[cfg(windows)]
const CONFIG_DIRECTORY: &str = "Dakara";
#[cfg(not(windows))]
const CONFIG_DIRECTORY: &str = "dakara";

/// A config mapping whose values can be overridden by environment variables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Config {
    prefix: String,
    values: Map<String, Value>,
}

impl Config {
    pub fn new(prefix: impl Into<String>, values: Map<String, Value>) -> Self {
        Self {
            prefix: prefix.into(),
            values,
        }
    }

    /// Builds a config from a parsed document, which must be a mapping or empty.
    pub fn from_value(prefix: impl Into<String>, value: Value) -> Result<Self> {
        match value {
            Value::Object(values) => Ok(Self::new(prefix, values)),
            Value::Null => Ok(Self::new(prefix, Map::new())),
            other => Err(DakaraError::ConfigParseError(format!(
                "Config root must be a mapping, got {}",
                other
            ))),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn env_key(&self, key: &str) -> String {
        format!("{}_{}", self.prefix, key).to_uppercase()
    }

    /// Value of `key`, from the environment first, then from the file.
    pub fn get(&self, key: &str) -> Option<Value> {
        if let Ok(value) = env::var(self.env_key(key)) {
            return Some(Value::String(value));
        }
        self.values.get(key).cloned()
    }

    /// Whether the file itself defines `key`.
    pub fn contains_key(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    /// Nested mapping under `key`, with an accumulated environment prefix.
    pub fn section(&self, key: &str) -> Config {
        let values = match self.values.get(key) {
            Some(Value::Object(values)) => values.clone(),
            _ => Map::new(),
        };
        Config::new(format!("{}_{}", self.prefix, key), values)
    }

    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            Value::String(value) => Some(value),
            Value::Number(value) => Some(value.to_string()),
            Value::Bool(value) => Some(value.to_string()),
            _ => None,
        }
    }

    pub fn get_parsed<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        match self.get_str(key) {
            None => Ok(None),
            Some(raw) => raw.trim().parse().map(Some).map_err(|e| {
                DakaraError::ConfigInvalid(format!("Invalid value '{}' for '{}': {}", raw, key, e))
            }),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>> {
        match self.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(value)) => Ok(Some(value)),
            Some(Value::String(raw)) => strtobool(&raw).map(Some).ok_or_else(|| {
                DakaraError::ConfigInvalid(format!("Invalid boolean '{}' for '{}'", raw, key))
            }),
            Some(other) => Err(DakaraError::ConfigInvalid(format!(
                "Invalid boolean '{}' for '{}'",
                other, key
            ))),
        }
    }

    /// Reads a number of seconds, fractions allowed.
    pub fn get_duration_secs(&self, key: &str, default: Duration) -> Result<Duration> {
        let seconds = match self.get(key) {
            None | Some(Value::Null) => return Ok(default),
            Some(Value::Number(value)) => value.as_f64(),
            Some(Value::String(raw)) => raw.trim().parse::<f64>().ok(),
            Some(_) => None,
        };
        match seconds {
            Some(seconds) if seconds.is_finite() && seconds >= 0.0 => {
                Ok(Duration::from_secs_f64(seconds))
            }
            _ => Err(DakaraError::ConfigInvalid(format!(
                "Invalid duration for '{}', expected a number of seconds",
                key
            ))),
        }
    }
}

/// Loads a YAML config file.
///
/// Every key listed in `mandatory_keys` must be present at the root of the
/// file. `debug` forces the `loglevel` key to `DEBUG`.
pub fn load_config(path: &Path, debug: bool, mandatory_keys: &[&str]) -> Result<Config> {
    info!("Loading config file '{}'", path.display());

    let content = fs::read_to_string(path).map_err(|e| match e.kind() {
        IoErrorKind::NotFound => {
            DakaraError::ConfigNotFound(format!("No config file found at '{}'", path.display()))
        }
        _ => DakaraError::IoError(e),
    })?;

    let document: Value = serde_yaml_ng::from_str(&content)
        .map_err(|e| DakaraError::ConfigParseError(format!("Unable to parse config file: {}", e)))?;
    let mut config = Config::from_value(ENV_PREFIX, document)?;

    for key in mandatory_keys {
        if !config.contains_key(key) {
            return Err(DakaraError::ConfigInvalid(format!(
                "Invalid config file, missing '{}'",
                key
            )));
        }
    }

    if debug {
        config.set("loglevel", "DEBUG");
    }

    Ok(config)
}

/// Dakara config directory of the current user. Not created.
pub fn get_config_directory() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|directory| directory.join(CONFIG_DIRECTORY))
        .ok_or_else(|| {
            DakaraError::ConfigurationError(
                "This operating system is not currently supported".to_string(),
            )
        })
}

/// Path of a config file in the config directory; it may not exist.
pub fn get_config_file(filename: &str) -> Result<PathBuf> {
    Ok(get_config_directory()?.join(filename))
}

/// Writes a bundled config template into the user config directory.
///
/// An existing file is only overwritten with `force` or after the user
/// agrees at the prompt. Returns whether the file was written.
pub fn create_config_file(content: &str, filename: &str, force: bool) -> Result<bool> {
    let destination = get_config_file(filename)?;
    create_config_file_at(content, &destination, force, |path| {
        Confirm::new()
            .with_prompt(format!("{} already exists, overwrite?", path.display()))
            .default(false)
            .interact()
            .unwrap_or(false)
    })
}

/// Same as [`create_config_file`] with an explicit destination and prompt.
pub fn create_config_file_at(
    content: &str,
    destination: &Path,
    force: bool,
    confirm_overwrite: impl FnOnce(&Path) -> bool,
) -> Result<bool> {
    if let Some(directory) = destination.parent() {
        fs::create_dir_all(directory)?;
    }

    if !force && destination.exists() && !confirm_overwrite(destination) {
        debug!("Keeping existing config '{}'", destination.display());
        return Ok(false);
    }

    fs::write(destination, content)?;
    info!("Config created in '{}'", destination.display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn config(value: Value) -> Config {
        Config::from_value("TESTCFG", value).unwrap()
    }

    fn yaml_file(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_environment_overrides_file() {
        let config = config(json!({"key": "foo", "override_me": "bar"}));
        env::set_var("TESTCFG_OVERRIDE_ME", "spam");

        assert_eq!(config.get_str("key").as_deref(), Some("foo"));
        assert_eq!(config.get_str("override_me").as_deref(), Some("spam"));
        assert_eq!(config.get_str("missing"), None);

        env::remove_var("TESTCFG_OVERRIDE_ME");
    }

    #[test]
    fn test_section_accumulates_prefix() {
        let config = config(json!({"sub": {"key": "foo", "port": 8000}}));
        let section = config.section("sub");
        assert_eq!(section.prefix(), "TESTCFG_sub");
        assert_eq!(section.env_key("key"), "TESTCFG_SUB_KEY");

        env::set_var("TESTCFG_SUB_PORT", "9000");
        assert_eq!(section.get_parsed::<u16>("port").unwrap(), Some(9000));
        env::remove_var("TESTCFG_SUB_PORT");

        assert!(config.section("absent").get("key").is_none());
    }

    #[test]
    fn test_typed_accessors() {
        let config = config(json!({
            "count": 3,
            "bad_count": "three",
            "enabled": true,
            "enabled_text": "yes",
            "interval": 2.5,
            "negative": -1,
        }));

        assert_eq!(config.get_parsed::<u32>("count").unwrap(), Some(3));
        assert!(matches!(
            config.get_parsed::<u32>("bad_count"),
            Err(DakaraError::ConfigInvalid(_))
        ));
        assert_eq!(config.get_bool("enabled").unwrap(), Some(true));
        assert_eq!(config.get_bool("enabled_text").unwrap(), Some(true));
        assert_eq!(config.get_bool("missing").unwrap(), None);
        assert_eq!(
            config.get_duration_secs("interval", Duration::ZERO).unwrap(),
            Duration::from_millis(2500)
        );
        assert_eq!(
            config.get_duration_secs("missing", Duration::from_secs(5)).unwrap(),
            Duration::from_secs(5)
        );
        assert!(config.get_duration_secs("negative", Duration::ZERO).is_err());
    }

    #[test]
    fn test_load_config() {
        let file = yaml_file("server:\n  url: http://www.example.com\nloglevel: info\n");
        let config = load_config(file.path(), false, &["server"]).unwrap();

        assert_eq!(config.prefix(), ENV_PREFIX);
        assert_eq!(config.get_str("loglevel").as_deref(), Some("info"));
        assert_eq!(
            config.section("server").get_str("url").as_deref(),
            Some("http://www.example.com")
        );
    }

    #[test]
    fn test_load_config_debug_forces_loglevel() {
        let file = yaml_file("loglevel: info\n");
        let config = load_config(file.path(), true, &[]).unwrap();
        assert_eq!(config.get_str("loglevel").as_deref(), Some("DEBUG"));
    }

    #[test]
    fn test_load_config_errors() {
        let directory = TempDir::new().unwrap();
        assert!(matches!(
            load_config(&directory.path().join("absent.yaml"), false, &[]),
            Err(DakaraError::ConfigNotFound(_))
        ));

        let invalid = yaml_file("server: [unclosed\n");
        assert!(matches!(
            load_config(invalid.path(), false, &[]),
            Err(DakaraError::ConfigParseError(_))
        ));

        let incomplete = yaml_file("loglevel: info\n");
        assert!(matches!(
            load_config(incomplete.path(), false, &["server"]),
            Err(DakaraError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_config_file_in_dakara_directory() {
        let path = get_config_file("player.yaml").unwrap();
        assert!(path.ends_with(Path::new(CONFIG_DIRECTORY).join("player.yaml")));
    }

    #[test]
    fn test_create_config_file_prompts_before_overwrite() {
        let directory = TempDir::new().unwrap();
        let destination = directory.path().join("nested").join("config.yaml");

        assert!(create_config_file_at("first", &destination, false, |_| panic!("no prompt")).unwrap());
        assert_eq!(fs::read_to_string(&destination).unwrap(), "first");

        assert!(!create_config_file_at("second", &destination, false, |_| false).unwrap());
        assert_eq!(fs::read_to_string(&destination).unwrap(), "first");

        assert!(create_config_file_at("third", &destination, false, |_| true).unwrap());
        assert!(create_config_file_at("fourth", &destination, true, |_| false).unwrap());
        assert_eq!(fs::read_to_string(&destination).unwrap(), "fourth");
    }
}
