//! Configuration file for yls.
//!
//! Read from `$YLS_CONFIG` when set, otherwise `~/.yls/config.toml`. A missing file
//! is not an error; every table has defaults. String values may reference environment
//! variables as `${VAR}`.

use std::path::{Path, PathBuf};
use std::{env, fs};

use serde::Deserialize;
use yls_types::{
    DocumentSelector, LifecycleSettings, ProvisionSettings, ServerSettings, SupervisorSettings,
    TransportSettings,
};

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV: &str = "YLS_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config at {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config at {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl ConfigError {
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` wins when set.
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct YlsConfig {
    pub server: ServerSettings,
    pub transport: TransportSettings,
    pub provision: ProvisionSettings,
    pub lifecycle: LifecycleSettings,
    pub documents: DocumentSelector,
    pub logging: LoggingConfig,
}

pub fn expand_env_vars(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut i = 0;

    while i < value.len() {
        if value[i..].starts_with("${") {
            let start = i + 2;
            if let Some(end_rel) = value[start..].find('}') {
                let end = start + end_rel;
                let var = &value[start..end];
                if !var.is_empty() {
                    let replacement = env::var(var).unwrap_or_default();
                    out.push_str(&replacement);
                }
                i = end + 1;
                continue;
            }
        }

        let Some(ch) = value[i..].chars().next() else {
            break;
        };
        out.push(ch);
        i += ch.len_utf8();
    }

    out
}

fn expand_value(value: &mut toml::Value) {
    match value {
        toml::Value::String(s) => *s = expand_env_vars(s),
        toml::Value::Array(items) => items.iter_mut().for_each(expand_value),
        toml::Value::Table(table) => table.iter_mut().for_each(|(_, v)| expand_value(v)),
        _ => {}
    }
}

impl YlsConfig {
    /// Load the config file, `Ok(None)` when there is none.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        let Some(path) = config_path() else {
            return Ok(None);
        };
        if !path.exists() {
            return Ok(None);
        }
        Self::load_from(&path).map(Some)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| {
            tracing::warn!("Failed to read config at {:?}: {}", path, source);
            ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }
        })?;
        Self::parse(&content).map_err(|source| {
            tracing::warn!("Failed to parse config at {:?}: {}", path, source);
            ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            }
        })
    }

    /// Parse a config document, expanding `${VAR}` in every string value.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        let mut value = toml::Value::Table(toml::from_str::<toml::Table>(content)?);
        expand_value(&mut value);
        value.try_into()
    }

    #[must_use]
    pub fn path() -> Option<PathBuf> {
        config_path()
    }

    /// Supervisor settings, without the logging table.
    #[must_use]
    pub fn settings(&self) -> SupervisorSettings {
        SupervisorSettings {
            server: self.server.clone(),
            transport: self.transport.clone(),
            provision: self.provision.clone(),
            lifecycle: self.lifecycle.clone(),
            documents: self.documents.clone(),
        }
    }
}

pub fn config_path() -> Option<PathBuf> {
    if let Some(explicit) = env::var_os(CONFIG_ENV).filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(explicit));
    }
    dirs::home_dir().map(|home| home.join(".yls").join("config.toml"))
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Duration;

    use yls_types::TransportKind;

    use super::*;

    #[test]
    fn expand_env_vars_no_vars() {
        assert_eq!(expand_env_vars("hello world"), "hello world");
    }

    #[test]
    fn expand_env_vars_single_var() {
        unsafe {
            std::env::set_var("YLS_TEST_CONFIG_VAR", "replaced");
        }
        let result = expand_env_vars("prefix ${YLS_TEST_CONFIG_VAR} suffix");
        assert_eq!(result, "prefix replaced suffix");
        unsafe {
            std::env::remove_var("YLS_TEST_CONFIG_VAR");
        }
    }

    #[test]
    fn expand_env_vars_missing_var_becomes_empty() {
        unsafe {
            std::env::remove_var("YLS_MISSING_VAR_FOR_TEST");
        }
        let result = expand_env_vars("before ${YLS_MISSING_VAR_FOR_TEST} after");
        assert_eq!(result, "before  after");
    }

    #[test]
    fn expand_env_vars_unclosed_brace_preserved() {
        assert_eq!(expand_env_vars("test ${UNCLOSED"), "test ${UNCLOSED");
    }

    #[test]
    fn expand_env_vars_empty_name_dropped() {
        assert_eq!(expand_env_vars("règles ${} yara"), "règles  yara");
    }

    #[test]
    fn parse_empty_config() {
        let config = YlsConfig::parse("").unwrap();
        let settings = config.settings();
        assert_eq!(settings.transport.kind(), TransportKind::Socket);
        assert_eq!(settings.lifecycle.terminate_grace(), Duration::from_secs(2));
        assert!(config.logging.filter.is_none());
    }

    #[test]
    fn parse_full_config() {
        let config = YlsConfig::parse(
            r#"
            [server]
            root = "/opt/yara-ext"
            runtime = "/usr/bin/python3"

            [transport]
            kind = "ipc"
            host = "127.0.0.1"
            bind_timeout_ms = 8000

            [provision]
            auto_install = false
            required_package = "yarals"

            [lifecycle]
            terminate_grace_ms = 500

            [documents]
            language_id = "yara"

            [logging]
            filter = "yls_lsp=debug"
            "#,
        )
        .unwrap();
        let settings = config.settings();
        assert_eq!(settings.server.root, PathBuf::from("/opt/yara-ext"));
        assert_eq!(
            settings.server.runtime_override(),
            Some(PathBuf::from("/usr/bin/python3"))
        );
        assert_eq!(settings.transport.kind(), TransportKind::Ipc);
        assert_eq!(settings.transport.host(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(settings.transport.bind_timeout(), Duration::from_secs(8));
        assert!(!settings.provision.auto_install);
        assert_eq!(
            settings.lifecycle.terminate_grace(),
            Duration::from_millis(500)
        );
        assert_eq!(config.logging.filter.as_deref(), Some("yls_lsp=debug"));
    }

    #[test]
    fn string_values_are_expanded() {
        unsafe {
            std::env::set_var("YLS_TEST_EXT_ROOT", "/home/analyst/yara-ext");
        }
        let config = YlsConfig::parse(
            r#"
            [server]
            root = "${YLS_TEST_EXT_ROOT}"

            [logging]
            filter = "yls_lsp=${YLS_TEST_MISSING_LEVEL}debug"
            "#,
        )
        .unwrap();
        unsafe {
            std::env::remove_var("YLS_TEST_EXT_ROOT");
        }
        assert_eq!(
            config.server.root,
            PathBuf::from("/home/analyst/yara-ext")
        );
        assert_eq!(config.logging.filter.as_deref(), Some("yls_lsp=debug"));
    }

    #[test]
    fn invalid_transport_is_a_parse_error() {
        assert!(YlsConfig::parse("[transport]\nhost = \"192.168.1.4\"").is_err());
        assert!(YlsConfig::parse("[transport]\nkind = \"carrier-pigeon\"").is_err());
    }

    #[test]
    fn load_from_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let err = YlsConfig::load_from(&missing).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
        assert_eq!(err.path(), &missing);

        let broken = dir.path().join("broken.toml");
        std::fs::write(&broken, "invalid toml [").unwrap();
        let err = YlsConfig::load_from(&broken).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert_eq!(err.path(), &broken);
    }

    #[test]
    fn load_from_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[transport]\nport = 5007\n").unwrap();
        let config = YlsConfig::load_from(&path).unwrap();
        assert_eq!(config.transport.port(), Some(5007));
    }
}
