use std::{
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use ibex_core::{HostIdent, IdentError};
use ibex_observe::{LoggerConfig, LoggerError, LoggerFormat, LoggerLevel};
use ibex_rpc::ClientOptions;
use serde::Deserialize;
use thiserror::Error;

/// Prefix of environment variables that override file settings.
pub const ENV_PREFIX: &str = "AGENTD_";

const WRITE_PROBE: &str = ".agentd-write-probe";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("parse config {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },
    #[error("unsupported config format: {} (expected .toml, .conf, .yaml, .yml or .json)", .0.display())]
    UnsupportedFormat(PathBuf),
    #[error("invalid value {value:?} for {key}: {reason}")]
    Env { key: String, value: String, reason: String },
    #[error("heartbeat.servers is empty")]
    NoServers,
    #[error("heartbeat.interval must be greater than zero")]
    ZeroInterval,
    #[error("heartbeat.host is empty")]
    EmptyHost,
    #[error("heartbeat.host {host:?} does not resolve: {source}")]
    Ident {
        host: String,
        #[source]
        source: IdentError,
    },
    #[error("meta_dir {} is not usable: {source}", path.display())]
    MetaDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("http.listen {0:?} is not a socket address")]
    Listen(String),
    #[error(transparent)]
    Logger(#[from] LoggerError),
}

/// Agent configuration: file contents, then `AGENTD_*` overrides, then [`AgentConfig::validate`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub run_mode: String,
    pub meta_dir: PathBuf,
    pub log: LogConfig,
    pub heartbeat: HeartbeatConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LoggerFormat,
    /// `EnvFilter` directive; falls back to the run mode when unset.
    pub level: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Milliseconds between two reports.
    pub interval: u64,
    pub servers: Vec<String>,
    /// Literal ident, `$ip` or `$hostname`.
    pub host: String,
    pub dial_timeout: u64,
    pub call_timeout: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub enable: bool,
    pub listen: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            run_mode: "release".to_string(),
            meta_dir: PathBuf::from("./meta"),
            log: LogConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            http: HttpConfig::default(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: 1000,
            servers: Vec::new(),
            host: "$ip".to_string(),
            dial_timeout: 5000,
            call_timeout: 5000,
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enable: true,
            listen: "127.0.0.1:2090".to_string(),
        }
    }
}

impl AgentConfig {
    /// Read `path`, then apply overrides from the process environment.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut cfg = Self::parse(path, &raw)?;
        cfg.apply_env(std::env::vars())?;
        Ok(cfg)
    }

    /// Parse `raw` in the format implied by the extension of `path`.
    pub fn parse(path: &Path, raw: &str) -> Result<Self, ConfigError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        let parsed = match ext.as_str() {
            "toml" | "conf" => toml::from_str(raw).map_err(|e| e.to_string()),
            "yaml" | "yml" => serde_yaml::from_str(raw).map_err(|e| e.to_string()),
            "json" => serde_json::from_str(raw).map_err(|e| e.to_string()),
            _ => return Err(ConfigError::UnsupportedFormat(path.to_path_buf())),
        };
        parsed.map_err(|reason| ConfigError::Parse {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Apply `AGENTD_*` variables; unrelated variables are ignored.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            match name {
                "RUN_MODE" => self.run_mode = value,
                "META_DIR" => self.meta_dir = PathBuf::from(value),
                "LOG_FORMAT" => self.log.format = value.parse().map_err(|e: LoggerError| env_err(&key, &value, e))?,
                "LOG_LEVEL" => self.log.level = Some(value),
                "HEARTBEAT_INTERVAL" => self.heartbeat.interval = parse_ms(&key, &value)?,
                "HEARTBEAT_SERVERS" => {
                    self.heartbeat.servers = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect();
                }
                "HEARTBEAT_HOST" => self.heartbeat.host = value,
                "HEARTBEAT_DIAL_TIMEOUT" => self.heartbeat.dial_timeout = parse_ms(&key, &value)?,
                "HEARTBEAT_CALL_TIMEOUT" => self.heartbeat.call_timeout = parse_ms(&key, &value)?,
                "HTTP_ENABLE" => {
                    self.http.enable = value.trim().parse().map_err(|e| env_err(&key, &value, e))?;
                }
                "HTTP_LISTEN" => self.http.listen = value,
                _ => {}
            }
        }
        Ok(())
    }

    /// Reject settings the agent cannot run with.
    ///
    /// Resolves the ident once, creates `meta_dir`, checks that it is writable and makes it absolute.
    pub async fn validate(&mut self) -> Result<(), ConfigError> {
        if self.heartbeat.servers.is_empty() {
            return Err(ConfigError::NoServers);
        }
        if self.heartbeat.interval == 0 {
            return Err(ConfigError::ZeroInterval);
        }
        if self.heartbeat.host.trim().is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        if let Err(source) = self.host_ident().resolve().await {
            return Err(ConfigError::Ident {
                host: self.heartbeat.host.clone(),
                source,
            });
        }
        if self.http.enable {
            self.http_listen()?;
        }

        self.meta_dir = usable_dir(&self.meta_dir).await?;
        Ok(())
    }

    pub fn logger_config(&self) -> Result<LoggerConfig, ConfigError> {
        let level = match &self.log.level {
            Some(level) => LoggerLevel::new(level.as_str())?,
            None if self.run_mode == "debug" => LoggerLevel::new("debug")?,
            None => LoggerLevel::default(),
        };
        Ok(LoggerConfig {
            format: self.log.format,
            level,
            ..LoggerConfig::default()
        })
    }

    pub fn host_ident(&self) -> HostIdent {
        HostIdent::parse(&self.heartbeat.host)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat.interval)
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            dial_timeout: Duration::from_millis(self.heartbeat.dial_timeout),
            call_timeout: Duration::from_millis(self.heartbeat.call_timeout),
        }
    }

    pub fn http_listen(&self) -> Result<SocketAddr, ConfigError> {
        self.http
            .listen
            .parse()
            .map_err(|_| ConfigError::Listen(self.http.listen.clone()))
    }
}

fn parse_ms(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.trim().parse().map_err(|e| env_err(key, value, e))
}

fn env_err(key: &str, value: &str, reason: impl ToString) -> ConfigError {
    ConfigError::Env {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

async fn usable_dir(dir: &Path) -> Result<PathBuf, ConfigError> {
    let fail = |source| ConfigError::MetaDir {
        path: dir.to_path_buf(),
        source,
    };

    let abs = if dir.is_absolute() {
        dir.to_path_buf()
    } else {
        std::env::current_dir().map_err(fail)?.join(dir)
    };

    tokio::fs::create_dir_all(&abs).await.map_err(fail)?;
    let probe = abs.join(WRITE_PROBE);
    tokio::fs::write(&probe, b"").await.map_err(fail)?;
    tokio::fs::remove_file(&probe).await.map_err(fail)?;
    Ok(abs)
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;

    const TOML: &str = r#"
run_mode = "debug"
meta_dir = "/var/lib/ibex/meta"

[heartbeat]
interval = 200
servers = ["10.0.0.1:20090", "10.0.0.2:20090"]
host = "$hostname"

[http]
enable = false
"#;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn toml_with_defaults() {
        let cfg = AgentConfig::parse(Path::new("agentd.toml"), TOML).unwrap();
        assert_eq!(cfg.run_mode, "debug");
        assert_eq!(cfg.heartbeat.servers.len(), 2);
        assert_eq!(cfg.interval(), Duration::from_millis(200));
        assert_eq!(cfg.host_ident(), HostIdent::Hostname);
        assert_eq!(cfg.client_options().dial_timeout, Duration::from_secs(5));
        assert!(!cfg.http.enable);
        assert_eq!(cfg.http.listen, "127.0.0.1:2090");
        assert_eq!(cfg.logger_config().unwrap().level.as_str(), "debug");
    }

    #[test]
    fn conf_is_toml_and_yaml_json_are_accepted() {
        assert!(AgentConfig::parse(Path::new("agentd.conf"), TOML).is_ok());

        let yaml = "heartbeat:\n  servers: [\"a:1\"]\n  interval: 50\n";
        let cfg = AgentConfig::parse(Path::new("agentd.yml"), yaml).unwrap();
        assert_eq!(cfg.heartbeat.interval, 50);
        assert_eq!(cfg.meta_dir, PathBuf::from("./meta"));

        let json = r#"{"heartbeat":{"servers":["b:2"]},"log":{"format":"json"}}"#;
        let cfg = AgentConfig::parse(Path::new("agentd.json"), json).unwrap();
        assert_eq!(cfg.heartbeat.servers, vec!["b:2"]);
        assert_eq!(cfg.log.format, LoggerFormat::Json);
        assert_eq!(cfg.logger_config().unwrap().level.as_str(), "info");
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let err = AgentConfig::parse(Path::new("agentd.ini"), "").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat(_)));
    }

    #[test]
    fn env_overrides_file() {
        let mut cfg = AgentConfig::parse(Path::new("agentd.toml"), TOML).unwrap();
        cfg.apply_env(vars(&[
            ("AGENTD_HEARTBEAT_SERVERS", "s1:1, s2:2,"),
            ("AGENTD_HEARTBEAT_INTERVAL", "750"),
            ("AGENTD_HTTP_ENABLE", "true"),
            ("AGENTD_LOG_LEVEL", "warn"),
            ("AGENTD_UNKNOWN", "x"),
            ("PATH", "/usr/bin"),
        ]))
        .unwrap();

        assert_eq!(cfg.heartbeat.servers, vec!["s1:1", "s2:2"]);
        assert_eq!(cfg.heartbeat.interval, 750);
        assert!(cfg.http.enable);
        assert_eq!(cfg.logger_config().unwrap().level.as_str(), "warn");
    }

    #[test]
    fn bad_env_value_is_reported() {
        let mut cfg = AgentConfig::default();
        let err = cfg
            .apply_env(vars(&[("AGENTD_HEARTBEAT_INTERVAL", "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { key, .. } if key == "AGENTD_HEARTBEAT_INTERVAL"));
    }

    #[tokio::test]
    async fn validation_failures() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = AgentConfig {
            meta_dir: tmp.path().join("meta"),
            ..AgentConfig::default()
        };
        cfg.heartbeat.host = "node-1".into();
        assert!(matches!(cfg.validate().await, Err(ConfigError::NoServers)));

        cfg.heartbeat.servers = vec!["127.0.0.1:1".into()];
        cfg.heartbeat.interval = 0;
        assert!(matches!(cfg.validate().await, Err(ConfigError::ZeroInterval)));

        cfg.heartbeat.interval = 100;
        cfg.heartbeat.host = "  ".into();
        assert!(matches!(cfg.validate().await, Err(ConfigError::EmptyHost)));

        cfg.heartbeat.host = "node-1".into();
        cfg.http.listen = "not an address".into();
        assert!(matches!(cfg.validate().await, Err(ConfigError::Listen(_))));
    }

    #[tokio::test]
    async fn meta_dir_is_created_and_absolute() {
        let tmp = TempDir::new().unwrap();
        let mut cfg = AgentConfig {
            meta_dir: tmp.path().join("a").join("b"),
            ..AgentConfig::default()
        };
        cfg.heartbeat.servers = vec!["127.0.0.1:1".into()];
        cfg.heartbeat.host = "node-1".into();

        cfg.validate().await.unwrap();
        assert!(cfg.meta_dir.is_absolute());
        assert!(cfg.meta_dir.is_dir());
        assert!(!cfg.meta_dir.join(WRITE_PROBE).exists());
    }

    #[tokio::test]
    async fn meta_dir_under_a_file_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("plain");
        std::fs::write(&file, b"").unwrap();

        let mut cfg = AgentConfig {
            meta_dir: file.join("meta"),
            ..AgentConfig::default()
        };
        cfg.heartbeat.servers = vec!["127.0.0.1:1".into()];
        cfg.heartbeat.host = "node-1".into();
        assert!(matches!(cfg.validate().await, Err(ConfigError::MetaDir { .. })));
    }
}
