//! Server configuration from environment variables and an optional TOML file.
//!
//! Values come from `COMMUNE_*` environment variables, then from the file
//! named by `COMMUNE_CONFIG`, then from the defaults below. Invalid values
//! fall back to the next source without crashing; only an unreadable or
//! malformed config file is an error.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `COMMUNE_NAME` | module | Server name (history namespace) |
//! | `COMMUNE_IP` | 0.0.0.0 | Bind address |
//! | `COMMUNE_PORT` | 8888 | Bind port |
//! | `COMMUNE_PUBLIC` | false | Skip signature verification |
//! | `COMMUNE_MAX_STALENESS` | 60 | Freshness window (secs) |
//! | `COMMUNE_STREAMING` | true | Stream sequence results |
//! | `COMMUNE_CHUNK_SIZE` | 1000 | Stream chunk size (bytes) |
//! | `COMMUNE_SAVE_HISTORY` | true | Record call history |
//! | `COMMUNE_HISTORY_PATH` | history | History root directory |
//! | `COMMUNE_TIMEOUT` | 256 | Invocation timeout (secs) |
//! | `COMMUNE_MAX_BODY` | 16777216 | Max request body (bytes) |
//! | `COMMUNE_RATE_LIMIT` | 60 | Calls per window per caller |
//! | `COMMUNE_RATE_WINDOW` | 60 | Rate limit window (secs) |
//! | `COMMUNE_WHITELIST` | (empty) | Comma separated callable functions |
//! | `COMMUNE_BLACKLIST` | (empty) | Comma separated blocked functions |
//! | `COMMUNE_KEY_SEED` | (generated) | Hex ed25519 seed of the server key |
//! | `COMMUNE_SHUTDOWN_TIMEOUT` | 30 | Graceful shutdown timeout (secs) |
//! | `COMMUNE_LOG_FORMAT` | json | `json` or `pretty` |
//! | `RUST_LOG` | info | Log filter |

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::access::{AccessConfig, RateLimitConfig};
use crate::identity::Keypair;
use crate::pipeline::PipelineConfig;
use crate::serializer::MAX_ENCODED_SIZE;
use crate::telemetry::{LogConfig, LogFormat};

/// Env var naming the optional TOML config file.
pub const CONFIG_FILE_VAR: &str = "COMMUNE_CONFIG";

const MIN_BODY: usize = 1024; // floor: 1 KiB
const MAX_STALENESS_CAP: u64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Invalid config file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Optional values read from the TOML file. Same names as the env vars,
/// lowercased and without the prefix.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub name: Option<String>,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub public: Option<bool>,
    pub max_staleness: Option<u64>,
    pub streaming: Option<bool>,
    pub chunk_size: Option<usize>,
    pub save_history: Option<bool>,
    pub history_path: Option<PathBuf>,
    pub timeout: Option<u64>,
    pub max_body: Option<usize>,
    pub rate_limit: Option<u32>,
    pub rate_window: Option<u64>,
    pub whitelist: Option<Vec<String>>,
    pub blacklist: Option<Vec<String>>,
    pub key_seed: Option<String>,
    pub shutdown_timeout: Option<u64>,
    pub log_format: Option<String>,
    pub log_level: Option<String>,
}

impl FileConfig {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_toml(&text).map_err(|reason| ConfigError::Parse {
            path: path.to_path_buf(),
            reason,
        })
    }

    pub fn from_toml(text: &str) -> Result<Self, String> {
        toml::from_str(text).map_err(|e| e.to_string())
    }
}

/// Effective configuration summary (serializable).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectiveConfig {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub public: bool,
    pub max_staleness_secs: u64,
    pub streaming: bool,
    pub chunk_size: usize,
    pub save_history: bool,
    pub history_path: String,
    pub timeout_secs: u64,
    pub max_body: usize,
    pub rate_limit: u32,
    pub rate_window_secs: u64,
    pub whitelist: Vec<String>,
    pub blacklist: Vec<String>,
    pub key_seed_set: bool,
    pub shutdown_timeout_secs: u64,
    pub log_format: String,
    pub log_level: String,
}

impl EffectiveConfig {
    /// `VAR=value` lines, as printed by `config show`.
    pub fn to_env_lines(&self) -> Vec<String> {
        vec![
            format!("COMMUNE_NAME={}", self.name),
            format!("COMMUNE_IP={}", self.ip),
            format!("COMMUNE_PORT={}", self.port),
            format!("COMMUNE_PUBLIC={}", self.public),
            format!("COMMUNE_MAX_STALENESS={}", self.max_staleness_secs),
            format!("COMMUNE_STREAMING={}", self.streaming),
            format!("COMMUNE_CHUNK_SIZE={}", self.chunk_size),
            format!("COMMUNE_SAVE_HISTORY={}", self.save_history),
            format!("COMMUNE_HISTORY_PATH={}", self.history_path),
            format!("COMMUNE_TIMEOUT={}", self.timeout_secs),
            format!("COMMUNE_MAX_BODY={}", self.max_body),
            format!("COMMUNE_RATE_LIMIT={}", self.rate_limit),
            format!("COMMUNE_RATE_WINDOW={}", self.rate_window_secs),
            format!("COMMUNE_WHITELIST={}", self.whitelist.join(",")),
            format!("COMMUNE_BLACKLIST={}", self.blacklist.join(",")),
            format!(
                "COMMUNE_KEY_SEED={}",
                if self.key_seed_set { "<set>" } else { "" }
            ),
            format!("COMMUNE_SHUTDOWN_TIMEOUT={}", self.shutdown_timeout_secs),
            format!("COMMUNE_LOG_FORMAT={}", self.log_format),
            format!("RUST_LOG={}", self.log_level),
        ]
    }
}

/// All server configuration.
#[derive(Clone)]
pub struct EnvConfig {
    pub name: String,
    pub ip: String,
    pub port: u16,
    pub pipeline: PipelineConfig,
    pub history_path: PathBuf,
    pub max_body: usize,
    pub access: AccessConfig,
    pub key_seed: Option<String>,
    pub shutdown_timeout: Duration,
    pub log: LogConfig,
}

impl std::fmt::Debug for EnvConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvConfig")
            .field("name", &self.name)
            .field("ip", &self.ip)
            .field("port", &self.port)
            .field("pipeline", &self.pipeline)
            .field("history_path", &self.history_path)
            .field("max_body", &self.max_body)
            .field("access", &self.access)
            .field("key_seed", &self.key_seed.as_ref().map(|_| "<redacted>"))
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("log", &self.log)
            .finish()
    }
}

impl Default for EnvConfig {
    fn default() -> Self {
        build(&FileConfig::default(), |_| None)
    }
}

fn parse<T: FromStr>(raw: Option<String>) -> Option<T> {
    raw.and_then(|v| v.trim().parse::<T>().ok())
}

fn parse_bool(raw: Option<String>) -> Option<bool> {
    raw.and_then(|v| match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    })
}

fn parse_list(raw: Option<String>) -> Option<Vec<String>> {
    raw.map(|v| {
        v.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    })
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Layer env values (through `env`) over the file over the defaults.
fn build(file: &FileConfig, env: impl Fn(&str) -> Option<String>) -> EnvConfig {
    let name = non_empty(env("COMMUNE_NAME"))
        .or_else(|| file.name.clone())
        .unwrap_or_else(|| "module".to_string());
    let ip = non_empty(env("COMMUNE_IP"))
        .or_else(|| file.ip.clone())
        .unwrap_or_else(|| "0.0.0.0".to_string());
    let port = parse(env("COMMUNE_PORT")).or(file.port).unwrap_or(8888);

    let max_staleness = parse(env("COMMUNE_MAX_STALENESS"))
        .or(file.max_staleness)
        .unwrap_or(60)
        .clamp(1, MAX_STALENESS_CAP);
    let chunk_size = parse(env("COMMUNE_CHUNK_SIZE"))
        .or(file.chunk_size)
        .unwrap_or(1000)
        .max(1);
    let timeout = parse(env("COMMUNE_TIMEOUT"))
        .or(file.timeout)
        .unwrap_or(256)
        .max(1);
    let pipeline = PipelineConfig {
        public: parse_bool(env("COMMUNE_PUBLIC")).or(file.public).unwrap_or(false),
        max_staleness: Duration::from_secs(max_staleness),
        streaming: parse_bool(env("COMMUNE_STREAMING"))
            .or(file.streaming)
            .unwrap_or(true),
        chunk_size,
        save_history: parse_bool(env("COMMUNE_SAVE_HISTORY"))
            .or(file.save_history)
            .unwrap_or(true),
        timeout: Duration::from_secs(timeout),
    };

    let history_path = non_empty(env("COMMUNE_HISTORY_PATH"))
        .map(PathBuf::from)
        .or_else(|| file.history_path.clone())
        .unwrap_or_else(|| PathBuf::from("history"));
    let max_body = parse(env("COMMUNE_MAX_BODY"))
        .or(file.max_body)
        .unwrap_or(MAX_ENCODED_SIZE)
        .max(MIN_BODY);

    let rate_window = parse(env("COMMUNE_RATE_WINDOW"))
        .or(file.rate_window)
        .unwrap_or(60)
        .max(1);
    let access = AccessConfig {
        whitelist: parse_list(env("COMMUNE_WHITELIST"))
            .or_else(|| file.whitelist.clone())
            .unwrap_or_default(),
        blacklist: parse_list(env("COMMUNE_BLACKLIST"))
            .or_else(|| file.blacklist.clone())
            .unwrap_or_default(),
        rate_limit: RateLimitConfig {
            max_requests: parse(env("COMMUNE_RATE_LIMIT"))
                .or(file.rate_limit)
                .unwrap_or(60),
            window: Duration::from_secs(rate_window),
            ..Default::default()
        },
    };

    let shutdown_secs = parse(env("COMMUNE_SHUTDOWN_TIMEOUT"))
        .or(file.shutdown_timeout)
        .unwrap_or(30)
        .max(1);

    let log = LogConfig {
        format: non_empty(env("COMMUNE_LOG_FORMAT"))
            .or_else(|| file.log_format.clone())
            .and_then(|f| f.parse::<LogFormat>().ok())
            .unwrap_or_default(),
        level: non_empty(env("RUST_LOG"))
            .or_else(|| file.log_level.clone())
            .unwrap_or_else(|| "info".to_string()),
        output_path: None,
    };

    EnvConfig {
        name,
        ip,
        port,
        pipeline,
        history_path,
        max_body,
        access,
        key_seed: non_empty(env("COMMUNE_KEY_SEED")).or_else(|| file.key_seed.clone()),
        shutdown_timeout: Duration::from_secs(shutdown_secs),
        log,
    }
}

/// Load configuration from the environment and the optional config file.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> Result<EnvConfig, ConfigError> {
    let file = match non_empty(std::env::var(CONFIG_FILE_VAR).ok()) {
        Some(path) => FileConfig::from_path(Path::new(&path))?,
        None => FileConfig::default(),
    };
    Ok(load_with(&file))
}

/// Layer the environment over an already-read file config.
pub fn load_with(file: &FileConfig) -> EnvConfig {
    build(file, |key| std::env::var(key).ok())
}

impl EnvConfig {
    /// The server key: from the configured seed, or freshly generated.
    pub fn keypair(&self) -> Result<Keypair, ConfigError> {
        match &self.key_seed {
            Some(seed) => Keypair::from_hex(seed)
                .map_err(|e| ConfigError::Invalid(format!("COMMUNE_KEY_SEED: {}", e))),
            None => Ok(Keypair::generate()),
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Problems worth reporting before starting. Empty when valid.
    pub fn validate(&self) -> Vec<String> {
        let mut problems = Vec::new();
        if let Err(e) = self.keypair() {
            problems.push(e.to_string());
        }
        if self.port == 0 {
            problems.push("COMMUNE_PORT is 0; the OS will pick a port".to_string());
        }
        if self.access.rate_limit.max_requests == 0 {
            problems.push("COMMUNE_RATE_LIMIT is 0; every non-admin call is denied".to_string());
        }
        if let Some(f) = self
            .access
            .whitelist
            .iter()
            .find(|f| self.access.blacklist.contains(*f))
        {
            problems.push(format!(
                "function '{}' is both whitelisted and blacklisted",
                f
            ));
        }
        if self.pipeline.public {
            problems.push("COMMUNE_PUBLIC is set; signatures are not checked".to_string());
        }
        problems
    }

    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            name: self.name.clone(),
            ip: self.ip.clone(),
            port: self.port,
            public: self.pipeline.public,
            max_staleness_secs: self.pipeline.max_staleness.as_secs(),
            streaming: self.pipeline.streaming,
            chunk_size: self.pipeline.chunk_size,
            save_history: self.pipeline.save_history,
            history_path: self.history_path.display().to_string(),
            timeout_secs: self.pipeline.timeout.as_secs(),
            max_body: self.max_body,
            rate_limit: self.access.rate_limit.max_requests,
            rate_window_secs: self.access.rate_limit.window.as_secs(),
            whitelist: self.access.whitelist.clone(),
            blacklist: self.access.blacklist.clone(),
            key_seed_set: self.key_seed.is_some(),
            shutdown_timeout_secs: self.shutdown_timeout.as_secs(),
            log_format: self.log.format.as_str().to_string(),
            log_level: self.log.level.clone(),
        }
    }
}
