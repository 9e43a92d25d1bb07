//! Process configuration read from environment variables.

use crate::error::ConfigError;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Queues consumed when `CONVERT_QUEUES` is not set.
pub const DEFAULT_QUEUES: &[&str] = &["main_preview", "documentgenerator_create"];

/// Default work-queue message TTL in milliseconds.
pub const DEFAULT_MESSAGE_TTL_MS: u64 = 60_480_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Local,
    Dev,
    Prod,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub env: Environment,
    pub broker: BrokerConfig,
    pub worker: WorkerConfig,
    pub convert: ConvertConfig,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub user: String,
    pub password: String,
    pub host: String,
    pub port: u16,
    pub message_ttl: Duration,
}

impl BrokerConfig {
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}",
            self.user, self.password, self.host, self.port
        )
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub queues: Vec<String>,
    pub replicas: usize,
    pub backoff: Duration,
    pub shutdown_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ConvertConfig {
    pub success_dir: PathBuf,
    pub download_dir: PathBuf,
    pub max_video_size: u64,
    pub max_document_size: u64,
    pub libreoffice_bin: String,
    pub imagemagick_bin: String,
    pub ffmpeg_bin: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(lookup);

        let env = match vars.get("CONVERT_ENV").as_deref() {
            None | Some("local") => Environment::Local,
            Some("dev") => Environment::Dev,
            Some("prod") => Environment::Prod,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "CONVERT_ENV",
                    value: other.to_string(),
                })
            }
        };

        let broker = BrokerConfig {
            user: vars.required("RABBITMQ_USER")?,
            password: vars.get("RABBITMQ_PASSWORD").unwrap_or_default(),
            host: vars.required("RABBITMQ_HOST")?,
            port: vars.parse_required("RABBITMQ_PORT")?,
            message_ttl: Duration::from_millis(
                vars.parse_or("RABBITMQ_MESSAGE_TTL_MS", DEFAULT_MESSAGE_TTL_MS)?,
            ),
        };

        let queues = match vars.get("CONVERT_QUEUES") {
            Some(list) => list
                .split(',')
                .map(str::trim)
                .filter(|q| !q.is_empty())
                .map(String::from)
                .collect(),
            None => DEFAULT_QUEUES.iter().map(|q| q.to_string()).collect(),
        };

        let worker = WorkerConfig {
            queues,
            replicas: vars.parse_or("CONVERT_WORKER_REPLICAS", 3)?,
            backoff: Duration::from_secs(vars.parse_or("CONVERT_WORKER_BACKOFF_SECS", 10)?),
            shutdown_timeout: Duration::from_secs(
                vars.parse_or("CONVERT_SHUTDOWN_TIMEOUT_SECS", 300)?,
            ),
        };

        let convert = ConvertConfig {
            success_dir: PathBuf::from(vars.required("CONVERT_SUCCESS_DIRECTORY")?),
            download_dir: PathBuf::from(vars.required("CONVERT_DOWNLOAD_DIRECTORY")?),
            max_video_size: vars.parse_required("CONVERT_MAX_VIDEO_SIZE")?,
            max_document_size: vars.parse_required("CONVERT_MAX_DOCUMENT_SIZE")?,
            libreoffice_bin: vars
                .get("CONVERT_LIBREOFFICE_BIN")
                .unwrap_or_else(|| "libreoffice".to_string()),
            imagemagick_bin: vars
                .get("CONVERT_IMAGEMAGICK_BIN")
                .unwrap_or_else(|| "convert".to_string()),
            ffmpeg_bin: vars
                .get("CONVERT_FFMPEG_BIN")
                .unwrap_or_else(|| "ffmpeg".to_string()),
        };

        Ok(Self {
            env,
            broker,
            worker,
            convert,
        })
    }
}

struct Vars<F>(F);

impl<F> Vars<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|v| !v.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    fn parse_required<T: FromStr>(&self, key: &'static str) -> Result<T, ConfigError> {
        let value = self.required(key)?;
        value
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid { key, value })
    }

    fn parse_or<T: FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            Some(_) => self.parse_required(key),
            None => Ok(default),
        }
    }
}
