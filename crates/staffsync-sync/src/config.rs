//! Environment-driven configuration for a sync run.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use reqwest::Url;
use staffsync_canvas::{CourseQuery, DEFAULT_EMAIL_CONCURRENCY};
use thiserror::Error;

pub const DEFAULT_ENV_FILE: &str = ".env.local";
pub const DEFAULT_DATA_DIR: &str = "src/data";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 20;

const SERVER_VARS: &[&str] = &["CANVAS_SERVER", "VITE_CANVAS_API_BASE_URL"];
const TOKEN_VARS: &[&str] = &["CANVAS_TOKEN", "VITE_CANVAS_API_TOKEN"];
const COURSE_VARS: &[&str] = &["CANVAS_COURSE_ID", "VITE_CANVAS_COURSE_ID"];
const SKIP_EMAIL_VAR: &str = "SKIP_EMAIL_FETCH";
const DATA_DIR_VAR: &str = "STAFFSYNC_DATA_DIR";
const TIMEOUT_VAR: &str = "STAFFSYNC_HTTP_TIMEOUT_SECS";
const USER_AGENT_VAR: &str = "STAFFSYNC_USER_AGENT";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{what} not found; set {}", vars.join(" or "))]
    Missing {
        what: &'static str,
        vars: &'static [&'static str],
    },
    #[error("invalid canvas server {value:?}: {reason}")]
    InvalidServer { value: String, reason: String },
    #[error("canvas token contains characters that cannot be sent in an http header")]
    InvalidToken,
    #[error("invalid value {value:?} for {var}")]
    InvalidValue { var: &'static str, value: String },
    #[error("reading env file {}: {source}", path.display())]
    EnvFile {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Variable lookup: the process environment first, then an optional env file.
///
/// The process environment is never modified.
#[derive(Debug, Clone, Default)]
pub struct EnvSource {
    use_process_env: bool,
    file_vars: HashMap<String, String>,
}

impl EnvSource {
    pub fn process() -> Self {
        Self {
            use_process_env: true,
            file_vars: HashMap::new(),
        }
    }

    /// Process environment backed by `path`; a missing file is fine.
    pub fn with_env_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let file_vars = match std::fs::read_to_string(path) {
            Ok(text) => first_wins(parse_env_file(&text)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(source) => {
                return Err(ConfigError::EnvFile {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Ok(Self {
            use_process_env: true,
            file_vars,
        })
    }

    /// Fixed variables only, ignoring the process environment.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            use_process_env: false,
            file_vars: first_wins(pairs.into_iter().map(|(k, v)| (k.into(), v.into()))),
        }
    }

    /// Trimmed, non-empty value of `key`.
    pub fn get(&self, key: &str) -> Option<String> {
        let from_process = if self.use_process_env {
            std::env::var(key).ok()
        } else {
            None
        };
        from_process
            .filter(|v| !v.trim().is_empty())
            .or_else(|| self.file_vars.get(key).cloned())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn first_of(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| self.get(key))
    }

    pub fn flag(&self, key: &str) -> bool {
        self.get(key)
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
            .unwrap_or(false)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.get(DATA_DIR_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }
}

/// A key repeated later in the file does not replace its first value.
fn first_wins(pairs: impl IntoIterator<Item = (String, String)>) -> HashMap<String, String> {
    let mut vars = HashMap::new();
    for (key, value) in pairs {
        vars.entry(key).or_insert(value);
    }
    vars
}

/// `KEY=VALUE` lines; blank lines and `#` comments are skipped and one layer
/// of matching quotes is stripped from values.
pub fn parse_env_file(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let (key, value) = line.split_once('=')?;
            let key = key.trim().trim_start_matches("export ").trim();
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), unquote(value.trim()).to_string()))
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Accepts a bare host (`canvas.ucsc.edu`) or a full base URL.
pub fn normalize_server(raw: &str) -> Result<Url, ConfigError> {
    let trimmed = raw.trim();
    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };
    let url = Url::parse(&candidate).map_err(|err| ConfigError::InvalidServer {
        value: raw.to_string(),
        reason: err.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidServer {
            value: raw.to_string(),
            reason: format!("unsupported scheme {}", url.scheme()),
        });
    }
    if url.host_str().is_none() {
        return Err(ConfigError::InvalidServer {
            value: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(url)
}

#[derive(Clone)]
pub struct SyncConfig {
    pub server: Url,
    pub token: String,
    pub course: CourseQuery,
    pub skip_email: bool,
    pub data_dir: PathBuf,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub email_concurrency: usize,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("server", &self.server.as_str())
            .field("token", &"<redacted>")
            .field("course", &self.course)
            .field("skip_email", &self.skip_email)
            .field("data_dir", &self.data_dir)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .field("user_agent", &self.user_agent)
            .field("email_concurrency", &self.email_concurrency)
            .finish()
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(&EnvSource::process())
    }

    pub fn from_source(env: &EnvSource) -> Result<Self, ConfigError> {
        let server_raw = env.first_of(SERVER_VARS).ok_or(ConfigError::Missing {
            what: "canvas server",
            vars: SERVER_VARS,
        })?;
        let token = env.first_of(TOKEN_VARS).ok_or(ConfigError::Missing {
            what: "canvas token",
            vars: TOKEN_VARS,
        })?;
        let course_raw = env.first_of(COURSE_VARS).ok_or(ConfigError::Missing {
            what: "canvas course id",
            vars: COURSE_VARS,
        })?;

        if !token.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(ConfigError::InvalidToken);
        }
        let course = CourseQuery::parse(&course_raw).ok_or(ConfigError::Missing {
            what: "canvas course id",
            vars: COURSE_VARS,
        })?;

        let http_timeout_secs = match env.get(TIMEOUT_VAR) {
            Some(value) => match value.parse::<u64>() {
                Ok(secs) if secs > 0 => secs,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        var: TIMEOUT_VAR,
                        value,
                    })
                }
            },
            None => DEFAULT_HTTP_TIMEOUT_SECS,
        };

        Ok(Self {
            server: normalize_server(&server_raw)?,
            token,
            course,
            skip_email: env.flag(SKIP_EMAIL_VAR),
            data_dir: env.data_dir(),
            http_timeout_secs,
            user_agent: env
                .get(USER_AGENT_VAR)
                .unwrap_or_else(|| format!("staffsync/{}", env!("CARGO_PKG_VERSION"))),
            email_concurrency: DEFAULT_EMAIL_CONCURRENCY,
        })
    }
}
