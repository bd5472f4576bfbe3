//! Server configuration: TOML schema, loading and validation

use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionOptions;
use crate::constants::{
    DEFAULT_HANDLER_POOL_SIZE, DEFAULT_HTTP_TIMEOUT_SECS, DEFAULT_LISTEN_ADDRESS, MAX_LINES_PER_EVENT,
    MAX_REDIRECT,
};
use crate::event::EventFormat;
use crate::http::{FetchError, HttpFetcher, HttpMethod};
use crate::session::SessionConfig;

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", .0.join(", "))]
    Validation(Vec<String>),
}

/// Outbound server settings, as read from the config file.
///
/// Every field has a default, so an empty file is a valid configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutboundConfig {
    /// Address FreeSWITCH `socket` applications connect to.
    pub listen: String,
    pub default_answer_url: Option<String>,
    /// Falls back to `default_answer_url`.
    pub default_hangup_url: Option<String>,
    pub default_http_method: HttpMethod,
    /// HTTP basic auth sent to the web application. Empty disables it.
    pub auth_id: String,
    pub auth_token: String,
    pub event_format: EventFormat,
    /// Concurrent event handlers per call, 0 for unbounded.
    pub handler_pool_size: usize,
    pub max_redirects: usize,
    pub max_lines_per_event: usize,
    pub http_timeout_secs: u64,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN_ADDRESS.to_string(),
            default_answer_url: None,
            default_hangup_url: None,
            default_http_method: HttpMethod::default(),
            auth_id: String::new(),
            auth_token: String::new(),
            event_format: EventFormat::default(),
            handler_pool_size: DEFAULT_HANDLER_POOL_SIZE,
            max_redirects: MAX_REDIRECT,
            max_lines_per_event: MAX_LINES_PER_EVENT,
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

impl OutboundConfig {
    /// Session settings derived from this configuration.
    pub fn session_config(&self) -> Arc<SessionConfig> {
        Arc::new(SessionConfig {
            default_answer_url: self
                .default_answer_url
                .clone(),
            default_hangup_url: self
                .default_hangup_url
                .clone(),
            default_method: self.default_http_method,
            max_redirects: self.max_redirects,
            connection: ConnectionOptions {
                event_format: self.event_format,
                max_lines_per_event: self.max_lines_per_event,
            },
            handler_pool_size: self.handler_pool_size,
        })
    }

    /// HTTP client for document fetches and hangup notifications.
    pub fn fetcher(&self) -> Result<HttpFetcher, FetchError> {
        Ok(HttpFetcher::new(Duration::from_secs(self.http_timeout_secs))?
            .with_basic_auth(&self.auth_id, &self.auth_token))
    }
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<OutboundConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: OutboundConfig = toml::from_str(&content)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Check value ranges and URLs. Reports every problem, not just the first.
pub fn validate_config(config: &OutboundConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    if config
        .listen
        .parse::<SocketAddr>()
        .is_err()
    {
        errors.push(format!("listen '{}' is not a socket address", config.listen));
    }
    for (name, value) in [
        ("default_answer_url", &config.default_answer_url),
        ("default_hangup_url", &config.default_hangup_url),
    ] {
        if let Some(url) = value {
            if let Err(e) = url::Url::parse(url) {
                errors.push(format!("{} '{}' is invalid: {}", name, url, e));
            }
        }
    }
    if config.max_redirects == 0 {
        errors.push("max_redirects must be greater than 0".to_string());
    }
    if config.max_lines_per_event == 0 {
        errors.push("max_lines_per_event must be greater than 0".to_string());
    }
    if config.http_timeout_secs == 0 {
        errors.push("http_timeout_secs must be greater than 0".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = OutboundConfig::default();
        assert_eq!(config.listen, "127.0.0.1:8084");
        assert_eq!(config.default_http_method, HttpMethod::Post);
        assert_eq!(config.event_format, EventFormat::Json);
        assert_eq!(config.max_redirects, 1000);
        assert_eq!(config.max_lines_per_event, 1000);
        assert_eq!(config.http_timeout_secs, 60);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
listen = "0.0.0.0:9000"
default_answer_url = "http://app.local/answer"
default_http_method = "GET"
event_format = "plain"
max_redirects = 5
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.listen, "0.0.0.0:9000");
        assert_eq!(config.default_http_method, HttpMethod::Get);
        assert_eq!(config.event_format, EventFormat::Plain);
        assert_eq!(config.max_redirects, 5);
        assert_eq!(config.handler_pool_size, 0);

        let session = config.session_config();
        assert_eq!(session.effective_hangup_url().as_deref(), Some("http://app.local/answer"));
        assert_eq!(session.connection.event_format, EventFormat::Plain);
    }

    #[test]
    fn test_validation_reports_every_error() {
        let config = OutboundConfig {
            listen: "nowhere".into(),
            default_answer_url: Some("not a url".into()),
            max_redirects: 0,
            ..Default::default()
        };
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3, "{:?}", errors);
    }

    #[test]
    fn test_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_redirects = \"many\"").unwrap();
        assert!(matches!(load_config(file.path()), Err(ConfigError::Parse(_))));
        assert!(matches!(
            load_config(Path::new("/nonexistent/restxml.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
