//! HTTP collaborator: fetches call-flow documents and posts notifications

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// HTTP method used to reach the web application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpMethod::Get => write!(f, "GET"),
            HttpMethod::Post => write!(f, "POST"),
        }
    }
}

/// Error returned when parsing an unsupported HTTP method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseHttpMethodError(pub String);

impl fmt::Display for ParseHttpMethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unsupported HTTP method: {}", self.0)
    }
}

impl std::error::Error for ParseHttpMethodError {}

impl FromStr for HttpMethod {
    type Err = ParseHttpMethodError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s
            .trim()
            .to_ascii_uppercase()
            .as_str()
        {
            "GET" => Ok(HttpMethod::Get),
            "POST" => Ok(HttpMethod::Post),
            _ => Err(ParseHttpMethodError(s.to_string())),
        }
    }
}

/// Why a request produced no document.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("no URL to send to")]
    NoUrl,

    #[error("empty response from {0}")]
    Empty(String),
}

/// Sends session parameters to the web application and returns its answer.
#[async_trait]
pub trait CallFlowFetcher: Send + Sync {
    /// Request `url` with `params` and return the response text.
    async fn fetch(
        &self,
        url: &str,
        params: &BTreeMap<String, String>,
        method: HttpMethod,
    ) -> Result<String, FetchError>;
}

/// [`CallFlowFetcher`] over `reqwest`.
///
/// GET sends parameters as the query string, POST as a form body.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    auth: Option<(String, String)>,
}

impl HttpFetcher {
    /// Client with the given request timeout.
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()?;
        Ok(Self { client, auth: None })
    }

    /// Send HTTP basic auth with every request. Empty ids disable it.
    pub fn with_basic_auth(mut self, auth_id: &str, auth_token: &str) -> Self {
        self.auth = (!auth_id.is_empty()).then(|| (auth_id.to_string(), auth_token.to_string()));
        self
    }
}

#[async_trait]
impl CallFlowFetcher for HttpFetcher {
    async fn fetch(
        &self,
        url: &str,
        params: &BTreeMap<String, String>,
        method: HttpMethod,
    ) -> Result<String, FetchError> {
        if url.is_empty() {
            return Err(FetchError::NoUrl);
        }

        let mut request = match method {
            HttpMethod::Get => self
                .client
                .get(url)
                .query(params),
            HttpMethod::Post => self
                .client
                .post(url)
                .form(params),
        };
        if let Some((id, token)) = &self.auth {
            request = request.basic_auth(id, Some(token));
        }

        debug!("{} {} with {:?}", method, url, params);
        let resp = request
            .send()
            .await?;
        let status = resp.status();
        let text = resp
            .text()
            .await?;

        if !status.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        info!("{} {} -> {} ({} bytes)", method, url, status, text.len());
        if text
            .trim()
            .is_empty()
        {
            return Err(FetchError::Empty(url.to_string()));
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_parse() {
        assert_eq!("get".parse::<HttpMethod>(), Ok(HttpMethod::Get));
        assert_eq!(" POST ".parse::<HttpMethod>(), Ok(HttpMethod::Post));
        assert!("PUT"
            .parse::<HttpMethod>()
            .is_err());
        assert_eq!(HttpMethod::default(), HttpMethod::Post);
        assert_eq!(HttpMethod::Get.to_string(), "GET");
    }

    #[test]
    fn test_method_deserialize() {
        #[derive(Deserialize)]
        struct Wrapper {
            method: HttpMethod,
        }
        let w: Wrapper = toml::from_str("method = \"GET\"").unwrap();
        assert_eq!(w.method, HttpMethod::Get);
    }

    #[tokio::test]
    async fn test_empty_url_rejected() {
        let fetcher = HttpFetcher::new(Duration::from_secs(1))
            .unwrap()
            .with_basic_auth("", "ignored");
        let err = fetcher
            .fetch("", &BTreeMap::new(), HttpMethod::Post)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::NoUrl));
    }

    #[tokio::test]
    async fn test_get_sends_query_and_auth() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap();
        let addr = listener
            .local_addr()
            .unwrap();
        let server = tokio::spawn(async move {
            let (mut sock, _) = listener
                .accept()
                .await
                .unwrap();
            let mut buf = Vec::new();
            let mut chunk = [0u8; 1024];
            while !String::from_utf8_lossy(&buf).contains("\r\n\r\n") {
                let n = sock
                    .read(&mut chunk)
                    .await
                    .unwrap();
                if n == 0 {
                    break;
                }
                buf.extend_from_slice(&chunk[..n]);
            }
            let body = "<Response/>";
            let reply = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            sock.write_all(reply.as_bytes())
                .await
                .unwrap();
            String::from_utf8_lossy(&buf).to_string()
        });

        let fetcher = HttpFetcher::new(Duration::from_secs(5))
            .unwrap()
            .with_basic_auth("id", "token");
        let mut params = BTreeMap::new();
        params.insert("CallUUID".to_string(), "abc".to_string());
        params.insert("From".to_string(), "1000".to_string());

        let text = fetcher
            .fetch(&format!("http://{}/answer", addr), &params, HttpMethod::Get)
            .await
            .unwrap();
        assert_eq!(text, "<Response/>");

        let request = server
            .await
            .unwrap();
        assert!(request.starts_with("GET /answer?CallUUID=abc&From=1000 HTTP/1.1"));
        assert!(request.contains("authorization: Basic aWQ6dG9rZW4="));
    }
}
