//! Request description: URL, verb, headers, body, and per-request settings.

use std::time::Duration;

/// HTTP verb of a [`Request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Get,
    Head,
    Post,
    Put,
    Patch,
    Delete,
}

/// Proxy protocol selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyType {
    /// No proxy; connect directly.
    #[default]
    None,
    Http,
    Socks4,
    Socks4a,
    Socks5,
    /// SOCKS5 with proxy-side hostname resolution.
    Socks5Hostname,
}

/// Proxy endpoint and credentials. Credentials are applied only when both
/// username and password are non-empty.
#[derive(Debug, Clone, Default)]
pub struct ProxySettings {
    pub proxy_type: ProxyType,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

impl ProxySettings {
    /// A proxy of the given type at `hostname:port`, without credentials.
    pub fn new(proxy_type: ProxyType, hostname: impl Into<String>, port: u16) -> Self {
        ProxySettings {
            proxy_type,
            hostname: hostname.into(),
            port,
            username: String::new(),
            password: String::new(),
        }
    }

    /// Attach credentials.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }
}

/// Per-request tuning knobs.
#[derive(Debug, Clone)]
pub struct RequestSettings {
    /// Connection establishment deadline.
    pub connect_timeout: Duration,
    /// Transfer deadline once connected. The overall libcurl deadline is
    /// `connect_timeout + transfer_timeout`.
    pub transfer_timeout: Duration,
    /// Immediate re-queues consumed before a retryable failure surfaces.
    pub retries: u32,
    /// Proxy to route the transfer through.
    pub proxy: ProxySettings,
    /// Drop response bodies of non-2xx/206 answers instead of delivering
    /// them to the payload sink.
    pub skip_content: bool,
    /// Append chunks without realigning the sink's write cursor first.
    pub ignore_offset: bool,
}

impl Default for RequestSettings {
    fn default() -> Self {
        RequestSettings {
            connect_timeout: Duration::from_secs(60),
            transfer_timeout: Duration::from_secs(30),
            retries: 3,
            proxy: ProxySettings::default(),
            skip_content: false,
            ignore_offset: false,
        }
    }
}

/// One HTTP request submission.
///
/// # Example
///
/// ```rust
/// use tidepool::{Request, Verb};
///
/// let request = Request::new("http://example.com/upload")
///     .with_verb(Verb::Put)
///     .with_header("content-type", "application/octet-stream")
///     .with_body(b"payload".to_vec());
/// assert_eq!(request.verb(), Verb::Put);
/// ```
#[derive(Debug, Clone)]
pub struct Request {
    url: String,
    verb: Verb,
    body: Option<Vec<u8>>,
    headers: Vec<(String, String)>,
    settings: RequestSettings,
}

impl Request {
    /// A GET request for `url` with default settings.
    pub fn new(url: impl Into<String>) -> Self {
        Request {
            url: url.into(),
            verb: Verb::Get,
            body: None,
            headers: Vec::new(),
            settings: RequestSettings::default(),
        }
    }

    /// Set the HTTP verb.
    pub fn with_verb(mut self, verb: Verb) -> Self {
        self.verb = verb;
        self
    }

    /// Append a request header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Set the request body. Ignored for GET and HEAD.
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Replace the per-request settings.
    pub fn with_settings(mut self, settings: RequestSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn verb(&self) -> Verb {
        self.verb
    }

    pub fn body(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn settings(&self) -> &RequestSettings {
        &self.settings
    }
}
