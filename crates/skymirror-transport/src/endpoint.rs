//! Remote endpoint description.

use std::time::Duration;

use crate::constants::DEFAULT_CONNECT_TIMEOUT;
use crate::credentials::Credentials;
use crate::error::TransportError;

/// URL scheme accepted for remote stores.
pub const URL_SCHEME: &str = "tcp://";

/// Where and how to reach a remote store.
#[derive(Debug, Clone)]
pub struct RemoteEndpoint {
    /// `tcp://host:port` or plain `host:port`.
    pub url: String,
    pub credentials: Option<Credentials>,
    /// Name announced in the hello, shown in server logs.
    pub client_name: String,
    pub connect_timeout: Duration,
}

impl RemoteEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            credentials: None,
            client_name: "skymirror".to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = name.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// The `host:port` this endpoint dials.
    pub fn address(&self) -> Result<String, TransportError> {
        parse_address(&self.url)
    }
}

/// Turn a remote URL into a dialable `host:port`.
pub fn parse_address(url: &str) -> Result<String, TransportError> {
    let invalid = |reason: &str| TransportError::InvalidUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    let rest = match url.split_once("://") {
        Some((scheme, rest)) if format!("{scheme}://") == URL_SCHEME => rest,
        Some(_) => return Err(invalid("unsupported scheme, expected tcp://")),
        None => url,
    };
    let rest = rest.trim_end_matches('/');

    let (host, port) = rest.rsplit_once(':').ok_or_else(|| invalid("missing port"))?;
    if host.is_empty() {
        return Err(invalid("missing host"));
    }
    port.parse::<u16>().map_err(|_| invalid("port is not a number"))?;
    Ok(rest.to_string())
}
