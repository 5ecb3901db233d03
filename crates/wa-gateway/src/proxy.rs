use std::fmt;

use thiserror::Error;
use url::Url;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProxyError {
    #[error("proxy is empty")]
    Empty,

    #[error("bad proxy data")]
    Malformed,
}

/// SOCKS5 proxy the External Client dials through, parsed from `host:port:user:pass`.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    url: Url,
}

impl ProxyConfig {
    pub fn parse(raw: &str) -> Result<Self, ProxyError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ProxyError::Empty);
        }

        let parts = raw.split(':').collect::<Vec<_>>();
        let [host, port, user, password] = parts.as_slice() else {
            return Err(ProxyError::Malformed);
        };

        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(ProxyError::Malformed);
        }

        let mut url =
            Url::parse(&format!("socks5://{host}:{port}")).map_err(|_| ProxyError::Malformed)?;
        url.set_username(user).map_err(|()| ProxyError::Malformed)?;
        url.set_password(Some(password))
            .map_err(|()| ProxyError::Malformed)?;

        Ok(Self { url })
    }

    #[must_use]
    pub const fn url(&self) -> &Url {
        &self.url
    }

    /// `host:port` without credentials, for logs.
    #[must_use]
    pub fn endpoint(&self) -> String {
        format!(
            "{}:{}",
            self.url.host_str().unwrap_or_default(),
            self.url.port().unwrap_or_default()
        )
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("endpoint", &self.endpoint())
            .finish_non_exhaustive()
    }
}
