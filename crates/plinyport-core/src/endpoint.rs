use std::fmt;
use std::str::FromStr;

use crate::PlinyError;

/// Address of the compute cluster's entry node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl From<(&str, u16)> for Endpoint {
    fn from((host, port): (&str, u16)) -> Self {
        Self::new(host, port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = PlinyError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| PlinyError::InvalidEndpoint {
            input: raw.to_string(),
            reason: reason.to_string(),
        };

        let (host, port) = raw.rsplit_once(':').ok_or_else(|| invalid("expected host:port"))?;
        let host = host
            .strip_prefix('[')
            .and_then(|h| h.strip_suffix(']'))
            .unwrap_or(host);
        if host.is_empty() {
            return Err(invalid("host is empty"));
        }
        let port: u16 = port.parse().map_err(|_| invalid("port is not a number in 0..=65535"))?;
        Ok(Self::new(host, port))
    }
}
