//! Endpoint address parsing.

use crate::TransportError;
use std::fmt;
#[cfg(unix)]
use std::path::PathBuf;
use std::str::FromStr;

/// A parsed endpoint address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Address {
    /// In-process endpoint, `inproc://<name>`
    Inproc(String),
    /// TCP endpoint, `tcp://<host>:<port>`; `*` or an empty host binds every interface
    Tcp {
        /// Host name or IP literal
        host: String,
        /// Port number
        port: u16,
    },
    /// Unix domain socket, `ipc://<path>`
    #[cfg(unix)]
    Ipc(PathBuf),
}

impl Address {
    /// Parse a `scheme://rest` URL
    pub fn parse(url: &str) -> Result<Self, TransportError> {
        let invalid = || TransportError::InvalidAddress(url.to_string());

        let (scheme, rest) = url.split_once("://").ok_or_else(invalid)?;
        match scheme {
            "inproc" => {
                if rest.is_empty() {
                    return Err(invalid());
                }
                Ok(Address::Inproc(rest.to_string()))
            }
            "tcp" => {
                let (host, port) = rest.rsplit_once(':').ok_or_else(invalid)?;
                let port = port.parse::<u16>().map_err(|_| invalid())?;
                let host = host.trim_start_matches('[').trim_end_matches(']');
                Ok(Address::Tcp {
                    host: host.to_string(),
                    port,
                })
            }
            #[cfg(unix)]
            "ipc" => {
                if rest.is_empty() {
                    return Err(invalid());
                }
                Ok(Address::Ipc(PathBuf::from(rest)))
            }
            _ => Err(invalid()),
        }
    }

    /// Host to bind when listening on a TCP address
    pub(crate) fn bind_host(host: &str) -> &str {
        if host.is_empty() || host == "*" {
            "0.0.0.0"
        } else {
            host
        }
    }
}

impl FromStr for Address {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Address::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Inproc(name) => write!(f, "inproc://{}", name),
            Address::Tcp { host, port } if host.contains(':') => {
                write!(f, "tcp://[{}]:{}", host, port)
            }
            Address::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            #[cfg(unix)]
            Address::Ipc(path) => write!(f, "ipc://{}", path.display()),
        }
    }
}
