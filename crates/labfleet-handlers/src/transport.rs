//! Instrument endpoints and reachability probing
//!
//! Third-party instruments are reached either through a serial port (`port`)
//! or over the network (`server_url`). Before a non-simulated device is built
//! its endpoint is probed, and an unreachable endpoint is reported as a
//! connection error so the supervisor can fall back to simulation.

use labfleet_core::{DeviceDescriptor, DeviceError};
use std::fmt;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, trace};

/// Default timeout for network probes
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Serial device node, e.g. `/dev/ttyUSB0`
    Serial(PathBuf),
    /// `host:port` of a networked instrument controller
    Network { host: String, port: u16 },
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Serial(path) => write!(f, "serial {}", path.display()),
            Self::Network { host, port } => write!(f, "{}:{}", host, port),
        }
    }
}

impl Endpoint {
    /// Parse a URL such as `http://10.0.0.7:8080/api` or `opc.tcp://host:4840`
    pub fn from_url(url: &str) -> Option<Self> {
        let (scheme, rest) = match url.split_once("://") {
            Some((scheme, rest)) => (scheme, rest),
            None => ("", url),
        };
        let authority = rest.split('/').next()?;
        let authority = authority.rsplit('@').next()?;
        if authority.is_empty() {
            return None;
        }

        let default_port = match scheme {
            "https" => Some(443),
            "http" => Some(80),
            "opc.tcp" => Some(4840),
            _ => None,
        };

        // bracketed IPv6 literal
        if let Some(stripped) = authority.strip_prefix('[') {
            let (host, tail) = stripped.split_once(']')?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p.parse().ok()?,
                None => default_port?,
            };
            return Some(Self::Network {
                host: host.to_string(),
                port,
            });
        }

        match authority.rsplit_once(':') {
            Some((host, port)) => Some(Self::Network {
                host: host.to_string(),
                port: port.parse().ok()?,
            }),
            None => Some(Self::Network {
                host: authority.to_string(),
                port: default_port?,
            }),
        }
    }

    /// Endpoint named by the descriptor's `key` field
    pub fn from_descriptor(descriptor: &DeviceDescriptor, key: &str) -> Result<Self, DeviceError> {
        let value = descriptor.extra_str(key).ok_or_else(|| {
            DeviceError::connection(&descriptor.name, format!("no '{}' configured", key))
        })?;

        if key == "server_url" {
            Self::from_url(value).ok_or_else(|| DeviceError::InvalidDescriptor {
                device: descriptor.name.clone(),
                reason: format!("cannot parse server_url '{}'", value),
            })
        } else {
            Ok(Self::Serial(PathBuf::from(value)))
        }
    }

    /// Check that the endpoint is there
    pub fn probe(&self, timeout: Duration) -> Result<(), String> {
        trace!("Probing {}", self);
        match self {
            Self::Serial(path) => {
                if path.exists() {
                    Ok(())
                } else {
                    Err(format!("serial port {} not found", path.display()))
                }
            }
            Self::Network { host, port } => {
                let addrs = (host.as_str(), *port)
                    .to_socket_addrs()
                    .map_err(|e| format!("cannot resolve {}: {}", host, e))?;
                let mut last_error = format!("{}:{} did not resolve to an address", host, port);
                for addr in addrs {
                    match TcpStream::connect_timeout(&addr, timeout) {
                        Ok(_) => {
                            debug!("{} is reachable at {}", self, addr);
                            return Ok(());
                        }
                        Err(e) => last_error = format!("{}: {}", addr, e),
                    }
                }
                Err(last_error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use labfleet_core::DeviceKind;
    use std::net::TcpListener;

    #[test]
    fn test_parse_urls() {
        assert_eq!(
            Endpoint::from_url("http://10.0.0.7:8080/api"),
            Some(Endpoint::Network {
                host: "10.0.0.7".into(),
                port: 8080
            })
        );
        assert_eq!(
            Endpoint::from_url("https://purifier.lab"),
            Some(Endpoint::Network {
                host: "purifier.lab".into(),
                port: 443
            })
        );
        assert_eq!(
            Endpoint::from_url("opc.tcp://[::1]:4841"),
            Some(Endpoint::Network {
                host: "::1".into(),
                port: 4841
            })
        );
        assert_eq!(Endpoint::from_url("ftp://nohost"), None);
    }

    #[test]
    fn test_probe_network() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let endpoint = Endpoint::Network {
            host: "127.0.0.1".into(),
            port,
        };
        assert!(endpoint.probe(PROBE_TIMEOUT).is_ok());

        drop(listener);
        assert!(endpoint.probe(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn test_probe_serial() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(Endpoint::Serial(file.path().to_path_buf())
            .probe(PROBE_TIMEOUT)
            .is_ok());
        assert!(Endpoint::Serial(PathBuf::from("/dev/does-not-exist-0"))
            .probe(PROBE_TIMEOUT)
            .is_err());
    }

    #[test]
    fn test_missing_key_is_connection_error() {
        let descriptor = DeviceDescriptor::new("bal1", DeviceKind::new("balance", "Sartorius"));
        let err = Endpoint::from_descriptor(&descriptor, "port").unwrap_err();
        assert!(err.is_connection());
    }
}
