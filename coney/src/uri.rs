//! `amqp://` / `amqps://` URI and endpoint-list parsing
//!
//! The vhost is the single path segment, percent-decoded; `+` is NOT
//! treated as a space. A missing vhost means the default vhost `/`.

use std::fmt;
use std::str::FromStr;

use url::Url;

use crate::endpoint::{Endpoint, DEFAULT_PORT, DEFAULT_TLS_PORT};
use crate::error::ConnectError;

/// A parsed AMQP URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpUri {
    /// Host, port, and TLS flag
    pub endpoint: Endpoint,
    /// Username, if present in the userinfo
    pub username: Option<String>,
    /// Password, if present in the userinfo
    pub password: Option<String>,
    /// Virtual host; `None` means the default vhost `/`
    pub virtual_host: Option<String>,
}

impl FromStr for AmqpUri {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s).map_err(|e| ConnectError::InvalidUri(e.to_string()))?;

        let tls = match url.scheme() {
            "amqp" => false,
            "amqps" => true,
            other => {
                return Err(ConnectError::InvalidUri(format!(
                    "unsupported scheme {other:?}"
                )))
            }
        };

        let host = url
            .host_str()
            .ok_or_else(|| ConnectError::InvalidUri("missing host".into()))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port()
            .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT });

        let username = match url.username() {
            "" => None,
            raw => Some(percent_decode(raw)?),
        };
        let password = match url.password() {
            None => None,
            Some(raw) => Some(percent_decode(raw)?),
        };

        let path = url.path();
        let virtual_host = match path.trim_start_matches('/') {
            "" => None,
            segment if segment.contains('/') => {
                return Err(ConnectError::InvalidUri(
                    "vhost must be a single path segment".into(),
                ))
            }
            segment => Some(percent_decode(segment)?),
        };

        Ok(Self {
            endpoint: Endpoint { host, port, tls },
            username,
            password,
            virtual_host,
        })
    }
}

impl fmt::Display for AmqpUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.endpoint.tls { "amqps" } else { "amqp" };
        write!(f, "{scheme}://")?;
        if let Some(user) = &self.username {
            write!(f, "{}", percent_encode(user))?;
            if let Some(pass) = &self.password {
                write!(f, ":{}", percent_encode(pass))?;
            }
            write!(f, "@")?;
        }
        if self.endpoint.host.contains(':') {
            write!(f, "[{}]", self.endpoint.host)?;
        } else {
            write!(f, "{}", self.endpoint.host)?;
        }
        let default_port = if self.endpoint.tls {
            DEFAULT_TLS_PORT
        } else {
            DEFAULT_PORT
        };
        if self.endpoint.port != default_port {
            write!(f, ":{}", self.endpoint.port)?;
        }
        if let Some(vhost) = &self.virtual_host {
            write!(f, "/{}", percent_encode(vhost))?;
        }
        Ok(())
    }
}

/// Decodes `%XX` escapes. `+` is preserved verbatim.
fn percent_decode(s: &str) -> Result<String, ConnectError> {
    let raw = s.as_bytes();
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        match raw[i] {
            b'%' => {
                let hex = raw
                    .get(i + 1..i + 3)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| {
                        ConnectError::InvalidUri(format!("bad percent escape in {s:?}"))
                    })?;
                out.push(hex);
                i += 3;
            }
            byte => {
                out.push(byte);
                i += 1;
            }
        }
    }
    String::from_utf8(out)
        .map_err(|_| ConnectError::InvalidUri(format!("non-UTF-8 percent data in {s:?}")))
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'%' | b'/' | b'@' | b':' | b'?' | b'#' | b'[' | b']' | b' ' => {
                out.push('%');
                out.push_str(&format!("{byte:02X}"));
            }
            _ => out.push(byte as char),
        }
    }
    out
}

/// Parses a comma-separated `host[:port]` list; IPv6 literals in brackets
pub fn parse_endpoint_list(s: &str) -> Result<Vec<Endpoint>, ConnectError> {
    s.split(',')
        .map(|part| parse_endpoint(part.trim()))
        .collect()
}

fn parse_endpoint(s: &str) -> Result<Endpoint, ConnectError> {
    if s.is_empty() {
        return Err(ConnectError::InvalidUri("empty endpoint".into()));
    }

    if let Some(rest) = s.strip_prefix('[') {
        // IPv6 literal
        let (host, tail) = rest
            .split_once(']')
            .ok_or_else(|| ConnectError::InvalidUri(format!("unterminated bracket in {s:?}")))?;
        let port = match tail.strip_prefix(':') {
            None if tail.is_empty() => DEFAULT_PORT,
            Some(p) => parse_port(p, s)?,
            None => {
                return Err(ConnectError::InvalidUri(format!(
                    "garbage after bracket in {s:?}"
                )))
            }
        };
        return Ok(Endpoint::new(host, port));
    }

    match s.rsplit_once(':') {
        // more than one colon without brackets would be an IPv6 literal
        Some((host, _)) if host.contains(':') => {
            Err(ConnectError::InvalidUri(format!(
                "IPv6 literals need brackets: {s:?}"
            )))
        }
        Some((host, port)) => Ok(Endpoint::new(host, parse_port(port, s)?)),
        None => Ok(Endpoint::new(s, DEFAULT_PORT)),
    }
}

fn parse_port(p: &str, ctx: &str) -> Result<u16, ConnectError> {
    p.parse()
        .map_err(|_| ConnectError::InvalidUri(format!("bad port in {ctx:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_uri() {
        let uri: AmqpUri = "amqps://u:p%40@h:5671/prod%2Fweb".parse().unwrap();
        assert_eq!(uri.username.as_deref(), Some("u"));
        assert_eq!(uri.password.as_deref(), Some("p@"));
        assert_eq!(uri.endpoint.host, "h");
        assert_eq!(uri.endpoint.port, 5671);
        assert!(uri.endpoint.tls);
        assert_eq!(uri.virtual_host.as_deref(), Some("prod/web"));
    }

    #[test]
    fn defaults_elided() {
        let uri: AmqpUri = "amqp://localhost".parse().unwrap();
        assert_eq!(uri.endpoint.port, DEFAULT_PORT);
        assert!(!uri.endpoint.tls);
        assert_eq!(uri.username, None);
        assert_eq!(uri.virtual_host, None);

        let tls: AmqpUri = "amqps://localhost".parse().unwrap();
        assert_eq!(tls.endpoint.port, DEFAULT_TLS_PORT);
        assert!(tls.endpoint.tls);
    }

    #[test]
    fn plus_is_preserved() {
        let uri: AmqpUri = "amqp://h/a+b".parse().unwrap();
        assert_eq!(uri.virtual_host.as_deref(), Some("a+b"));
    }

    #[test]
    fn multiple_path_segments_rejected() {
        assert!("amqp://h/a/b".parse::<AmqpUri>().is_err());
    }

    #[test]
    fn unsupported_scheme_rejected() {
        assert!("http://h".parse::<AmqpUri>().is_err());
    }

    #[test]
    fn roundtrip_modulo_default_elisions() {
        for input in [
            "amqp://localhost",
            "amqps://u:p%40@h:5680/prod%2Fweb",
            "amqp://user@broker.example.com/staging",
        ] {
            let uri: AmqpUri = input.parse().unwrap();
            let formatted = uri.to_string();
            let reparsed: AmqpUri = formatted.parse().unwrap();
            assert_eq!(reparsed, uri, "{input} -> {formatted}");
        }
    }

    #[test]
    fn endpoint_list() {
        let endpoints =
            parse_endpoint_list("one, two:5673, [::1]:5674, [fe80::1]").unwrap();
        assert_eq!(
            endpoints,
            vec![
                Endpoint::new("one", DEFAULT_PORT),
                Endpoint::new("two", 5673),
                Endpoint::new("::1", 5674),
                Endpoint::new("fe80::1", DEFAULT_PORT),
            ]
        );
    }

    #[test]
    fn bare_ipv6_rejected() {
        assert!(parse_endpoint_list("fe80::1:5672").is_err());
    }
}
