//! Broker endpoints and the endpoint resolver
//!
//! The resolver is a small capability interface: it yields a candidate
//! ordering per connection round, and [`select_one`] drives an attempt
//! function over that ordering until one endpoint accepts.

use std::fmt;
use std::future::Future;
use std::io;

use rand::seq::SliceRandom;

use crate::error::{ConnectError, HandshakeError};

/// Default port for `amqp://`
pub const DEFAULT_PORT: u16 = 5672;

/// Default port for `amqps://`
pub const DEFAULT_TLS_PORT: u16 = 5671;

/// A candidate broker address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or IP literal (IPv6 without brackets)
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Whether the endpoint expects TLS
    pub tls: bool,
}

impl Endpoint {
    /// Plain endpoint on the default AMQP port
    pub fn amqp(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_PORT,
            tls: false,
        }
    }

    /// TLS endpoint on the default AMQPS port
    pub fn amqps(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_TLS_PORT,
            tls: true,
        }
    }

    /// Endpoint with an explicit port
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tls: false,
        }
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

/// Yields the candidate ordering for one connection round
pub trait EndpointResolver: Send + Sync + fmt::Debug {
    /// A fresh ordering of candidates to try
    fn candidates(&self) -> Vec<Endpoint>;
}

/// The default resolver: a stable candidate set visited in a freshly
/// shuffled order each round
#[derive(Debug, Clone)]
pub struct ShuffledResolver {
    endpoints: Vec<Endpoint>,
}

impl ShuffledResolver {
    /// Creates a resolver over the given candidates
    pub fn new(endpoints: Vec<Endpoint>) -> Self {
        Self { endpoints }
    }
}

impl EndpointResolver for ShuffledResolver {
    fn candidates(&self) -> Vec<Endpoint> {
        let mut order = self.endpoints.clone();
        order.shuffle(&mut rand::thread_rng());
        order
    }
}

/// Drives `attempt` over one candidate round until an endpoint accepts
///
/// Failures that another endpoint could fix (IO errors, timeouts) keep the
/// iteration going and aggregate into [`ConnectError::BrokerUnreachable`].
/// Failures no endpoint can fix (bad credentials, no mechanism in common)
/// short-circuit.
pub(crate) async fn select_one<F, Fut, T>(
    resolver: &dyn EndpointResolver,
    mut attempt: F,
) -> Result<T, ConnectError>
where
    F: FnMut(Endpoint) -> Fut,
    Fut: Future<Output = Result<T, HandshakeError>>,
{
    let candidates = resolver.candidates();
    if candidates.is_empty() {
        return Err(ConnectError::NoEndpoints);
    }

    let attempts = candidates.len();
    let mut last: Option<HandshakeError> = None;
    for endpoint in candidates {
        tracing::debug!(%endpoint, "attempting endpoint");
        match attempt(endpoint).await {
            Ok(value) => return Ok(value),
            Err(err @ HandshakeError::AuthFailure(_))
            | Err(err @ HandshakeError::MechanismMismatch { .. }) => {
                return Err(ConnectError::Handshake(err))
            }
            Err(err) => {
                tracing::debug!(error = %err, "endpoint attempt failed");
                last = Some(err);
            }
        }
    }

    match last {
        Some(HandshakeError::Io(last)) => Err(ConnectError::BrokerUnreachable { attempts, last }),
        Some(HandshakeError::Transport(crate::error::TransportError::Io(last))) => {
            Err(ConnectError::BrokerUnreachable { attempts, last })
        }
        Some(HandshakeError::Timeout) => Err(ConnectError::BrokerUnreachable {
            attempts,
            last: io::Error::new(io::ErrorKind::TimedOut, "handshake timed out"),
        }),
        Some(err) => Err(ConnectError::Handshake(err)),
        None => unreachable!("candidates were non-empty"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[test]
    fn shuffled_resolver_keeps_the_candidate_set() {
        let endpoints = vec![
            Endpoint::amqp("a"),
            Endpoint::amqp("b"),
            Endpoint::amqp("c"),
        ];
        let resolver = ShuffledResolver::new(endpoints.clone());
        let order = resolver.candidates();
        assert_eq!(order.len(), 3);
        let hosts: HashSet<_> = order.into_iter().map(|e| e.host).collect();
        assert_eq!(hosts.len(), 3);
    }

    #[tokio::test]
    async fn select_one_tries_each_failed_endpoint_before_success() {
        let resolver = ShuffledResolver::new(vec![
            Endpoint::amqp("bad1"),
            Endpoint::amqp("bad2"),
            Endpoint::amqp("good"),
        ]);
        let attempts = AtomicUsize::new(0);
        let result = select_one(&resolver, |endpoint| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if endpoint.host == "good" {
                    Ok(endpoint.host)
                } else {
                    Err(HandshakeError::Io(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        "refused",
                    )))
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, "good");
        assert!(attempts.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn select_one_aggregates_into_broker_unreachable() {
        let resolver =
            ShuffledResolver::new(vec![Endpoint::amqp("bad1"), Endpoint::amqp("bad2")]);
        let err = select_one(&resolver, |_| async {
            Err::<(), _>(HandshakeError::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "refused",
            )))
        })
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            ConnectError::BrokerUnreachable { attempts: 2, .. }
        ));
    }

    #[tokio::test]
    async fn auth_failure_short_circuits() {
        let resolver =
            ShuffledResolver::new(vec![Endpoint::amqp("a"), Endpoint::amqp("b")]);
        let attempts = AtomicUsize::new(0);
        let err = select_one(&resolver, |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(HandshakeError::AuthFailure("403".into())) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ConnectError::Handshake(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_candidate_set_is_an_error() {
        let resolver = ShuffledResolver::new(Vec::new());
        let err = select_one(&resolver, |_| async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, ConnectError::NoEndpoints));
    }
}
