//! Immutable connection configuration and its builder
//!
//! A [`ConnectionConfig`] is assembled once per connection attempt and
//! never mutated afterwards; every tunable the runtime consults lives
//! here.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use coney_codec::{FieldTable, FieldValue};

use crate::endpoint::{Endpoint, EndpointResolver};
use crate::error::{ConnectError, Error};
use crate::recovery::{RecordedEntity, RecoveryAdvice};
use crate::sasl::SaslMechanism;
use crate::uri::AmqpUri;

/// Default virtual host
pub const DEFAULT_VHOST: &str = "/";
/// Default credentials
pub const DEFAULT_USER: &str = "guest";
/// Default channel-max requested from the server
pub const DEFAULT_CHANNEL_MAX: u16 = 2047;
/// Default inbound body size limit: 64 MiB
pub const DEFAULT_MAX_INBOUND_BODY_SIZE: usize = 64 * 1024 * 1024;
/// Hard ceiling on the inbound body size limit: 512 MiB
pub const MAX_INBOUND_BODY_SIZE_CEILING: usize = 512 * 1024 * 1024;
/// `client_provided_name` is truncated to this many characters
pub const MAX_CLIENT_PROVIDED_NAME_LEN: usize = 3000;

pub(crate) const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 256;
pub(crate) const DEFAULT_CHANNEL_QUEUE_CAPACITY: usize = 256;
// consumer delivery queues are sized by the channel's prefetch window;
// this bound applies only while no basic.qos has set one
pub(crate) const DEFAULT_CONSUMER_QUEUE_CAPACITY: usize = 64;

/// Predicate deciding whether a recorded entity is replayed during
/// topology recovery
pub type TopologyRecoveryFilter = Arc<dyn Fn(&RecordedEntity) -> bool + Send + Sync>;

/// Called for each entity that fails to replay; decides skip, retry, or
/// abort
pub type RecoveryExceptionHandler =
    Arc<dyn Fn(&RecordedEntity, &Error) -> RecoveryAdvice + Send + Sync>;

/// Immutable per-connection configuration
#[derive(Clone)]
pub struct ConnectionConfig {
    pub(crate) endpoints: Vec<Endpoint>,
    pub(crate) resolver: Option<Arc<dyn EndpointResolver>>,
    pub(crate) virtual_host: String,
    pub(crate) username: String,
    pub(crate) password: String,
    pub(crate) auth_mechanisms: Vec<SaslMechanism>,
    pub(crate) requested_channel_max: u16,
    pub(crate) requested_frame_max: u32,
    pub(crate) max_inbound_message_body_size: usize,
    pub(crate) requested_heartbeat: Duration,
    pub(crate) handshake_continuation_timeout: Duration,
    pub(crate) continuation_timeout: Duration,
    pub(crate) connection_timeout: Duration,
    pub(crate) socket_read_timeout: Duration,
    pub(crate) socket_write_timeout: Duration,
    pub(crate) automatic_recovery: bool,
    pub(crate) topology_recovery: bool,
    pub(crate) network_recovery_interval: Duration,
    pub(crate) consumer_dispatch_concurrency: usize,
    pub(crate) client_provided_name: Option<String>,
    pub(crate) client_properties: FieldTable,
    pub(crate) topology_recovery_filter: Option<TopologyRecoveryFilter>,
    pub(crate) topology_recovery_exception_handler: Option<RecoveryExceptionHandler>,
    pub(crate) write_queue_capacity: usize,
    pub(crate) channel_queue_capacity: usize,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("endpoints", &self.endpoints)
            .field("virtual_host", &self.virtual_host)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("auth_mechanisms", &self.auth_mechanisms)
            .field("requested_channel_max", &self.requested_channel_max)
            .field("requested_frame_max", &self.requested_frame_max)
            .field(
                "max_inbound_message_body_size",
                &self.max_inbound_message_body_size,
            )
            .field("requested_heartbeat", &self.requested_heartbeat)
            .field("automatic_recovery", &self.automatic_recovery)
            .field("topology_recovery", &self.topology_recovery)
            .field("network_recovery_interval", &self.network_recovery_interval)
            .field(
                "consumer_dispatch_concurrency",
                &self.consumer_dispatch_concurrency,
            )
            .field("client_provided_name", &self.client_provided_name)
            .finish_non_exhaustive()
    }
}

impl ConnectionConfig {
    /// Starts a builder with the defaults documented per setter
    pub fn builder() -> ConnectionConfigBuilder {
        ConnectionConfigBuilder::default()
    }

    /// Shorthand for `builder().uri(uri)?.build()`
    pub fn from_uri(uri: &str) -> Result<Self, ConnectError> {
        Ok(Self::builder().uri(uri)?.build())
    }

    /// The configured endpoints
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// The configured virtual host
    pub fn virtual_host(&self) -> &str {
        &self.virtual_host
    }

    /// The client-properties table sent in `connection.start-ok`
    pub fn client_properties(&self) -> &FieldTable {
        &self.client_properties
    }
}

/// Builder for [`ConnectionConfig`]
pub struct ConnectionConfigBuilder {
    endpoints: Vec<Endpoint>,
    resolver: Option<Arc<dyn EndpointResolver>>,
    virtual_host: String,
    username: String,
    password: String,
    auth_mechanisms: Vec<SaslMechanism>,
    requested_channel_max: u16,
    requested_frame_max: u32,
    max_inbound_message_body_size: usize,
    requested_heartbeat: Duration,
    handshake_continuation_timeout: Duration,
    continuation_timeout: Duration,
    connection_timeout: Duration,
    socket_read_timeout: Duration,
    socket_write_timeout: Duration,
    automatic_recovery: bool,
    topology_recovery: bool,
    network_recovery_interval: Duration,
    consumer_dispatch_concurrency: usize,
    client_provided_name: Option<String>,
    client_properties: Option<FieldTable>,
    topology_recovery_filter: Option<TopologyRecoveryFilter>,
    topology_recovery_exception_handler: Option<RecoveryExceptionHandler>,
}

impl Default for ConnectionConfigBuilder {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            resolver: None,
            virtual_host: DEFAULT_VHOST.to_string(),
            username: DEFAULT_USER.to_string(),
            password: DEFAULT_USER.to_string(),
            auth_mechanisms: vec![SaslMechanism::Plain],
            requested_channel_max: DEFAULT_CHANNEL_MAX,
            requested_frame_max: 0,
            max_inbound_message_body_size: DEFAULT_MAX_INBOUND_BODY_SIZE,
            requested_heartbeat: Duration::from_secs(60),
            handshake_continuation_timeout: Duration::from_secs(10),
            continuation_timeout: Duration::from_secs(20),
            connection_timeout: Duration::from_secs(30),
            socket_read_timeout: Duration::from_secs(30),
            socket_write_timeout: Duration::from_secs(30),
            automatic_recovery: true,
            topology_recovery: true,
            network_recovery_interval: Duration::from_secs(5),
            consumer_dispatch_concurrency: 1,
            client_provided_name: None,
            client_properties: None,
            topology_recovery_filter: None,
            topology_recovery_exception_handler: None,
        }
    }
}

impl fmt::Debug for ConnectionConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfigBuilder")
            .field("endpoints", &self.endpoints)
            .field("virtual_host", &self.virtual_host)
            .finish_non_exhaustive()
    }
}

impl ConnectionConfigBuilder {
    /// Applies host, port, TLS flag, credentials, and vhost from an
    /// `amqp://` / `amqps://` URI
    pub fn uri(mut self, uri: &str) -> Result<Self, ConnectError> {
        let parsed: AmqpUri = uri.parse()?;
        if let Some(user) = parsed.username {
            self.username = user;
        }
        if let Some(pass) = parsed.password {
            self.password = pass;
        }
        if let Some(vhost) = parsed.virtual_host {
            self.virtual_host = vhost;
        }
        self.endpoints.push(parsed.endpoint);
        Ok(self)
    }

    /// Adds a candidate endpoint
    pub fn endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoints.push(endpoint);
        self
    }

    /// Adds candidate endpoints from a comma-separated `host[:port]` list
    pub fn endpoint_list(mut self, list: &str) -> Result<Self, ConnectError> {
        self.endpoints.extend(crate::uri::parse_endpoint_list(list)?);
        Ok(self)
    }

    /// Replaces the default shuffling endpoint resolver
    pub fn resolver(mut self, resolver: Arc<dyn EndpointResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Virtual host, default `/`
    pub fn virtual_host(mut self, vhost: impl Into<String>) -> Self {
        self.virtual_host = vhost.into();
        self
    }

    /// Credentials, default `guest`/`guest`
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// SASL mechanisms in preference order, default `[PLAIN]`
    pub fn auth_mechanisms(mut self, mechanisms: Vec<SaslMechanism>) -> Self {
        self.auth_mechanisms = mechanisms;
        self
    }

    /// Requested channel-max, default 2047; 0 requests no limit
    pub fn requested_channel_max(mut self, channel_max: u16) -> Self {
        self.requested_channel_max = channel_max;
        self
    }

    /// Requested frame-max, default 0 (let the server pick)
    pub fn requested_frame_max(mut self, frame_max: u32) -> Self {
        self.requested_frame_max = frame_max;
        self
    }

    /// Largest inbound message body accepted, default 64 MiB, clamped to
    /// a 512 MiB ceiling
    pub fn max_inbound_message_body_size(mut self, limit: usize) -> Self {
        self.max_inbound_message_body_size = limit.min(MAX_INBOUND_BODY_SIZE_CEILING);
        self
    }

    /// Requested heartbeat interval, default 60 s; zero disables
    pub fn requested_heartbeat(mut self, interval: Duration) -> Self {
        self.requested_heartbeat = interval;
        self
    }

    /// Per-step bound on the handshake, default 10 s
    pub fn handshake_continuation_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_continuation_timeout = timeout;
        self
    }

    /// Bound on open-phase RPC continuations, default 20 s
    pub fn continuation_timeout(mut self, timeout: Duration) -> Self {
        self.continuation_timeout = timeout;
        self
    }

    /// TCP connect timeout, default 30 s
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Socket read timeout, default 30 s; the effective read deadline is
    /// the larger of this and twice the negotiated heartbeat
    pub fn socket_read_timeout(mut self, timeout: Duration) -> Self {
        self.socket_read_timeout = timeout;
        self
    }

    /// Socket write timeout, default 30 s
    pub fn socket_write_timeout(mut self, timeout: Duration) -> Self {
        self.socket_write_timeout = timeout;
        self
    }

    /// Recover from involuntary disconnects, default true
    pub fn automatic_recovery(mut self, enabled: bool) -> Self {
        self.automatic_recovery = enabled;
        self
    }

    /// Replay declared topology after recovery, default true
    pub fn topology_recovery(mut self, enabled: bool) -> Self {
        self.topology_recovery = enabled;
        self
    }

    /// Delay before the first reconnect attempt, default 5 s
    pub fn network_recovery_interval(mut self, interval: Duration) -> Self {
        self.network_recovery_interval = interval;
        self
    }

    /// Worker tasks per consumer, default 1; delivery order is only
    /// preserved at 1
    pub fn consumer_dispatch_concurrency(mut self, concurrency: usize) -> Self {
        self.consumer_dispatch_concurrency = concurrency.max(1);
        self
    }

    /// Connection name shown by the server's management surface,
    /// truncated to 3000 characters
    pub fn client_provided_name(mut self, name: impl Into<String>) -> Self {
        let mut name = name.into();
        name.truncate(MAX_CLIENT_PROVIDED_NAME_LEN);
        self.client_provided_name = Some(name);
        self
    }

    /// Extra entries merged over the default client-properties table
    pub fn client_properties(mut self, properties: FieldTable) -> Self {
        self.client_properties = Some(properties);
        self
    }

    /// Predicate selecting which recorded entities recovery replays
    pub fn topology_recovery_filter(mut self, filter: TopologyRecoveryFilter) -> Self {
        self.topology_recovery_filter = Some(filter);
        self
    }

    /// Per-entity replay error handler
    pub fn topology_recovery_exception_handler(
        mut self,
        handler: RecoveryExceptionHandler,
    ) -> Self {
        self.topology_recovery_exception_handler = Some(handler);
        self
    }

    /// Finalizes the configuration
    pub fn build(self) -> ConnectionConfig {
        let client_properties =
            default_client_properties(self.client_provided_name.as_deref(), self.client_properties);
        ConnectionConfig {
            endpoints: self.endpoints,
            resolver: self.resolver,
            virtual_host: self.virtual_host,
            username: self.username,
            password: self.password,
            auth_mechanisms: self.auth_mechanisms,
            requested_channel_max: self.requested_channel_max,
            requested_frame_max: self.requested_frame_max,
            max_inbound_message_body_size: self.max_inbound_message_body_size,
            requested_heartbeat: self.requested_heartbeat,
            handshake_continuation_timeout: self.handshake_continuation_timeout,
            continuation_timeout: self.continuation_timeout,
            connection_timeout: self.connection_timeout,
            socket_read_timeout: self.socket_read_timeout,
            socket_write_timeout: self.socket_write_timeout,
            automatic_recovery: self.automatic_recovery,
            topology_recovery: self.topology_recovery,
            network_recovery_interval: self.network_recovery_interval,
            consumer_dispatch_concurrency: self.consumer_dispatch_concurrency,
            client_provided_name: self.client_provided_name,
            client_properties,
            topology_recovery_filter: self.topology_recovery_filter,
            topology_recovery_exception_handler: self.topology_recovery_exception_handler,
            write_queue_capacity: DEFAULT_WRITE_QUEUE_CAPACITY,
            channel_queue_capacity: DEFAULT_CHANNEL_QUEUE_CAPACITY,
        }
    }
}

fn default_client_properties(
    connection_name: Option<&str>,
    overrides: Option<FieldTable>,
) -> FieldTable {
    let mut capabilities = FieldTable::new();
    for capability in [
        "publisher_confirms",
        "consumer_cancel_notify",
        "connection.blocked",
        "basic.nack",
    ] {
        capabilities.insert(
            capability.try_into().expect("capability name fits"),
            FieldValue::Bool(true),
        );
    }

    let mut properties = FieldTable::new();
    let entries: [(&str, FieldValue); 5] = [
        ("product", FieldValue::LongString("coney".into())),
        (
            "version",
            FieldValue::LongString(env!("CARGO_PKG_VERSION").into()),
        ),
        ("platform", FieldValue::LongString("Rust".into())),
        (
            "copyright",
            FieldValue::LongString("Copyright (c) the coney contributors".into()),
        ),
        (
            "information",
            FieldValue::LongString("Licensed under MIT/Apache-2.0".into()),
        ),
    ];
    for (key, value) in entries {
        properties.insert(key.try_into().expect("property key fits"), value);
    }
    properties.insert(
        "capabilities".try_into().expect("key fits"),
        FieldValue::Table(capabilities),
    );
    if let Some(name) = connection_name {
        properties.insert(
            "connection_name".try_into().expect("key fits"),
            FieldValue::LongString(name.into()),
        );
    }
    if let Some(overrides) = overrides {
        for (key, value) in overrides.iter() {
            properties.insert(key.clone(), value.clone());
        }
    }
    properties
}
