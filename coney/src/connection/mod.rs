//! Connection: handshake driver, frame routing, and lifecycle
//!
//! A [`Connection`] owns the transport through exactly one reader task and
//! one writer task per live transport generation. Channels multiplex over
//! it through a bounded write-command queue; inbound frames are routed by
//! channel id into per-channel dispatcher queues. The reader never blocks
//! on user code.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coney_codec::constants::reply_code;
use coney_codec::method::{channel as channel_methods, connection};
use coney_codec::{FieldTable, Frame, FramePayload, Method};
use parking_lot::Mutex;
use slab::Slab;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

use crate::channel::{spawn_dispatcher, Channel, ChannelShared, ChannelState, RpcReply};
use crate::config::ConnectionConfig;
use crate::endpoint::{select_one, Endpoint, EndpointResolver, ShuffledResolver};
use crate::error::{CloseReason, ConnectError, Error, HandshakeError};
use crate::recovery::{self, Topology};
use crate::transport::Transport;
use crate::util::Running;

pub(crate) mod engine;
pub(crate) mod handshake;
pub(crate) mod heartbeat;

use engine::{reader_loop, writer_loop, EngineFault, FaultKind, WriteCommand};
use handshake::Negotiated;
use heartbeat::HeartBeat;

/// Lifecycle state of a connection, observable via [`Connection::watch_status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// Handshake complete, channels usable
    Open,
    /// Involuntary disconnect detected, reconnect in progress
    Recovering,
    /// Orderly close in progress
    Closing,
    /// Terminal
    Closed,
}

/// Per-generation wiring: the writer queue and the negotiated limits
#[derive(Debug)]
pub(crate) struct Wire {
    pub tx: mpsc::Sender<WriteCommand>,
    pub channel_max: u16,
    pub frame_max: u32,
}

pub(crate) struct ConnectionInner {
    pub(crate) config: ConnectionConfig,
    status_tx: watch::Sender<ConnectionStatus>,
    blocked_tx: watch::Sender<bool>,
    pub(crate) wire: Mutex<Option<Wire>>,
    pub(crate) channels: Mutex<Slab<Arc<ChannelShared>>>,
    pub(crate) topology: Mutex<Topology>,
    close_waiter: Mutex<Option<oneshot::Sender<()>>>,
    pub(crate) close_reason: Mutex<Option<CloseReason>>,
    pub(crate) fault_tx: mpsc::Sender<EngineFault>,
    generation: AtomicU64,
    server_properties: Mutex<FieldTable>,
}

impl fmt::Debug for ConnectionInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionInner")
            .field("status", &self.status())
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ConnectionInner {
    fn new(config: ConnectionConfig, fault_tx: mpsc::Sender<EngineFault>) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Recovering);
        let (blocked_tx, _) = watch::channel(false);
        Self {
            config,
            status_tx,
            blocked_tx,
            wire: Mutex::new(None),
            channels: Mutex::new(Slab::new()),
            topology: Mutex::new(Topology::default()),
            close_waiter: Mutex::new(None),
            close_reason: Mutex::new(None),
            fault_tx,
            generation: AtomicU64::new(0),
            server_properties: Mutex::new(FieldTable::new()),
        }
    }

    pub(crate) fn status(&self) -> ConnectionStatus {
        *self.status_tx.borrow()
    }

    pub(crate) fn set_status(&self, status: ConnectionStatus) {
        self.status_tx.send_replace(status);
    }

    pub(crate) fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        matches!(
            self.status(),
            ConnectionStatus::Closing | ConnectionStatus::Closed
        )
    }

    pub(crate) fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub(crate) fn connection_closed_error(&self) -> Error {
        self.close_reason
            .lock()
            .as_ref()
            .map(CloseReason::connection_error)
            .unwrap_or(Error::ConnectionClosed {
                reply_code: reply_code::REPLY_SUCCESS,
                reply_text: "connection closed".into(),
            })
    }

    /// Blocks user operations while a recovery is rebinding the transport
    pub(crate) async fn wait_until_open(&self) -> Result<(), Error> {
        let mut status = self.status_tx.subscribe();
        loop {
            let current = *status.borrow_and_update();
            match current {
                ConnectionStatus::Open => return Ok(()),
                ConnectionStatus::Closing | ConnectionStatus::Closed => {
                    return Err(self.connection_closed_error())
                }
                ConnectionStatus::Recovering => {
                    if status.changed().await.is_err() {
                        return Err(self.connection_closed_error());
                    }
                }
            }
        }
    }

    /// Submits work to the writer task; applies write-queue backpressure
    pub(crate) async fn send_command(&self, command: WriteCommand) -> Result<(), Error> {
        let tx = self
            .wire
            .lock()
            .as_ref()
            .map(|wire| wire.tx.clone())
            .ok_or_else(|| self.connection_closed_error())?;
        tx.send(command)
            .await
            .map_err(|_| Error::OperationInterrupted)
    }

    pub(crate) fn frame_max(&self) -> u32 {
        self.wire
            .lock()
            .as_ref()
            .map(|wire| wire.frame_max)
            .unwrap_or(coney_codec::constants::FRAME_MIN_SIZE)
    }

    /// Binds a negotiated transport: bumps the generation and spawns the
    /// reader and writer tasks for it
    pub(crate) fn install_transport<Io>(
        self: &Arc<Self>,
        transport: Transport<Io>,
        negotiated: &Negotiated,
    ) where
        Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(self.config.write_queue_capacity);
        let (writer, reader) = transport.into_split();

        // send heartbeats at half the negotiated interval so a single
        // delayed tick does not look like a dead peer
        let heartbeat = if negotiated.heartbeat.is_zero() {
            HeartBeat::never()
        } else {
            HeartBeat::new((negotiated.heartbeat / 2).max(Duration::from_secs(1)))
        };

        tokio::spawn(writer_loop(
            writer,
            rx,
            heartbeat,
            self.config.socket_write_timeout,
            self.fault_tx.clone(),
            generation,
        ));
        tokio::spawn(reader_loop(
            reader,
            Arc::clone(self),
            self.fault_tx.clone(),
            generation,
        ));

        *self.wire.lock() = Some(Wire {
            tx,
            channel_max: negotiated.channel_max,
            frame_max: negotiated.frame_max,
        });
        *self.server_properties.lock() = negotiated.server_properties.clone();
        debug!(generation, "transport installed");
    }

    pub(crate) fn teardown_wire(&self) {
        *self.wire.lock() = None;
    }

    /// The dispatcher queue of one channel, if the channel exists
    ///
    /// `None` means no such channel (a protocol error on the wire);
    /// `Some(None)` means the channel is draining or rebinding and late
    /// frames are discarded.
    pub(crate) fn channel_sender(
        &self,
        channel: u16,
    ) -> Option<Option<mpsc::Sender<FramePayload>>> {
        let index = usize::from(channel).checked_sub(1)?;
        self.channels
            .lock()
            .get(index)
            .map(|shared| shared.inbound_sender())
    }

    /// Whether every live channel's dispatcher queue is out of capacity;
    /// only then may the reader stop pulling from the socket
    pub(crate) fn all_channel_queues_full(&self) -> bool {
        let channels = self.channels.lock();
        let mut saw_live = false;
        for (_, shared) in channels.iter() {
            if let Some(tx) = shared.inbound_sender() {
                saw_live = true;
                if tx.capacity() > 0 {
                    return false;
                }
            }
        }
        saw_live
    }

    /// Dispatcher queues of every live channel
    pub(crate) fn live_channel_senders(&self) -> Vec<mpsc::Sender<FramePayload>> {
        self.channels
            .lock()
            .iter()
            .filter_map(|(_, shared)| shared.inbound_sender())
            .collect()
    }

    /// Handles a frame on channel 0; called by the reader task only
    pub(crate) async fn on_connection_frame(
        &self,
        payload: FramePayload,
    ) -> Result<Running, FaultKind> {
        match payload {
            FramePayload::Heartbeat => Ok(Running::Continue),
            FramePayload::Method(Method::ConnectionClose(close)) => {
                let reason = CloseReason {
                    reply_code: close.reply_code,
                    reply_text: close.reply_text.to_string(),
                    class_id: close.class_id,
                    method_id: close.method_id,
                };
                let _ = self
                    .send_command(WriteCommand::Frames(vec![Frame::method(
                        0,
                        Method::ConnectionCloseOk,
                    )]))
                    .await;
                *self.close_reason.lock() = Some(reason.clone());
                if self.is_shutting_down() {
                    // crossed with our own close; treat as orderly
                    self.complete_close();
                    Ok(Running::Stop)
                } else {
                    warn!(code = reason.reply_code, text = %reason.reply_text, "server closed connection");
                    Err(FaultKind::Protocol {
                        code: reason.reply_code,
                        message: reason.reply_text,
                    })
                }
            }
            FramePayload::Method(Method::ConnectionCloseOk) => {
                self.complete_close();
                Ok(Running::Stop)
            }
            FramePayload::Method(Method::ConnectionBlocked(blocked)) => {
                debug!(reason = %blocked.reason, "connection blocked by server");
                self.blocked_tx.send_replace(true);
                Ok(Running::Continue)
            }
            FramePayload::Method(Method::ConnectionUnblocked) => {
                self.blocked_tx.send_replace(false);
                Ok(Running::Continue)
            }
            FramePayload::Method(other) => {
                let message = format!(
                    "method {}.{} invalid on channel 0",
                    other.class_id(),
                    other.method_id()
                );
                self.send_close_frame(reply_code::COMMAND_INVALID, &message)
                    .await;
                Err(FaultKind::Protocol {
                    code: reply_code::COMMAND_INVALID,
                    message,
                })
            }
            FramePayload::Header(_) | FramePayload::Body(_) => {
                let message = "content frame on channel 0".to_string();
                self.send_close_frame(reply_code::UNEXPECTED_FRAME, &message)
                    .await;
                Err(FaultKind::Protocol {
                    code: reply_code::UNEXPECTED_FRAME,
                    message,
                })
            }
        }
    }

    /// Best-effort `connection.close` announcing why we are bailing
    pub(crate) async fn send_close_frame(&self, code: u16, message: &str) {
        let mut text = message.to_string();
        text.truncate(255);
        let close = connection::Close {
            reply_code: code,
            reply_text: text.try_into().expect("truncated to short string size"),
            class_id: 0,
            method_id: 0,
        };
        let _ = self
            .send_command(WriteCommand::Frames(vec![Frame::method(
                0,
                Method::ConnectionClose(close),
            )]))
            .await;
    }

    /// Reports a protocol violation detected outside the reader task
    pub(crate) async fn report_protocol_error(&self, code: u16, message: String) {
        self.send_close_frame(code, &message).await;
        let _ = self
            .fault_tx
            .send(EngineFault {
                generation: self.current_generation(),
                kind: FaultKind::Protocol { code, message },
            })
            .await;
    }

    fn complete_close(&self) {
        if let Some(tx) = self.close_waiter.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Allocates the lowest free channel id, never exceeding channel-max
    /// and never reusing the id of a live channel
    pub(crate) fn allocate_channel(self: &Arc<Self>) -> Result<Arc<ChannelShared>, Error> {
        let channel_max = self
            .wire
            .lock()
            .as_ref()
            .map(|wire| wire.channel_max)
            .unwrap_or(0);
        let mut channels = self.channels.lock();
        let entry = channels.vacant_entry();
        let id = entry.key() as u32 + 1;
        if id > u32::from(u16::MAX) || (channel_max != 0 && id > u32::from(channel_max)) {
            return Err(Error::ChannelMaxReached);
        }
        let shared = Arc::new(ChannelShared::new(
            id as u16,
            Arc::downgrade(self),
            self.config.consumer_dispatch_concurrency,
        ));
        entry.insert(Arc::clone(&shared));
        Ok(shared)
    }

    pub(crate) fn release_channel(&self, id: u16) {
        let mut channels = self.channels.lock();
        let index = usize::from(id) - 1;
        if channels.contains(index) {
            channels.remove(index);
        }
    }

    pub(crate) fn live_channels(&self) -> Vec<Arc<ChannelShared>> {
        self.channels
            .lock()
            .iter()
            .map(|(_, shared)| Arc::clone(shared))
            .collect()
    }

    /// Opens a channel without the open-state gate; recovery uses this
    /// while the connection is still `Recovering`
    pub(crate) async fn open_channel_ungated(self: &Arc<Self>) -> Result<Channel, Error> {
        let shared = self.allocate_channel()?;
        let inbound = shared.reset_inbound(self.config.channel_queue_capacity);
        spawn_dispatcher(
            Arc::clone(&shared),
            inbound,
            self.config.max_inbound_message_body_size,
        );
        match shared
            .rpc(Method::ChannelOpen(channel_methods::Open))
            .await
        {
            Ok(RpcReply::Method(Method::ChannelOpenOk(_))) => {
                shared.set_state(ChannelState::Open);
                Ok(Channel::from_shared(shared))
            }
            Ok(other) => {
                self.release_channel(shared.id());
                Err(Error::ProtocolViolation(format!(
                    "unexpected channel.open reply: {other:?}"
                )))
            }
            Err(err) => {
                self.release_channel(shared.id());
                Err(err)
            }
        }
    }

    /// Terminal shutdown: fails every channel and pending operation
    pub(crate) fn finish_shutdown(&self, reason: CloseReason) {
        {
            let mut stored = self.close_reason.lock();
            if stored.is_none() {
                *stored = Some(reason.clone());
            }
        }
        self.set_status(ConnectionStatus::Closed);
        self.teardown_wire();
        for shared in self.live_channels() {
            shared.on_connection_closed(&reason);
        }
        self.channels.lock().clear();
        self.complete_close();
    }
}

/// A connection to an AMQP 0-9-1 broker
///
/// Cheap to clone; all clones share the same underlying connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("status", &self.inner.status())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Dials the configured endpoints, performs the handshake, and starts
    /// the connection runtime
    pub async fn open(config: ConnectionConfig) -> Result<Self, ConnectError> {
        let resolver: Arc<dyn EndpointResolver> = config
            .resolver
            .clone()
            .unwrap_or_else(|| Arc::new(ShuffledResolver::new(config.endpoints.clone())));
        let (fault_tx, fault_rx) = mpsc::channel(16);
        let inner = Arc::new(ConnectionInner::new(config, fault_tx));

        let (transport, negotiated) =
            select_one(&*resolver, |endpoint| dial(&inner.config, endpoint)).await?;
        inner.install_transport(transport, &negotiated);
        inner.set_status(ConnectionStatus::Open);

        tokio::spawn(recovery::supervise(Arc::clone(&inner), fault_rx, resolver));
        Ok(Self { inner })
    }

    /// Shorthand for opening from an `amqp://` / `amqps://` URI
    pub async fn open_uri(uri: &str) -> Result<Self, ConnectError> {
        Self::open(ConnectionConfig::from_uri(uri)?).await
    }

    /// Performs the handshake over a caller-established stream, e.g. a TLS
    /// stream from an external connector
    ///
    /// Automatic recovery can only re-dial plain-TCP endpoints; with no
    /// endpoints configured a transport drop on a caller-supplied stream
    /// is terminal.
    pub async fn open_with_stream<Io>(io: Io, config: ConnectionConfig) -> Result<Self, ConnectError>
    where
        Io: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (fault_tx, fault_rx) = mpsc::channel(16);
        let inner = Arc::new(ConnectionInner::new(config, fault_tx));

        let transport = Transport::negotiate(io)
            .await
            .map_err(HandshakeError::from)?;
        let (transport, negotiated) = handshake::handshake(transport, &inner.config).await?;
        inner.install_transport(transport, &negotiated);
        inner.set_status(ConnectionStatus::Open);

        let resolver: Arc<dyn EndpointResolver> = inner
            .config
            .resolver
            .clone()
            .unwrap_or_else(|| Arc::new(ShuffledResolver::new(inner.config.endpoints.clone())));
        tokio::spawn(recovery::supervise(Arc::clone(&inner), fault_rx, resolver));
        Ok(Self { inner })
    }

    /// Opens a new channel with the lowest free id
    pub async fn open_channel(&self) -> Result<Channel, Error> {
        self.inner.wait_until_open().await?;
        self.inner.open_channel_ungated().await
    }

    /// Orderly close: closes every channel, then the connection
    ///
    /// Publisher confirms still outstanding when the channels close fail
    /// with [`Error::OperationInterrupted`]; none are left pending.
    pub async fn close(&self) -> Result<(), Error> {
        if self.inner.status() == ConnectionStatus::Closed {
            return Ok(());
        }
        self.inner.set_status(ConnectionStatus::Closing);

        for shared in self.inner.live_channels() {
            let _ = Channel::from_shared(shared).close_ungated().await;
        }

        let (tx, rx) = oneshot::channel();
        *self.inner.close_waiter.lock() = Some(tx);
        let close = connection::Close {
            reply_code: reply_code::REPLY_SUCCESS,
            reply_text: "Goodbye".try_into().expect("static text fits"),
            class_id: 0,
            method_id: 0,
        };
        let sent = self
            .inner
            .send_command(WriteCommand::Frames(vec![Frame::method(
                0,
                Method::ConnectionClose(close),
            )]))
            .await;
        if sent.is_ok() {
            // server close-ok, or timeout and shut down regardless
            let _ = tokio::time::timeout(self.inner.config.continuation_timeout, rx).await;
        }

        self.inner.finish_shutdown(CloseReason {
            reply_code: reply_code::REPLY_SUCCESS,
            reply_text: "Goodbye".into(),
            class_id: 0,
            method_id: 0,
        });
        Ok(())
    }

    /// Current lifecycle status
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status()
    }

    /// Whether the connection is open (not recovering, closing, or closed)
    pub fn is_open(&self) -> bool {
        self.inner.status() == ConnectionStatus::Open
    }

    /// Watches lifecycle transitions, including recovery
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.watch_status()
    }

    /// Watches `connection.blocked` / `connection.unblocked`
    ///
    /// The library surfaces the event and keeps publishing; pausing
    /// publishers while blocked is the application's call.
    pub fn watch_blocked(&self) -> watch::Receiver<bool> {
        self.inner.blocked_tx.subscribe()
    }

    /// Server properties from `connection.start`
    pub fn server_properties(&self) -> FieldTable {
        self.inner.server_properties.lock().clone()
    }

    /// Why the connection closed, if it has
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason.lock().clone()
    }
}

/// Dials one endpoint: TCP connect with timeout, then the handshake
pub(crate) async fn dial(
    config: &ConnectionConfig,
    endpoint: Endpoint,
) -> Result<(Transport<TcpStream>, Negotiated), HandshakeError> {
    if endpoint.tls {
        return Err(HandshakeError::Io(io::Error::new(
            io::ErrorKind::Unsupported,
            "TLS endpoints need an external connector; use Connection::open_with_stream",
        )));
    }
    let connect = TcpStream::connect((endpoint.host.as_str(), endpoint.port));
    let stream = tokio::time::timeout(config.connection_timeout, connect)
        .await
        .map_err(|_| {
            HandshakeError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "TCP connect timed out",
            ))
        })??;
    stream.set_nodelay(true)?;
    let transport = Transport::negotiate(stream).await?;
    handshake::handshake(transport, config).await
}
