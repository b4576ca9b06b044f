//! Channels: the unit of multiplexing and the home of every AMQP operation
//!
//! A channel carries at most one outstanding RPC continuation; issuing a
//! second RPC before the first resolves fails fast with
//! [`Error::RpcAlreadyPending`]. Body delivery and out-of-band events do
//! not occupy the RPC slot. A soft server error closes only the channel
//! and the instance is terminal afterwards; callers allocate a new one.

use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use coney_codec::constants::reply_code;
use coney_codec::method::{basic, channel as channel_methods, confirm, exchange, queue, CLASS_BASIC};
use coney_codec::{
    content_frames, BasicProperties, ContentHeader, FieldTable, Frame, FramePayload, Method,
    ShortString,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use crate::confirms::{ConfirmHandle, ConfirmOutcome, ConfirmTracker, Confirmation};
use crate::connection::engine::WriteCommand;
use crate::connection::ConnectionInner;
use crate::consumer::{
    ConsumeOptions, ConsumerEntry, ConsumerRegistry, DeliveryHandler, ReturnedMessage,
};
use crate::content::AssembledMessage;
use crate::error::{CloseReason, Error};
use crate::recovery::{BindingKind, RecordedBinding, RecordedExchange, RecordedQueue};

mod dispatcher;
pub(crate) use dispatcher::spawn_dispatcher;

const RETURN_QUEUE_CAPACITY: usize = 32;

/// Lifecycle state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ChannelState {
    Opening,
    Open,
    Closing,
    Closed,
}

/// What an RPC continuation resolves to
#[derive(Debug)]
pub(crate) enum RpcReply {
    /// A plain reply method
    Method(Method),
    /// `basic.get-ok` with its assembled content
    GetOk(AssembledMessage),
    /// `basic.get-empty`
    GetEmpty,
}

/// Consumer registration staged while `basic.consume` is in flight; the
/// dispatcher completes it on `consume-ok`, before any delivery for the
/// new tag can be processed
pub(crate) enum PendingConsumer {
    New {
        queue: String,
        options: ConsumeOptions,
        handler: DeliveryHandler,
        /// `None` asks the server to generate the tag
        user_tag: Option<String>,
        concurrency: usize,
        queue_capacity: usize,
    },
    /// Recovery re-registering an existing consumer under a fresh wire tag
    Rebind { entry: ConsumerEntry },
}

impl fmt::Debug for PendingConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New { queue, .. } => f.debug_struct("New").field("queue", queue).finish_non_exhaustive(),
            Self::Rebind { entry } => f.debug_struct("Rebind").field("entry", entry).finish(),
        }
    }
}

pub(crate) struct ChannelShared {
    conn: Weak<ConnectionInner>,
    id: AtomicU16,
    state: Mutex<ChannelState>,
    rpc_slot: Mutex<Option<oneshot::Sender<Result<RpcReply, Error>>>>,
    pub(crate) confirms: Arc<ConfirmTracker>,
    pub(crate) consumers: Mutex<ConsumerRegistry>,
    pub(crate) recorded_qos: Mutex<Option<basic::Qos>>,
    pub(crate) pending_consumer: Mutex<Option<PendingConsumer>>,
    flow_tx: watch::Sender<bool>,
    pub(crate) close_reason: Mutex<Option<CloseReason>>,
    returns_tx: mpsc::Sender<ReturnedMessage>,
    returns_rx: Mutex<Option<mpsc::Receiver<ReturnedMessage>>>,
    inbound_tx: Mutex<Option<mpsc::Sender<FramePayload>>>,
    pub(crate) dispatch_concurrency: usize,
}

impl fmt::Debug for ChannelShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelShared")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ChannelShared {
    pub(crate) fn new(
        id: u16,
        conn: Weak<ConnectionInner>,
        dispatch_concurrency: usize,
    ) -> Self {
        let (returns_tx, returns_rx) = mpsc::channel(RETURN_QUEUE_CAPACITY);
        let (flow_tx, _) = watch::channel(true);
        Self {
            conn,
            id: AtomicU16::new(id),
            state: Mutex::new(ChannelState::Opening),
            rpc_slot: Mutex::new(None),
            confirms: Arc::new(ConfirmTracker::new()),
            consumers: Mutex::new(ConsumerRegistry::default()),
            recorded_qos: Mutex::new(None),
            pending_consumer: Mutex::new(None),
            flow_tx,
            close_reason: Mutex::new(None),
            returns_tx,
            returns_rx: Mutex::new(Some(returns_rx)),
            inbound_tx: Mutex::new(None),
            dispatch_concurrency,
        }
    }

    pub(crate) fn id(&self) -> u16 {
        self.id.load(Ordering::SeqCst)
    }

    pub(crate) fn set_id(&self, id: u16) {
        self.id.store(id, Ordering::SeqCst);
    }

    pub(crate) fn state(&self) -> ChannelState {
        *self.state.lock()
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        *self.state.lock() = state;
    }

    pub(crate) fn conn(&self) -> Result<Arc<ConnectionInner>, Error> {
        self.conn.upgrade().ok_or(Error::ConnectionClosed {
            reply_code: reply_code::REPLY_SUCCESS,
            reply_text: "connection dropped".into(),
        })
    }

    pub(crate) fn channel_closed_error(&self) -> Error {
        self.close_reason
            .lock()
            .as_ref()
            .map(CloseReason::channel_error)
            .unwrap_or(Error::OperationInterrupted)
    }

    /// Replaces the inbound dispatcher queue; done on open and again on
    /// every recovery rebind
    pub(crate) fn reset_inbound(&self, capacity: usize) -> mpsc::Receiver<FramePayload> {
        let (tx, rx) = mpsc::channel(capacity);
        *self.inbound_tx.lock() = Some(tx);
        rx
    }

    pub(crate) fn inbound_sender(&self) -> Option<mpsc::Sender<FramePayload>> {
        self.inbound_tx.lock().clone()
    }

    /// Submits frames for this channel in submission order
    pub(crate) async fn send(&self, frames: Vec<Frame>) -> Result<(), Error> {
        self.conn()?.send_command(WriteCommand::Frames(frames)).await
    }

    /// Submits a publish; the writer assigns the confirm sequence
    pub(crate) async fn send_publish(
        &self,
        frames: Vec<Frame>,
        handle: Option<ConfirmHandle>,
    ) -> Result<(), Error> {
        self.conn()?
            .send_command(WriteCommand::Publish {
                frames,
                tracker: Arc::clone(&self.confirms),
                handle,
            })
            .await
    }

    /// Issues an RPC and awaits its correlated reply
    ///
    /// A timed-out continuation leaves the slot armed: the server will
    /// still reply and the dispatcher releases the slot when it does,
    /// discarding the late reply.
    pub(crate) async fn rpc(&self, method: Method) -> Result<RpcReply, Error> {
        if self.state() == ChannelState::Closed {
            return Err(self.channel_closed_error());
        }

        let (tx, rx) = oneshot::channel();
        {
            let mut slot = self.rpc_slot.lock();
            if slot.is_some() {
                return Err(Error::RpcAlreadyPending);
            }
            *slot = Some(tx);
        }

        let frame = Frame::method(self.id(), method);
        if let Err(err) = self.send(vec![frame]).await {
            // nothing went on the wire; release the slot ourselves
            self.rpc_slot.lock().take();
            return Err(err);
        }

        let timeout = self.conn()?.config.continuation_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::OperationInterrupted),
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Hands the reply to whoever is waiting; late replies are discarded
    pub(crate) fn resolve_rpc(&self, result: Result<RpcReply, Error>) {
        if let Some(tx) = self.rpc_slot.lock().take() {
            let _ = tx.send(result);
        }
    }

    pub(crate) fn set_flow(&self, active: bool) {
        self.flow_tx.send_replace(active);
    }

    /// Parks publishers while the server has paused the channel
    pub(crate) async fn wait_for_flow(&self) -> Result<(), Error> {
        let mut flow = self.flow_tx.subscribe();
        loop {
            if self.state() == ChannelState::Closed {
                return Err(self.channel_closed_error());
            }
            if *flow.borrow_and_update() {
                return Ok(());
            }
            if flow.changed().await.is_err() {
                return Err(self.channel_closed_error());
            }
        }
    }

    pub(crate) fn push_return(&self, message: ReturnedMessage) {
        // dropped when nobody reads returned messages
        let _ = self.returns_tx.try_send(message);
    }

    /// Capacity for a new consumer's delivery queue: the prefetch window
    /// set by `basic.qos` on this channel, or a fixed default while no
    /// window (or an unlimited one) is in effect
    pub(crate) fn delivery_queue_capacity(&self) -> usize {
        match *self.recorded_qos.lock() {
            Some(qos) if qos.prefetch_count > 0 => usize::from(qos.prefetch_count),
            _ => crate::config::DEFAULT_CONSUMER_QUEUE_CAPACITY,
        }
    }

    /// Terminal close of this channel instance
    pub(crate) fn finalize_closed(&self, reason: CloseReason, fail_confirms: bool) {
        {
            let mut state = self.state.lock();
            if *state == ChannelState::Closed {
                return;
            }
            *state = ChannelState::Closed;
        }
        *self.close_reason.lock() = Some(reason.clone());
        if let Some(tx) = self.rpc_slot.lock().take() {
            let _ = tx.send(Err(reason.channel_error()));
        }
        if fail_confirms {
            self.confirms.fail_outstanding(|| Error::OperationInterrupted);
        }
        self.consumers.lock().cancel_all();
        self.pending_consumer.lock().take();
        // releases any parked publisher; it observes Closed and errors out
        self.flow_tx.send_replace(true);
        *self.inbound_tx.lock() = None;
        if let Some(conn) = self.conn.upgrade() {
            conn.release_channel(self.id());
        }
    }

    /// The connection went away for good
    pub(crate) fn on_connection_closed(&self, reason: &CloseReason) {
        {
            let mut state = self.state.lock();
            if *state == ChannelState::Closed {
                return;
            }
            *state = ChannelState::Closed;
        }
        *self.close_reason.lock() = Some(reason.clone());
        if let Some(tx) = self.rpc_slot.lock().take() {
            let _ = tx.send(Err(Error::OperationInterrupted));
        }
        self.confirms.fail_outstanding(|| Error::OperationInterrupted);
        self.consumers.lock().cancel_all();
        self.pending_consumer.lock().take();
        self.flow_tx.send_replace(true);
        *self.inbound_tx.lock() = None;
    }

    /// The transport dropped but recovery will rebind this channel:
    /// in-flight RPCs abort, confirms and consumers survive for replay
    pub(crate) fn on_involuntary_drop(&self) {
        if let Some(tx) = self.rpc_slot.lock().take() {
            let _ = tx.send(Err(Error::OperationInterrupted));
        }
        *self.inbound_tx.lock() = None;
    }
}

/// Options for `exchange.declare`
#[derive(Debug, Clone, Default)]
pub struct ExchangeDeclareOptions {
    /// Assert existence without creating
    pub passive: bool,
    /// Survive a broker restart
    pub durable: bool,
    /// Delete when no longer used
    pub auto_delete: bool,
    /// Only reachable through exchange-to-exchange bindings
    pub internal: bool,
    /// Implementation-specific arguments
    pub arguments: FieldTable,
}

/// Options for `queue.declare`
#[derive(Debug, Clone, Default)]
pub struct QueueDeclareOptions {
    /// Assert existence without creating
    pub passive: bool,
    /// Survive a broker restart
    pub durable: bool,
    /// Restrict to this connection and delete with it
    pub exclusive: bool,
    /// Delete when the last consumer cancels
    pub auto_delete: bool,
    /// Implementation-specific arguments, e.g. TTLs and limits
    pub arguments: FieldTable,
}

/// Options for `queue.delete`
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueDeleteOptions {
    /// Only delete if the queue has no consumers
    pub if_unused: bool,
    /// Only delete if the queue is empty
    pub if_empty: bool,
}

/// Options for `basic.publish`
#[derive(Debug, Clone, Copy, Default)]
pub struct PublishOptions {
    /// Return the message if it cannot be routed to any queue
    pub mandatory: bool,
    /// Return the message if it cannot be delivered immediately
    pub immediate: bool,
}

/// Exchange type for `exchange.declare`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Route on exact routing-key match
    Direct,
    /// Route to every bound queue
    Fanout,
    /// Route on pattern match against dotted routing keys
    Topic,
    /// Route on header matching
    Headers,
    /// A plugin-provided type, e.g. `x-delayed-message`
    Custom(String),
}

impl ExchangeKind {
    /// Wire name of the exchange type
    pub fn as_str(&self) -> &str {
        match self {
            Self::Direct => "direct",
            Self::Fanout => "fanout",
            Self::Topic => "topic",
            Self::Headers => "headers",
            Self::Custom(name) => name,
        }
    }
}

/// Reply of `queue.declare`
#[derive(Debug, Clone)]
pub struct QueueInfo {
    /// Queue name, server-generated if the declare left it empty
    pub name: String,
    /// Messages currently queued
    pub message_count: u32,
    /// Active consumers
    pub consumer_count: u32,
}

/// A message fetched with `basic.get`
#[derive(Debug, Clone)]
pub struct GetMessage {
    /// Server-assigned delivery tag for acking
    pub delivery_tag: u64,
    /// Whether the message was delivered before
    pub redelivered: bool,
    /// Exchange the message was published to
    pub exchange: String,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Messages remaining in the queue
    pub message_count: u32,
    /// Message properties
    pub properties: BasicProperties,
    /// Message body
    pub body: Bytes,
}

/// A logical channel multiplexed over one connection
///
/// Cheap to clone; all clones share the same channel state.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.id())
            .field("state", &self.shared.state())
            .finish_non_exhaustive()
    }
}

impl Channel {
    pub(crate) fn from_shared(shared: Arc<ChannelShared>) -> Self {
        Self { shared }
    }

    /// The channel id currently bound; may change across recovery
    pub fn id(&self) -> u16 {
        self.shared.id()
    }

    /// Whether the channel is usable
    pub fn is_open(&self) -> bool {
        self.shared.state() == ChannelState::Open
    }

    /// Why the channel closed, if it has
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.shared.close_reason.lock().clone()
    }

    /// The sequence number the next confirmed publish will get
    pub fn next_publish_seq(&self) -> u64 {
        self.shared.confirms.next_publish_seq()
    }

    /// Takes the stream of `basic.return`ed messages; single take
    pub fn returned_messages(&self) -> Option<mpsc::Receiver<ReturnedMessage>> {
        self.shared.returns_rx.lock().take()
    }

    /// Gates a user operation on connection and channel state, waiting
    /// out a recovery in progress
    async fn ready(&self) -> Result<Arc<ConnectionInner>, Error> {
        let conn = self.shared.conn()?;
        conn.wait_until_open().await?;
        match self.shared.state() {
            ChannelState::Open | ChannelState::Opening => Ok(conn),
            _ => Err(self.shared.channel_closed_error()),
        }
    }

    /// Like [`Self::ready`] but fails instead of waiting; used for acks,
    /// whose delivery tags do not survive a recovery
    fn ready_now(&self) -> Result<Arc<ConnectionInner>, Error> {
        let conn = self.shared.conn()?;
        if self.shared.state() != ChannelState::Open {
            return Err(self.shared.channel_closed_error());
        }
        Ok(conn)
    }

    /// Declares an exchange and records it for topology recovery
    pub async fn exchange_declare(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeDeclareOptions,
    ) -> Result<(), Error> {
        let conn = self.ready().await?;
        let declare = exchange::Declare {
            exchange: short(name)?,
            kind: short(kind.as_str())?,
            passive: options.passive,
            durable: options.durable,
            auto_delete: options.auto_delete,
            internal: options.internal,
            no_wait: false,
            arguments: options.arguments.clone(),
        };
        expect_reply(
            self.shared.rpc(Method::ExchangeDeclare(declare)).await?,
            |m| matches!(m, Method::ExchangeDeclareOk),
        )?;
        if !options.passive {
            conn.topology.lock().record_exchange(RecordedExchange {
                name: name.to_string(),
                kind: kind.as_str().to_string(),
                durable: options.durable,
                auto_delete: options.auto_delete,
                internal: options.internal,
                arguments: options.arguments,
            });
        }
        Ok(())
    }

    /// Deletes an exchange and prunes it from the topology record
    pub async fn exchange_delete(&self, name: &str, if_unused: bool) -> Result<(), Error> {
        let conn = self.ready().await?;
        let delete = exchange::Delete {
            exchange: short(name)?,
            if_unused,
            no_wait: false,
        };
        expect_reply(self.shared.rpc(Method::ExchangeDelete(delete)).await?, |m| {
            matches!(m, Method::ExchangeDeleteOk)
        })?;
        conn.topology.lock().remove_exchange(name);
        Ok(())
    }

    /// Binds an exchange to an exchange
    pub async fn exchange_bind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), Error> {
        let conn = self.ready().await?;
        let bind = exchange::Bind {
            destination: short(destination)?,
            source: short(source)?,
            routing_key: short(routing_key)?,
            no_wait: false,
            arguments: arguments.clone(),
        };
        expect_reply(self.shared.rpc(Method::ExchangeBind(bind)).await?, |m| {
            matches!(m, Method::ExchangeBindOk)
        })?;
        conn.topology.lock().record_binding(RecordedBinding {
            kind: BindingKind::ExchangeToExchange,
            destination: destination.to_string(),
            source: source.to_string(),
            routing_key: routing_key.to_string(),
            arguments,
        });
        Ok(())
    }

    /// Unbinds an exchange from an exchange
    pub async fn exchange_unbind(
        &self,
        destination: &str,
        source: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), Error> {
        let conn = self.ready().await?;
        let unbind = exchange::Unbind {
            destination: short(destination)?,
            source: short(source)?,
            routing_key: short(routing_key)?,
            no_wait: false,
            arguments: arguments.clone(),
        };
        expect_reply(self.shared.rpc(Method::ExchangeUnbind(unbind)).await?, |m| {
            matches!(m, Method::ExchangeUnbindOk)
        })?;
        conn.topology.lock().remove_binding(
            BindingKind::ExchangeToExchange,
            destination,
            source,
            routing_key,
        );
        Ok(())
    }

    /// Declares a queue; an empty name asks the server to generate one
    pub async fn queue_declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
    ) -> Result<QueueInfo, Error> {
        let conn = self.ready().await?;
        let declare = queue::Declare {
            queue: short(name)?,
            passive: options.passive,
            durable: options.durable,
            exclusive: options.exclusive,
            auto_delete: options.auto_delete,
            no_wait: false,
            arguments: options.arguments.clone(),
        };
        let reply = self.shared.rpc(Method::QueueDeclare(declare)).await?;
        let ok = match reply {
            RpcReply::Method(Method::QueueDeclareOk(ok)) => ok,
            other => return Err(unexpected_reply(other)),
        };
        let info = QueueInfo {
            name: ok.queue.to_string(),
            message_count: ok.message_count,
            consumer_count: ok.consumer_count,
        };
        if !options.passive {
            conn.topology.lock().record_queue(RecordedQueue {
                name: info.name.clone(),
                durable: options.durable,
                exclusive: options.exclusive,
                auto_delete: options.auto_delete,
                arguments: options.arguments,
                server_named: name.is_empty(),
            });
        }
        Ok(info)
    }

    /// Binds a queue to an exchange
    pub async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), Error> {
        let conn = self.ready().await?;
        let bind = queue::Bind {
            queue: short(queue)?,
            exchange: short(exchange)?,
            routing_key: short(routing_key)?,
            no_wait: false,
            arguments: arguments.clone(),
        };
        expect_reply(self.shared.rpc(Method::QueueBind(bind)).await?, |m| {
            matches!(m, Method::QueueBindOk)
        })?;
        conn.topology.lock().record_binding(RecordedBinding {
            kind: BindingKind::ExchangeToQueue,
            destination: queue.to_string(),
            source: exchange.to_string(),
            routing_key: routing_key.to_string(),
            arguments,
        });
        Ok(())
    }

    /// Unbinds a queue from an exchange
    pub async fn queue_unbind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
        arguments: FieldTable,
    ) -> Result<(), Error> {
        let conn = self.ready().await?;
        let unbind = queue::Unbind {
            queue: short(queue)?,
            exchange: short(exchange)?,
            routing_key: short(routing_key)?,
            arguments,
        };
        expect_reply(self.shared.rpc(Method::QueueUnbind(unbind)).await?, |m| {
            matches!(m, Method::QueueUnbindOk)
        })?;
        conn.topology
            .lock()
            .remove_binding(BindingKind::ExchangeToQueue, queue, exchange, routing_key);
        Ok(())
    }

    /// Discards all messages in a queue, returning how many were dropped
    pub async fn queue_purge(&self, queue: &str) -> Result<u32, Error> {
        self.ready().await?;
        let purge = queue::Purge {
            queue: short(queue)?,
            no_wait: false,
        };
        match self.shared.rpc(Method::QueuePurge(purge)).await? {
            RpcReply::Method(Method::QueuePurgeOk(ok)) => Ok(ok.message_count),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Deletes a queue and prunes it, bindings included, from the
    /// topology record
    pub async fn queue_delete(
        &self,
        queue: &str,
        options: QueueDeleteOptions,
    ) -> Result<u32, Error> {
        let conn = self.ready().await?;
        let delete = queue::Delete {
            queue: short(queue)?,
            if_unused: options.if_unused,
            if_empty: options.if_empty,
            no_wait: false,
        };
        match self.shared.rpc(Method::QueueDelete(delete)).await? {
            RpcReply::Method(Method::QueueDeleteOk(ok)) => {
                conn.topology.lock().remove_queue(queue);
                Ok(ok.message_count)
            }
            other => Err(unexpected_reply(other)),
        }
    }

    /// Bounds unacknowledged deliveries on this channel
    ///
    /// The prefetch window also sizes the delivery queues of consumers
    /// started afterwards on this channel.
    pub async fn basic_qos(&self, prefetch_count: u16, global: bool) -> Result<(), Error> {
        self.ready().await?;
        let qos = basic::Qos {
            prefetch_size: 0,
            prefetch_count,
            global,
        };
        expect_reply(self.shared.rpc(Method::BasicQos(qos)).await?, |m| {
            matches!(m, Method::BasicQosOk)
        })?;
        *self.shared.recorded_qos.lock() = Some(qos);
        Ok(())
    }

    /// Puts the channel into publisher-confirm mode
    pub async fn confirm_select(&self) -> Result<(), Error> {
        self.ready().await?;
        expect_reply(
            self.shared
                .rpc(Method::ConfirmSelect(confirm::Select { no_wait: false }))
                .await?,
            |m| matches!(m, Method::ConfirmSelectOk),
        )
    }

    /// Publishes a message
    ///
    /// In confirm mode the returned [`Confirmation`] resolves when the
    /// server acks or nacks; otherwise it resolves immediately. During a
    /// recovery the call waits until the connection is rebound.
    pub async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        options: PublishOptions,
        properties: BasicProperties,
        body: Bytes,
    ) -> Result<Confirmation, Error> {
        let conn = self.ready().await?;
        self.shared.wait_for_flow().await?;

        let id = self.shared.id();
        let publish = basic::Publish {
            exchange: short(exchange)?,
            routing_key: short(routing_key)?,
            mandatory: options.mandatory,
            immediate: options.immediate,
        };
        let header = ContentHeader {
            class_id: CLASS_BASIC,
            body_size: body.len() as u64,
            properties,
        };
        let mut frames = vec![Frame::method(id, Method::BasicPublish(publish))];
        frames.extend(content_frames(id, header, body, conn.frame_max() as usize));

        if self.shared.confirms.is_enabled() {
            let (confirmation, handle) = Confirmation::pending();
            self.shared.send_publish(frames, Some(handle)).await?;
            Ok(confirmation)
        } else {
            self.shared.send_publish(frames, None).await?;
            Ok(Confirmation::resolved(ConfirmOutcome::Ack))
        }
    }

    /// Starts a consumer; deliveries flow to `handler` on the channel's
    /// dispatch concurrency. Returns the user-visible consumer tag.
    pub async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        options: ConsumeOptions,
        handler: DeliveryHandler,
    ) -> Result<String, Error> {
        self.ready().await?;
        let consume = basic::Consume {
            queue: short(queue)?,
            consumer_tag: short(consumer_tag)?,
            no_local: options.no_local,
            no_ack: options.no_ack,
            exclusive: options.exclusive,
            no_wait: false,
            arguments: options.arguments.clone(),
        };
        *self.shared.pending_consumer.lock() = Some(PendingConsumer::New {
            queue: queue.to_string(),
            options,
            handler,
            user_tag: (!consumer_tag.is_empty()).then(|| consumer_tag.to_string()),
            concurrency: self.shared.dispatch_concurrency,
            queue_capacity: self.shared.delivery_queue_capacity(),
        });

        match self.shared.rpc(Method::BasicConsume(consume)).await {
            Ok(RpcReply::Method(Method::BasicConsumeOk(ok))) => {
                if consumer_tag.is_empty() {
                    Ok(ok.consumer_tag.to_string())
                } else {
                    Ok(consumer_tag.to_string())
                }
            }
            Ok(other) => {
                self.shared.pending_consumer.lock().take();
                Err(unexpected_reply(other))
            }
            Err(err) => {
                self.shared.pending_consumer.lock().take();
                Err(err)
            }
        }
    }

    /// Cancels a consumer by its user-visible tag
    pub async fn basic_cancel(&self, consumer_tag: &str) -> Result<(), Error> {
        self.ready().await?;
        let wire_tag = self
            .shared
            .consumers
            .lock()
            .wire_tag_of(consumer_tag)
            .unwrap_or_else(|| consumer_tag.to_string());
        let cancel = basic::Cancel {
            consumer_tag: short(&wire_tag)?,
            no_wait: false,
        };
        expect_reply(self.shared.rpc(Method::BasicCancel(cancel)).await?, |m| {
            matches!(m, Method::BasicCancelOk(_))
        })
    }

    /// Synchronously fetches one message; `None` when the queue is empty
    pub async fn basic_get(&self, queue: &str, no_ack: bool) -> Result<Option<GetMessage>, Error> {
        self.ready().await?;
        let get = basic::Get {
            queue: short(queue)?,
            no_ack,
        };
        match self.shared.rpc(Method::BasicGet(get)).await? {
            RpcReply::GetOk(message) => {
                let ok = match &message.method {
                    Method::BasicGetOk(ok) => ok.clone(),
                    _ => return Err(unexpected_reply(RpcReply::GetOk(message))),
                };
                Ok(Some(GetMessage {
                    delivery_tag: ok.delivery_tag,
                    redelivered: ok.redelivered,
                    exchange: ok.exchange.to_string(),
                    routing_key: ok.routing_key.to_string(),
                    message_count: ok.message_count,
                    properties: message.properties,
                    body: message.body,
                }))
            }
            RpcReply::GetEmpty => Ok(None),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Acknowledges a delivery; cumulative when `multiple`
    pub async fn basic_ack(&self, delivery_tag: u64, multiple: bool) -> Result<(), Error> {
        let _conn = self.ready_now()?;
        let ack = basic::Ack {
            delivery_tag,
            multiple,
        };
        self.shared
            .send(vec![Frame::method(self.shared.id(), Method::BasicAck(ack))])
            .await
    }

    /// Negatively acknowledges one or many deliveries
    pub async fn basic_nack(
        &self,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    ) -> Result<(), Error> {
        let _conn = self.ready_now()?;
        let nack = basic::Nack {
            delivery_tag,
            multiple,
            requeue,
        };
        self.shared
            .send(vec![Frame::method(self.shared.id(), Method::BasicNack(nack))])
            .await
    }

    /// Rejects a single delivery
    pub async fn basic_reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error> {
        let _conn = self.ready_now()?;
        let reject = basic::Reject {
            delivery_tag,
            requeue,
        };
        self.shared
            .send(vec![Frame::method(
                self.shared.id(),
                Method::BasicReject(reject),
            )])
            .await
    }

    /// Asks the server to redeliver unacknowledged messages
    pub async fn basic_recover(&self, requeue: bool) -> Result<(), Error> {
        self.ready().await?;
        expect_reply(
            self.shared
                .rpc(Method::BasicRecover(basic::Recover { requeue }))
                .await?,
            |m| matches!(m, Method::BasicRecoverOk),
        )
    }

    /// Client-initiated `channel.flow`; returns the state the server
    /// settled on
    pub async fn flow(&self, active: bool) -> Result<bool, Error> {
        self.ready().await?;
        match self
            .shared
            .rpc(Method::ChannelFlow(channel_methods::Flow { active }))
            .await?
        {
            RpcReply::Method(Method::ChannelFlowOk(ok)) => Ok(ok.active),
            other => Err(unexpected_reply(other)),
        }
    }

    /// Orderly channel close; outstanding confirms fail with
    /// [`Error::OperationInterrupted`]
    pub async fn close(&self) -> Result<(), Error> {
        self.close_ungated().await
    }

    /// Close without the open-state gate; connection close and recovery
    /// paths use this while the connection is not `Open`
    pub(crate) async fn close_ungated(&self) -> Result<(), Error> {
        match self.shared.state() {
            ChannelState::Closed | ChannelState::Closing => return Ok(()),
            _ => {}
        }
        self.shared.set_state(ChannelState::Closing);
        let close = channel_methods::Close {
            reply_code: reply_code::REPLY_SUCCESS,
            reply_text: "Goodbye".try_into().expect("static text fits"),
            class_id: 0,
            method_id: 0,
        };
        if self.shared.rpc(Method::ChannelClose(close)).await.is_err() {
            // no close-ok is coming; finalize locally
            self.shared.finalize_closed(
                CloseReason {
                    reply_code: reply_code::REPLY_SUCCESS,
                    reply_text: "Goodbye".into(),
                    class_id: 0,
                    method_id: 0,
                },
                true,
            );
        }
        Ok(())
    }

    pub(crate) fn shared(&self) -> &Arc<ChannelShared> {
        &self.shared
    }
}

fn short(s: &str) -> Result<ShortString, Error> {
    Ok(ShortString::try_from(s)?)
}

fn expect_reply(reply: RpcReply, matches: impl Fn(&Method) -> bool) -> Result<(), Error> {
    match reply {
        RpcReply::Method(method) if matches(&method) => Ok(()),
        other => Err(unexpected_reply(other)),
    }
}

fn unexpected_reply(reply: RpcReply) -> Error {
    Error::ProtocolViolation(format!("unexpected RPC reply: {reply:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DEFAULT_CONSUMER_QUEUE_CAPACITY;

    #[test]
    fn delivery_queue_capacity_follows_the_prefetch_window() {
        let shared = ChannelShared::new(1, Weak::new(), 1);
        assert_eq!(
            shared.delivery_queue_capacity(),
            DEFAULT_CONSUMER_QUEUE_CAPACITY
        );

        *shared.recorded_qos.lock() = Some(basic::Qos {
            prefetch_size: 0,
            prefetch_count: 10,
            global: false,
        });
        assert_eq!(shared.delivery_queue_capacity(), 10);

        // prefetch 0 means "no limit"; the default bound applies
        *shared.recorded_qos.lock() = Some(basic::Qos {
            prefetch_size: 0,
            prefetch_count: 0,
            global: true,
        });
        assert_eq!(
            shared.delivery_queue_capacity(),
            DEFAULT_CONSUMER_QUEUE_CAPACITY
        );
    }
}
