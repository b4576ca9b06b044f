//! Automatic connection recovery and topology replay
//!
//! A supervisor task per connection watches the engine fault signal. On an
//! involuntary failure (transport IO error, missed heartbeat, hard
//! protocol error) it re-establishes the transport through the endpoint
//! resolver under the existing connection identity, rebinds every live
//! channel to a fresh id, and replays recorded topology in declaration
//! order: exchanges, queues, exchange bindings, queue bindings, QoS,
//! confirm.select, consumers, then unsettled confirm-mode publishes.
//! Voluntary closes are never recovered.

use std::collections::HashMap;
use std::sync::Arc;

use coney_codec::method::{basic, channel as channel_methods, exchange, queue};
use coney_codec::constants::reply_code;
use coney_codec::{FieldTable, Method};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::{
    spawn_dispatcher, Channel, ChannelShared, ChannelState, PendingConsumer, RpcReply,
};
use crate::confirms::PendingPublish;
use crate::connection::engine::{EngineFault, FaultKind, WriteCommand};
use crate::connection::{dial, ConnectionInner, ConnectionStatus};
use crate::endpoint::{select_one, EndpointResolver};
use crate::error::{CloseReason, ConnectError, Error, HandshakeError};

/// An entity in the topology record, as handed to the recovery filter and
/// exception handler
#[derive(Debug, Clone)]
pub enum RecordedEntity {
    /// A declared exchange
    Exchange(RecordedExchange),
    /// A declared queue
    Queue(RecordedQueue),
    /// A binding between exchanges or from an exchange to a queue
    Binding(RecordedBinding),
    /// A registered consumer
    Consumer {
        /// User-visible consumer tag
        tag: String,
        /// Queue the consumer reads from
        queue: String,
    },
}

/// A declared-and-still-live exchange
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedExchange {
    /// Exchange name
    pub name: String,
    /// Exchange type, e.g. `topic`
    pub kind: String,
    /// Declared durable
    pub durable: bool,
    /// Declared auto-delete
    pub auto_delete: bool,
    /// Declared internal
    pub internal: bool,
    /// Declare arguments
    pub arguments: FieldTable,
}

/// A declared-and-still-live queue
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedQueue {
    /// Current queue name; updated when a server-named queue is
    /// re-declared under a fresh generated name
    pub name: String,
    /// Declared durable
    pub durable: bool,
    /// Declared exclusive
    pub exclusive: bool,
    /// Declared auto-delete
    pub auto_delete: bool,
    /// Declare arguments
    pub arguments: FieldTable,
    /// Whether the name was generated by the server
    pub server_named: bool,
}

/// Which kind of binding a [`RecordedBinding`] is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    /// `queue.bind`: exchange → queue
    ExchangeToQueue,
    /// `exchange.bind`: exchange → exchange
    ExchangeToExchange,
}

/// A live binding
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedBinding {
    /// Binding kind
    pub kind: BindingKind,
    /// Destination queue or exchange
    pub destination: String,
    /// Source exchange
    pub source: String,
    /// Routing key
    pub routing_key: String,
    /// Binding arguments
    pub arguments: FieldTable,
}

/// What the recovery exception handler wants done with a failed entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAdvice {
    /// Drop the entity from this replay and continue
    Skip,
    /// Try the entity once more
    Retry,
    /// Abandon recovery; the connection surfaces as permanently closed
    Abort,
}

/// Ordered log of declared-and-still-live entities, surviving transport
/// drops. Appended on successful declare, pruned on explicit delete.
#[derive(Debug, Default)]
pub(crate) struct Topology {
    exchanges: Vec<RecordedExchange>,
    queues: Vec<RecordedQueue>,
    bindings: Vec<RecordedBinding>,
}

impl Topology {
    pub fn record_exchange(&mut self, exchange: RecordedExchange) {
        match self.exchanges.iter_mut().find(|e| e.name == exchange.name) {
            Some(existing) => *existing = exchange,
            None => self.exchanges.push(exchange),
        }
    }

    pub fn remove_exchange(&mut self, name: &str) {
        self.exchanges.retain(|e| e.name != name);
        self.bindings.retain(|b| {
            b.source != name && !(b.kind == BindingKind::ExchangeToExchange && b.destination == name)
        });
    }

    pub fn record_queue(&mut self, queue: RecordedQueue) {
        match self.queues.iter_mut().find(|q| q.name == queue.name) {
            Some(existing) => *existing = queue,
            None => self.queues.push(queue),
        }
    }

    pub fn remove_queue(&mut self, name: &str) {
        self.queues.retain(|q| q.name != name);
        self.bindings
            .retain(|b| !(b.kind == BindingKind::ExchangeToQueue && b.destination == name));
    }

    pub fn record_binding(&mut self, binding: RecordedBinding) {
        if !self.bindings.contains(&binding) {
            self.bindings.push(binding);
        }
    }

    pub fn remove_binding(
        &mut self,
        kind: BindingKind,
        destination: &str,
        source: &str,
        routing_key: &str,
    ) {
        self.bindings.retain(|b| {
            !(b.kind == kind
                && b.destination == destination
                && b.source == source
                && b.routing_key == routing_key)
        });
    }

    /// A fresh server-generated name replaced `old` during replay
    pub fn rename_queue(&mut self, old: &str, new: &str) {
        if let Some(queue) = self.queues.iter_mut().find(|q| q.name == old) {
            queue.name = new.to_string();
        }
        for binding in &mut self.bindings {
            if binding.kind == BindingKind::ExchangeToQueue && binding.destination == old {
                binding.destination = new.to_string();
            }
        }
    }

    fn snapshot(&self) -> (Vec<RecordedExchange>, Vec<RecordedQueue>, Vec<RecordedBinding>) {
        (
            self.exchanges.clone(),
            self.queues.clone(),
            self.bindings.clone(),
        )
    }

    #[cfg(test)]
    pub fn queue_names(&self) -> Vec<&str> {
        self.queues.iter().map(|q| q.name.as_str()).collect()
    }

    #[cfg(test)]
    pub fn exchange_names(&self) -> Vec<&str> {
        self.exchanges.iter().map(|e| e.name.as_str()).collect()
    }

    #[cfg(test)]
    pub fn bindings(&self) -> &[RecordedBinding] {
        &self.bindings
    }
}

enum RecoveryOutcome {
    /// Transient; sleep and try the whole recovery again
    Retry(String),
    /// Abandon; the connection is permanently closed
    Fatal(CloseReason),
}

/// The per-connection supervisor task
pub(crate) async fn supervise(
    conn: Arc<ConnectionInner>,
    mut faults: mpsc::Receiver<EngineFault>,
    resolver: Arc<dyn EndpointResolver>,
) {
    while let Some(fault) = faults.recv().await {
        if fault.generation < conn.current_generation() {
            debug!(generation = fault.generation, "ignoring stale fault");
            continue;
        }
        if conn.is_shutting_down() {
            continue;
        }

        warn!(?fault.kind, "connection failed");
        if !conn.config.automatic_recovery {
            conn.finish_shutdown(reason_of_fault(&fault.kind));
            return;
        }

        conn.set_status(ConnectionStatus::Recovering);
        conn.teardown_wire();
        for shared in conn.live_channels() {
            shared.on_involuntary_drop();
        }

        loop {
            tokio::time::sleep(conn.config.network_recovery_interval).await;
            if conn.is_shutting_down() {
                return;
            }
            match attempt_recovery(&conn, resolver.as_ref()).await {
                Ok(()) => {
                    conn.set_status(ConnectionStatus::Open);
                    info!("connection recovered");
                    break;
                }
                Err(RecoveryOutcome::Fatal(reason)) => {
                    warn!(text = %reason.reply_text, "recovery abandoned");
                    conn.finish_shutdown(reason);
                    return;
                }
                Err(RecoveryOutcome::Retry(message)) => {
                    warn!(%message, "recovery attempt failed, retrying");
                }
            }
        }
    }
}

fn reason_of_fault(kind: &FaultKind) -> CloseReason {
    match kind {
        FaultKind::Transport(err) => CloseReason {
            reply_code: 0,
            reply_text: err.to_string(),
            class_id: 0,
            method_id: 0,
        },
        FaultKind::Protocol { code, message } => CloseReason {
            reply_code: *code,
            reply_text: message.clone(),
            class_id: 0,
            method_id: 0,
        },
    }
}

struct ChannelRebind {
    shared: Arc<ChannelShared>,
    was_confirm: bool,
    replay_publishes: Vec<PendingPublish>,
}

async fn attempt_recovery(
    conn: &Arc<ConnectionInner>,
    resolver: &dyn EndpointResolver,
) -> Result<(), RecoveryOutcome> {
    // fresh transport under the existing connection identity
    let dialed = select_one(resolver, |endpoint| dial(&conn.config, endpoint)).await;
    let (transport, negotiated) = match dialed {
        Ok(ok) => ok,
        Err(err @ ConnectError::Handshake(HandshakeError::AuthFailure(_)))
        | Err(err @ ConnectError::Handshake(HandshakeError::MechanismMismatch { .. }))
        | Err(err @ ConnectError::NoEndpoints) => {
            return Err(RecoveryOutcome::Fatal(CloseReason {
                reply_code: reply_code::ACCESS_REFUSED,
                reply_text: err.to_string(),
                class_id: 0,
                method_id: 0,
            }))
        }
        Err(err) => return Err(RecoveryOutcome::Retry(err.to_string())),
    };
    conn.install_transport(transport, &negotiated);

    // rebind surviving channel objects to fresh ids
    let survivors: Vec<Arc<ChannelShared>> = {
        let mut arena = conn.channels.lock();
        let all = arena.iter().map(|(_, s)| Arc::clone(s)).collect();
        arena.clear();
        all
    };
    let mut rebinds = Vec::with_capacity(survivors.len());
    for shared in survivors {
        if shared.state() == ChannelState::Closed {
            continue;
        }
        let was_confirm = shared.confirms.is_enabled();
        let replay_publishes = shared.confirms.take_unconfirmed();

        let id = {
            let mut arena = conn.channels.lock();
            let entry = arena.vacant_entry();
            let id = entry.key() as u16 + 1;
            entry.insert(Arc::clone(&shared));
            id
        };
        shared.set_id(id);
        shared.set_state(ChannelState::Opening);
        let inbound = shared.reset_inbound(conn.config.channel_queue_capacity);
        spawn_dispatcher(
            Arc::clone(&shared),
            inbound,
            conn.config.max_inbound_message_body_size,
        );
        match shared.rpc(Method::ChannelOpen(channel_methods::Open)).await {
            Ok(RpcReply::Method(Method::ChannelOpenOk(_))) => {
                shared.set_state(ChannelState::Open)
            }
            Ok(_) | Err(_) => {
                return Err(RecoveryOutcome::Retry("channel reopen failed".into()))
            }
        }
        rebinds.push(ChannelRebind {
            shared,
            was_confirm,
            replay_publishes,
        });
    }

    // replay declared topology in declaration order
    let renames = if conn.config.topology_recovery {
        replay_topology(conn).await?
    } else {
        HashMap::new()
    };

    // per-channel settings and consumers, then unsettled publishes
    for rebind in rebinds {
        recover_channel_state(conn, rebind, &renames).await?;
    }

    Ok(())
}

async fn recover_channel_state(
    conn: &Arc<ConnectionInner>,
    rebind: ChannelRebind,
    renames: &HashMap<String, String>,
) -> Result<(), RecoveryOutcome> {
    let shared = rebind.shared;

    let recorded_qos = *shared.recorded_qos.lock();
    if let Some(qos) = recorded_qos {
        rpc_or_retry(&shared, Method::BasicQos(qos), "qos replay").await?;
    }
    if rebind.was_confirm {
        rpc_or_retry(
            &shared,
            Method::ConfirmSelect(coney_codec::method::confirm::Select { no_wait: false }),
            "confirm replay",
        )
        .await?;
    }

    // re-register consumers under possibly fresh wire tags; the tag the
    // user saw is preserved
    let entries = shared.consumers.lock().drain_for_recovery();
    for (_old_wire_tag, mut entry) in entries {
        if let Some(renamed) = renames.get(&entry.queue) {
            entry.queue = renamed.clone();
        }
        let entity = RecordedEntity::Consumer {
            tag: entry.user_tag.clone(),
            queue: entry.queue.clone(),
        };
        if !filter_allows(conn, &entity) {
            debug!(tag = %entry.user_tag, "consumer excluded from recovery");
            continue;
        }
        let consume = basic::Consume {
            queue: short_or_retry(&entry.queue)?,
            consumer_tag: short_or_retry(if entry.server_named {
                ""
            } else {
                entry.user_tag.as_str()
            })?,
            no_local: entry.options.no_local,
            no_ack: entry.options.no_ack,
            exclusive: entry.options.exclusive,
            no_wait: false,
            arguments: entry.options.arguments.clone(),
        };
        *shared.pending_consumer.lock() = Some(PendingConsumer::Rebind { entry });
        match shared.rpc(Method::BasicConsume(consume)).await {
            Ok(RpcReply::Method(Method::BasicConsumeOk(_))) => {}
            Ok(other) => {
                shared.pending_consumer.lock().take();
                return Err(RecoveryOutcome::Retry(format!(
                    "unexpected consume reply during recovery: {other:?}"
                )));
            }
            Err(err) => {
                shared.pending_consumer.lock().take();
                match handle_replay_error(conn, &entity, &err) {
                    RecoveryAdvice::Skip => continue,
                    RecoveryAdvice::Retry => {
                        return Err(RecoveryOutcome::Retry(format!(
                            "consumer replay failed: {err}"
                        )))
                    }
                    RecoveryAdvice::Abort => {
                        return Err(RecoveryOutcome::Fatal(replay_failure_reason(&err)))
                    }
                }
            }
        }
    }

    // replay unsettled confirm-mode publishes in their original order;
    // the writer assigns fresh sequences as they re-enter the wire
    for mut publish in rebind.replay_publishes {
        for frame in &mut publish.frames {
            frame.channel = shared.id();
        }
        conn.send_command(WriteCommand::Publish {
            frames: publish.frames,
            tracker: Arc::clone(&shared.confirms),
            handle: publish.handle,
        })
        .await
        .map_err(|err| RecoveryOutcome::Retry(err.to_string()))?;
    }

    Ok(())
}

async fn replay_topology(
    conn: &Arc<ConnectionInner>,
) -> Result<HashMap<String, String>, RecoveryOutcome> {
    let (exchanges, queues, bindings) = conn.topology.lock().snapshot();
    let mut renames: HashMap<String, String> = HashMap::new();
    let mut replay_channel: Option<Channel> = None;

    for record in exchanges {
        let entity = RecordedEntity::Exchange(record.clone());
        if !filter_allows(conn, &entity) {
            continue;
        }
        let declare = Method::ExchangeDeclare(exchange::Declare {
            exchange: short_or_retry(&record.name)?,
            kind: short_or_retry(&record.kind)?,
            passive: false,
            durable: record.durable,
            auto_delete: record.auto_delete,
            internal: record.internal,
            no_wait: false,
            arguments: record.arguments.clone(),
        });
        replay_entity(conn, &mut replay_channel, &entity, declare).await?;
    }

    for record in queues {
        let entity = RecordedEntity::Queue(record.clone());
        if !filter_allows(conn, &entity) {
            continue;
        }
        let name_on_wire = if record.server_named {
            ""
        } else {
            record.name.as_str()
        };
        let declare = Method::QueueDeclare(queue::Declare {
            queue: short_or_retry(name_on_wire)?,
            passive: false,
            durable: record.durable,
            exclusive: record.exclusive,
            auto_delete: record.auto_delete,
            no_wait: false,
            arguments: record.arguments.clone(),
        });
        let reply = replay_entity(conn, &mut replay_channel, &entity, declare).await?;
        if record.server_named {
            if let Some(RpcReply::Method(Method::QueueDeclareOk(ok))) = reply {
                let new_name = ok.queue.to_string();
                if new_name != record.name {
                    debug!(old = %record.name, new = %new_name, "server-named queue renamed");
                    conn.topology.lock().rename_queue(&record.name, &new_name);
                    renames.insert(record.name.clone(), new_name);
                }
            }
        }
    }

    // exchange-to-exchange bindings strictly before queue bindings
    for pass in [BindingKind::ExchangeToExchange, BindingKind::ExchangeToQueue] {
        for record in bindings.iter().filter(|b| b.kind == pass) {
            let mut record = record.clone();
            if record.kind == BindingKind::ExchangeToQueue {
                if let Some(renamed) = renames.get(&record.destination) {
                    record.destination = renamed.clone();
                }
            }
            let entity = RecordedEntity::Binding(record.clone());
            if !filter_allows(conn, &entity) {
                continue;
            }
            let method = match record.kind {
                BindingKind::ExchangeToExchange => Method::ExchangeBind(exchange::Bind {
                    destination: short_or_retry(&record.destination)?,
                    source: short_or_retry(&record.source)?,
                    routing_key: short_or_retry(&record.routing_key)?,
                    no_wait: false,
                    arguments: record.arguments.clone(),
                }),
                BindingKind::ExchangeToQueue => Method::QueueBind(queue::Bind {
                    queue: short_or_retry(&record.destination)?,
                    exchange: short_or_retry(&record.source)?,
                    routing_key: short_or_retry(&record.routing_key)?,
                    no_wait: false,
                    arguments: record.arguments.clone(),
                }),
            };
            replay_entity(conn, &mut replay_channel, &entity, method).await?;
        }
    }

    if let Some(channel) = replay_channel {
        let _ = channel.close_ungated().await;
    }
    Ok(renames)
}

/// Runs one entity's replay RPC, consulting the exception handler on
/// failure. A soft error kills the replay channel; a fresh one is opened
/// for the next entity.
async fn replay_entity(
    conn: &Arc<ConnectionInner>,
    replay_channel: &mut Option<Channel>,
    entity: &RecordedEntity,
    method: Method,
) -> Result<Option<RpcReply>, RecoveryOutcome> {
    let mut retried = false;
    loop {
        let channel = match replay_channel {
            Some(channel) => channel.clone(),
            None => {
                let channel = conn
                    .open_channel_ungated()
                    .await
                    .map_err(|err| RecoveryOutcome::Retry(err.to_string()))?;
                replay_channel.replace(channel.clone());
                channel
            }
        };

        match channel.shared().rpc(method.clone()).await {
            Ok(reply) => return Ok(Some(reply)),
            Err(err) => {
                if matches!(err, Error::ChannelClosed { .. }) {
                    replay_channel.take();
                } else {
                    // connection-level trouble; retry the whole recovery
                    return Err(RecoveryOutcome::Retry(err.to_string()));
                }
                match handle_replay_error(conn, entity, &err) {
                    RecoveryAdvice::Skip => {
                        warn!(?entity, %err, "skipping entity during topology recovery");
                        return Ok(None);
                    }
                    RecoveryAdvice::Retry if !retried => {
                        retried = true;
                        continue;
                    }
                    RecoveryAdvice::Retry | RecoveryAdvice::Abort => {
                        return Err(RecoveryOutcome::Fatal(replay_failure_reason(&err)))
                    }
                }
            }
        }
    }
}

fn filter_allows(conn: &ConnectionInner, entity: &RecordedEntity) -> bool {
    conn.config
        .topology_recovery_filter
        .as_ref()
        .map(|filter| filter(entity))
        .unwrap_or(true)
}

fn handle_replay_error(
    conn: &ConnectionInner,
    entity: &RecordedEntity,
    err: &Error,
) -> RecoveryAdvice {
    if let Some(handler) = conn.config.topology_recovery_exception_handler.as_ref() {
        return handler(entity, err);
    }
    default_advice(err)
}

/// Without a handler configured: abandon on non-retryable errors (access
/// refused, policy violations) and on missing dependencies, which usually
/// mean the recovery filter excluded something the server now rejects;
/// skip entity-level conflicts
fn default_advice(err: &Error) -> RecoveryAdvice {
    match err {
        Error::ChannelClosed { reply_code, .. } => match *reply_code {
            reply_code::ACCESS_REFUSED | reply_code::NOT_ALLOWED | reply_code::NOT_FOUND => {
                RecoveryAdvice::Abort
            }
            _ => RecoveryAdvice::Skip,
        },
        _ => RecoveryAdvice::Abort,
    }
}

fn replay_failure_reason(err: &Error) -> CloseReason {
    match err {
        Error::ChannelClosed {
            reply_code,
            reply_text,
            class_id,
            method_id,
        } => CloseReason {
            reply_code: *reply_code,
            reply_text: format!("topology recovery failed: {reply_text}"),
            class_id: *class_id,
            method_id: *method_id,
        },
        other => CloseReason {
            reply_code: 0,
            reply_text: format!("topology recovery failed: {other}"),
            class_id: 0,
            method_id: 0,
        },
    }
}

async fn rpc_or_retry(
    shared: &Arc<ChannelShared>,
    method: Method,
    what: &str,
) -> Result<(), RecoveryOutcome> {
    shared
        .rpc(method)
        .await
        .map(|_| ())
        .map_err(|err| RecoveryOutcome::Retry(format!("{what} failed: {err}")))
}

fn short_or_retry(s: &str) -> Result<coney_codec::ShortString, RecoveryOutcome> {
    coney_codec::ShortString::try_from(s)
        .map_err(|err| RecoveryOutcome::Retry(format!("invalid short string: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(name: &str) -> RecordedExchange {
        RecordedExchange {
            name: name.into(),
            kind: "topic".into(),
            durable: true,
            auto_delete: false,
            internal: false,
            arguments: FieldTable::new(),
        }
    }

    fn queue(name: &str, server_named: bool) -> RecordedQueue {
        RecordedQueue {
            name: name.into(),
            durable: false,
            exclusive: false,
            auto_delete: false,
            arguments: FieldTable::new(),
            server_named,
        }
    }

    fn binding(kind: BindingKind, destination: &str, source: &str, key: &str) -> RecordedBinding {
        RecordedBinding {
            kind,
            destination: destination.into(),
            source: source.into(),
            routing_key: key.into(),
            arguments: FieldTable::new(),
        }
    }

    #[test]
    fn declaration_order_is_preserved() {
        let mut topology = Topology::default();
        topology.record_exchange(exchange("b"));
        topology.record_exchange(exchange("a"));
        topology.record_queue(queue("q2", false));
        topology.record_queue(queue("q1", false));
        assert_eq!(topology.exchange_names(), ["b", "a"]);
        assert_eq!(topology.queue_names(), ["q2", "q1"]);
    }

    #[test]
    fn redeclare_replaces_in_place() {
        let mut topology = Topology::default();
        topology.record_exchange(exchange("a"));
        topology.record_exchange(exchange("b"));
        let mut updated = exchange("a");
        updated.durable = false;
        topology.record_exchange(updated);
        // position preserved, definition replaced
        assert_eq!(topology.exchange_names(), ["a", "b"]);
        assert!(!topology.exchanges[0].durable);
    }

    #[test]
    fn deleting_a_queue_prunes_its_bindings() {
        let mut topology = Topology::default();
        topology.record_queue(queue("q", false));
        topology.record_binding(binding(BindingKind::ExchangeToQueue, "q", "logs", "#"));
        topology.record_binding(binding(BindingKind::ExchangeToQueue, "other", "logs", "#"));
        topology.remove_queue("q");
        assert!(topology.queue_names().is_empty());
        assert_eq!(topology.bindings().len(), 1);
        assert_eq!(topology.bindings()[0].destination, "other");
    }

    #[test]
    fn deleting_an_exchange_prunes_bindings_on_both_sides() {
        let mut topology = Topology::default();
        topology.record_exchange(exchange("logs"));
        topology.record_binding(binding(BindingKind::ExchangeToQueue, "q", "logs", "#"));
        topology.record_binding(binding(BindingKind::ExchangeToExchange, "logs", "root", "#"));
        topology.record_binding(binding(BindingKind::ExchangeToQueue, "q", "other", "#"));
        topology.remove_exchange("logs");
        assert_eq!(topology.bindings().len(), 1);
        assert_eq!(topology.bindings()[0].source, "other");
    }

    #[test]
    fn renaming_a_server_named_queue_updates_bindings() {
        let mut topology = Topology::default();
        topology.record_queue(queue("amq.gen-old", true));
        topology.record_binding(binding(
            BindingKind::ExchangeToQueue,
            "amq.gen-old",
            "logs",
            "#",
        ));
        topology.rename_queue("amq.gen-old", "amq.gen-new");
        assert_eq!(topology.queue_names(), ["amq.gen-new"]);
        assert_eq!(topology.bindings()[0].destination, "amq.gen-new");
    }

    #[test]
    fn duplicate_bindings_are_recorded_once() {
        let mut topology = Topology::default();
        let b = binding(BindingKind::ExchangeToQueue, "q", "logs", "#");
        topology.record_binding(b.clone());
        topology.record_binding(b);
        assert_eq!(topology.bindings().len(), 1);
    }

    #[test]
    fn default_advice_aborts_on_non_retryable_codes() {
        let closed = |code: u16| Error::ChannelClosed {
            reply_code: code,
            reply_text: String::new(),
            class_id: 0,
            method_id: 0,
        };
        assert_eq!(default_advice(&closed(403)), RecoveryAdvice::Abort);
        assert_eq!(default_advice(&closed(530)), RecoveryAdvice::Abort);
        assert_eq!(default_advice(&closed(404)), RecoveryAdvice::Abort);
        assert_eq!(default_advice(&closed(406)), RecoveryAdvice::Skip);
        assert_eq!(default_advice(&Error::Timeout), RecoveryAdvice::Abort);
    }
}
