//! Per-channel dispatcher task
//!
//! Exactly one dispatcher task runs per channel per transport generation.
//! It drains the channel's bounded inbound queue, resolves RPC
//! continuations, assembles content, settles publisher confirms, and feeds
//! consumer delivery queues. The reader task never runs user code; this
//! task never runs it either, it only enqueues into consumer queues.

use std::sync::Arc;

use coney_codec::constants::reply_code;
use coney_codec::method::channel as channel_methods;
use coney_codec::{Frame, FramePayload, Method};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use crate::channel::{ChannelShared, ChannelState, PendingConsumer, RpcReply};
use crate::consumer::{spawn_workers, ConsumerEntry, Delivery, ReturnedMessage};
use crate::content::{AssembledMessage, ContentAssembler};
use crate::error::{CloseReason, Error};
use crate::util::Running;

pub(crate) fn spawn_dispatcher(
    shared: Arc<ChannelShared>,
    inbound: mpsc::Receiver<FramePayload>,
    max_body_size: usize,
) -> JoinHandle<()> {
    tokio::spawn(dispatch_loop(shared, inbound, max_body_size))
}

#[instrument(name = "channel-dispatcher", skip_all, fields(channel = shared.id()))]
async fn dispatch_loop(
    shared: Arc<ChannelShared>,
    mut inbound: mpsc::Receiver<FramePayload>,
    max_body_size: usize,
) {
    let mut assembler = ContentAssembler::new(max_body_size);

    while let Some(payload) = inbound.recv().await {
        // a closing channel discards everything but the close handshake
        if shared.state() == ChannelState::Closing && !is_close_frame(&payload) {
            continue;
        }

        let step = match payload {
            FramePayload::Method(method) => on_method(&shared, &mut assembler, method).await,
            FramePayload::Header(header) => match assembler.on_header(header) {
                Ok(Some(message)) => route_message(&shared, message).await,
                Ok(None) => Ok(Running::Continue),
                Err(err) => Err(err),
            },
            FramePayload::Body(chunk) => match assembler.on_body(chunk) {
                Ok(Some(message)) => route_message(&shared, message).await,
                Ok(None) => Ok(Running::Continue),
                Err(err) => Err(err),
            },
            FramePayload::Heartbeat => Err(Error::ProtocolViolation(
                "heartbeat frame on a non-zero channel".into(),
            )),
        };

        match step {
            Ok(Running::Continue) => {}
            Ok(Running::Stop) => break,
            Err(err) => {
                error!(?err, "channel dispatcher failed");
                escalate(&shared, err).await;
                break;
            }
        }
    }

    debug!("dispatcher stopped");
}

fn is_close_frame(payload: &FramePayload) -> bool {
    matches!(
        payload,
        FramePayload::Method(Method::ChannelClose(_))
            | FramePayload::Method(Method::ChannelCloseOk)
    )
}

async fn on_method(
    shared: &Arc<ChannelShared>,
    assembler: &mut ContentAssembler,
    method: Method,
) -> Result<Running, Error> {
    if assembler.is_assembling() {
        return Err(Error::ProtocolViolation(format!(
            "method {}.{} during content assembly",
            method.class_id(),
            method.method_id()
        )));
    }

    match method {
        // content-bearing methods start an assembly
        Method::BasicDeliver(_) | Method::BasicReturn(_) | Method::BasicGetOk(_) => {
            assembler.start(method)?;
            Ok(Running::Continue)
        }

        // publisher confirms
        Method::BasicAck(ack) => {
            shared.confirms.on_ack(ack.delivery_tag, ack.multiple);
            Ok(Running::Continue)
        }
        Method::BasicNack(nack) => {
            shared.confirms.on_nack(nack.delivery_tag, nack.multiple);
            Ok(Running::Continue)
        }

        // server-pushed consumer cancellation (e.g. the queue was deleted)
        Method::BasicCancel(cancel) => {
            let tag = cancel.consumer_tag.to_string();
            warn!(%tag, "server cancelled consumer");
            shared.consumers.lock().remove(&tag);
            if !cancel.no_wait {
                let reply = Method::BasicCancelOk(coney_codec::method::basic::CancelOk {
                    consumer_tag: cancel.consumer_tag,
                });
                shared.send(vec![Frame::method(shared.id(), reply)]).await?;
            }
            Ok(Running::Continue)
        }

        // reply to our basic.cancel
        Method::BasicCancelOk(ok) => {
            shared.consumers.lock().remove(ok.consumer_tag.as_str());
            shared.resolve_rpc(Ok(RpcReply::Method(Method::BasicCancelOk(ok))));
            Ok(Running::Continue)
        }

        // consume-ok completes the staged registration before any
        // delivery for the new tag can be observed
        Method::BasicConsumeOk(ok) => {
            register_consumer(shared, ok.consumer_tag.to_string());
            shared.resolve_rpc(Ok(RpcReply::Method(Method::BasicConsumeOk(ok))));
            Ok(Running::Continue)
        }

        Method::BasicGetEmpty => {
            shared.resolve_rpc(Ok(RpcReply::GetEmpty));
            Ok(Running::Continue)
        }

        // server-initiated pause or resume of the publish path
        Method::ChannelFlow(flow) => {
            shared.set_flow(flow.active);
            let reply = Method::ChannelFlowOk(channel_methods::FlowOk {
                active: flow.active,
            });
            shared.send(vec![Frame::method(shared.id(), reply)]).await?;
            Ok(Running::Continue)
        }

        // server-initiated close: soft errors end the channel, hard
        // errors escalate to the connection
        Method::ChannelClose(close) => {
            let reason = CloseReason {
                reply_code: close.reply_code,
                reply_text: close.reply_text.to_string(),
                class_id: close.class_id,
                method_id: close.method_id,
            };
            warn!(code = reason.reply_code, text = %reason.reply_text, "server closed channel");
            let _ = shared
                .send(vec![Frame::method(shared.id(), Method::ChannelCloseOk)])
                .await;
            let hard = reason.is_hard();
            shared.finalize_closed(reason.clone(), true);
            if hard {
                if let Ok(conn) = shared.conn() {
                    conn.report_protocol_error(reason.reply_code, reason.reply_text)
                        .await;
                }
            }
            Ok(Running::Stop)
        }

        Method::ChannelCloseOk => {
            shared.resolve_rpc(Ok(RpcReply::Method(Method::ChannelCloseOk)));
            shared.finalize_closed(
                CloseReason {
                    reply_code: reply_code::REPLY_SUCCESS,
                    reply_text: "Goodbye".into(),
                    class_id: 0,
                    method_id: 0,
                },
                true,
            );
            Ok(Running::Stop)
        }

        // confirm.select-ok flips the tracker before the caller resumes,
        // so publishes issued after confirm_select() returns are tracked
        Method::ConfirmSelectOk => {
            shared.confirms.enable();
            shared.resolve_rpc(Ok(RpcReply::Method(Method::ConfirmSelectOk)));
            Ok(Running::Continue)
        }

        // every remaining inbound method is a plain RPC reply
        reply @ (Method::ChannelOpenOk(_)
        | Method::ChannelFlowOk(_)
        | Method::ExchangeDeclareOk
        | Method::ExchangeDeleteOk
        | Method::ExchangeBindOk
        | Method::ExchangeUnbindOk
        | Method::QueueDeclareOk(_)
        | Method::QueueBindOk
        | Method::QueueUnbindOk
        | Method::QueuePurgeOk(_)
        | Method::QueueDeleteOk(_)
        | Method::BasicQosOk
        | Method::BasicRecoverOk) => {
            shared.resolve_rpc(Ok(RpcReply::Method(reply)));
            Ok(Running::Continue)
        }

        other => Err(Error::ProtocolViolation(format!(
            "method {}.{} unexpected on channel {}",
            other.class_id(),
            other.method_id(),
            shared.id()
        ))),
    }
}

fn register_consumer(shared: &Arc<ChannelShared>, wire_tag: String) {
    let Some(pending) = shared.pending_consumer.lock().take() else {
        warn!(%wire_tag, "consume-ok without a staged consumer");
        return;
    };
    match pending {
        PendingConsumer::New {
            queue,
            options,
            handler,
            user_tag,
            concurrency,
            queue_capacity,
        } => {
            let (tx, rx) = mpsc::channel(queue_capacity);
            let workers = spawn_workers(concurrency, rx, Arc::clone(&handler));
            let server_named = user_tag.is_none();
            let entry = ConsumerEntry {
                user_tag: user_tag.unwrap_or_else(|| wire_tag.clone()),
                server_named,
                queue,
                options,
                handler,
                tx,
                workers,
            };
            shared.consumers.lock().insert(wire_tag, entry);
        }
        PendingConsumer::Rebind { entry } => {
            shared.consumers.lock().insert(wire_tag, entry);
        }
    }
}

async fn route_message(
    shared: &Arc<ChannelShared>,
    message: AssembledMessage,
) -> Result<Running, Error> {
    match &message.method {
        Method::BasicDeliver(deliver) => {
            let tag = deliver.consumer_tag.to_string();
            let queue = shared.consumers.lock().delivery_queue(&tag);
            match queue {
                Some(tx) => {
                    let delivery = Delivery {
                        consumer_tag: tag,
                        delivery_tag: deliver.delivery_tag,
                        redelivered: deliver.redelivered,
                        exchange: deliver.exchange.to_string(),
                        routing_key: deliver.routing_key.to_string(),
                        properties: message.properties,
                        body: message.body,
                    };
                    // bounded queue: a slow consumer backpressures this
                    // dispatcher and this channel's inbound queue; the
                    // reader keeps serving other channels and parks only
                    // when every queue is full
                    let _ = tx.send(delivery).await;
                    Ok(Running::Continue)
                }
                None => {
                    // a delivery for a tag this channel never registered
                    warn!(%tag, "delivery for unknown consumer tag, closing channel");
                    let close = channel_methods::Close {
                        reply_code: reply_code::UNEXPECTED_FRAME,
                        reply_text: "delivery for unknown consumer tag"
                            .try_into()
                            .expect("static text fits"),
                        class_id: 0,
                        method_id: 0,
                    };
                    shared.set_state(ChannelState::Closing);
                    shared
                        .send(vec![Frame::method(
                            shared.id(),
                            Method::ChannelClose(close),
                        )])
                        .await?;
                    Ok(Running::Continue)
                }
            }
        }
        Method::BasicReturn(ret) => {
            shared.push_return(ReturnedMessage {
                reply_code: ret.reply_code,
                reply_text: ret.reply_text.to_string(),
                exchange: ret.exchange.to_string(),
                routing_key: ret.routing_key.to_string(),
                properties: message.properties,
                body: message.body,
            });
            Ok(Running::Continue)
        }
        Method::BasicGetOk(_) => {
            shared.resolve_rpc(Ok(RpcReply::GetOk(message)));
            Ok(Running::Continue)
        }
        other => Err(Error::ProtocolViolation(format!(
            "assembled content for non-content method {}.{}",
            other.class_id(),
            other.method_id()
        ))),
    }
}

/// A framing violation on this channel is connection-fatal
async fn escalate(shared: &Arc<ChannelShared>, err: Error) {
    let message = err.to_string();
    shared.finalize_closed(
        CloseReason {
            reply_code: reply_code::FRAME_ERROR,
            reply_text: message.clone(),
            class_id: 0,
            method_id: 0,
        },
        true,
    );
    if let Ok(conn) = shared.conn() {
        conn.report_protocol_error(reply_code::FRAME_ERROR, message)
            .await;
    }
}
