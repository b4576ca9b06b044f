//! Reader and writer tasks of one connection generation
//!
//! Exactly one reader and one writer task exist per live transport. The
//! writer holds the sole right to the transport's write side: every channel
//! submits frames through a bounded command queue, which both guarantees
//! frame atomicity on the wire and removes per-channel write locking. The
//! publisher-confirm sequence is assigned here, in the writer, so sequence
//! order always equals wire order.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use coney_codec::constants::reply_code;
use coney_codec::{Frame, FramePayload};
use futures_util::future::select_all;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::{debug, error, instrument, trace};

use crate::confirms::{ConfirmHandle, ConfirmOutcome, ConfirmTracker, PendingPublish};
use crate::connection::heartbeat::HeartBeat;
use crate::connection::ConnectionInner;
use crate::error::TransportError;
use crate::transport::{TransportReader, TransportWriter};
use crate::util::Running;

/// A unit of work for the writer task
#[derive(Debug)]
pub(crate) enum WriteCommand {
    /// Frames written back-to-back, e.g. a method or method+header+bodies
    Frames(Vec<Frame>),
    /// A publish; the writer assigns the confirm sequence as the frames
    /// enter the wire
    Publish {
        frames: Vec<Frame>,
        tracker: Arc<ConfirmTracker>,
        handle: Option<ConfirmHandle>,
    },
}

/// An involuntary failure reported by a reader, writer, or dispatcher
#[derive(Debug)]
pub(crate) struct EngineFault {
    /// Transport generation the fault belongs to; stale generations are
    /// ignored by the recovery supervisor
    pub generation: u64,
    pub kind: FaultKind,
}

#[derive(Debug)]
pub(crate) enum FaultKind {
    Transport(TransportError),
    /// Peer violated the protocol, or sent a hard-error close
    Protocol { code: u16, message: String },
}

#[instrument(name = "writer", skip_all, fields(generation = generation))]
pub(crate) async fn writer_loop<Io>(
    mut sink: TransportWriter<Io>,
    mut commands: mpsc::Receiver<WriteCommand>,
    mut heartbeat: HeartBeat,
    write_timeout: Duration,
    fault_tx: mpsc::Sender<EngineFault>,
    generation: u64,
) where
    Io: AsyncWrite + Send + Unpin,
{
    loop {
        let result = tokio::select! {
            command = commands.recv() => match command {
                // the connection dropped its write handle, clean stop
                None => break,
                Some(command) => on_command(&mut sink, command, write_timeout).await,
            },
            _ = heartbeat.next() => {
                write_batch(&mut sink, vec![Frame::heartbeat()], write_timeout).await
            }
        };

        if let Err(err) = result {
            error!(?err, "writer failed");
            let _ = fault_tx
                .send(EngineFault {
                    generation,
                    kind: FaultKind::Transport(err),
                })
                .await;
            return;
        }
    }

    commands.close();
    debug!("writer stopped");
}

async fn on_command<Io>(
    sink: &mut TransportWriter<Io>,
    command: WriteCommand,
    write_timeout: Duration,
) -> Result<(), TransportError>
where
    Io: AsyncWrite + Send + Unpin,
{
    match command {
        WriteCommand::Frames(frames) => write_batch(sink, frames, write_timeout).await,
        WriteCommand::Publish {
            frames,
            tracker,
            handle,
        } => {
            if tracker.is_enabled() {
                let seq = tracker.assign(PendingPublish {
                    handle,
                    frames: frames.clone(),
                });
                trace!(seq, "tracked publish");
            } else if let Some(handle) = handle {
                handle.resolve(ConfirmOutcome::Ack);
            }
            write_batch(sink, frames, write_timeout).await
        }
    }
}

async fn write_batch<Io>(
    sink: &mut TransportWriter<Io>,
    frames: Vec<Frame>,
    write_timeout: Duration,
) -> Result<(), TransportError>
where
    Io: AsyncWrite + Send + Unpin,
{
    let write = async {
        for frame in frames {
            sink.feed(frame).await?;
        }
        sink.flush().await
    };
    match tokio::time::timeout(write_timeout, write).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Io(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "socket write timed out",
        ))),
    }
}

#[instrument(name = "reader", skip_all, fields(generation = generation))]
pub(crate) async fn reader_loop<Io>(
    mut stream: TransportReader<Io>,
    conn: Arc<ConnectionInner>,
    fault_tx: mpsc::Sender<EngineFault>,
    generation: u64,
) where
    Io: AsyncRead + Send + Unpin,
{
    let mut router = InboundRouter::new();

    while let Some(item) = stream.next().await {
        match item {
            Err(err) => {
                error!(?err, "reader failed");
                let _ = fault_tx
                    .send(EngineFault {
                        generation,
                        kind: FaultKind::Transport(err),
                    })
                    .await;
                return;
            }
            Ok(frame) => {
                trace!(channel = frame.channel, "RECV");
                if frame.channel == 0 {
                    match conn.on_connection_frame(frame.payload).await {
                        Ok(Running::Continue) => {}
                        Ok(Running::Stop) => {
                            debug!("reader stopped after close");
                            return;
                        }
                        Err(fault) => {
                            let _ = fault_tx
                                .send(EngineFault {
                                    generation,
                                    kind: fault,
                                })
                                .await;
                            return;
                        }
                    }
                } else if let Err(fault) =
                    router.route(&conn, frame.channel, frame.payload).await
                {
                    let _ = fault_tx
                        .send(EngineFault {
                            generation,
                            kind: fault,
                        })
                        .await;
                    return;
                }
            }
        }
    }

    // EOF without a close handshake
    if !conn.is_shutting_down() {
        let _ = fault_tx
            .send(EngineFault {
                generation,
                kind: FaultKind::Transport(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "transport closed before connection close",
                ))),
            })
            .await;
    }
}

/// Routes inbound channel frames into per-channel dispatcher queues
/// without ever blocking the reader on a single full queue
///
/// Frames for a channel whose queue is full are parked per channel, in
/// order, and re-offered with `try_send` before each new frame; the reader
/// only stops pulling from the socket when every live channel's queue is
/// simultaneously full. The server's prefetch windows bound what can be in
/// flight per channel, which bounds the parked backlog in turn.
#[derive(Debug, Default)]
pub(crate) struct InboundRouter {
    overflow: HashMap<u16, VecDeque<FramePayload>>,
}

impl InboundRouter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn route(
        &mut self,
        conn: &ConnectionInner,
        channel: u16,
        payload: FramePayload,
    ) -> Result<(), FaultKind> {
        self.flush(conn);

        let Some(sender) = conn.channel_sender(channel) else {
            let message = format!("frame on unknown channel {channel}");
            conn.send_close_frame(reply_code::UNEXPECTED_FRAME, &message)
                .await;
            return Err(FaultKind::Protocol {
                code: reply_code::UNEXPECTED_FRAME,
                message,
            });
        };

        match sender {
            // the channel is draining or rebinding; late frames are
            // discarded
            None => {
                self.overflow.remove(&channel);
            }
            Some(tx) => match self.overflow.get_mut(&channel) {
                // keep per-channel order behind already-parked frames
                Some(parked) => parked.push_back(payload),
                None => match tx.try_send(payload) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(payload)) => {
                        self.overflow.insert(channel, VecDeque::from([payload]));
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                },
            },
        }

        while !self.overflow.is_empty() && conn.all_channel_queues_full() {
            self.park_until_capacity(conn).await;
            self.flush(conn);
        }
        Ok(())
    }

    /// Re-offers parked frames; overflow for channels that went away is
    /// dropped
    fn flush(&mut self, conn: &ConnectionInner) {
        self.overflow.retain(|channel, parked| {
            let Some(Some(tx)) = conn.channel_sender(*channel) else {
                return false;
            };
            while let Some(payload) = parked.pop_front() {
                match tx.try_send(payload) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(payload)) => {
                        parked.push_front(payload);
                        break;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return false,
                }
            }
            !parked.is_empty()
        });
    }

    /// Parks until any live channel frees queue capacity; room anywhere
    /// lets the reader resume pulling frames, parked backlog or not
    async fn park_until_capacity(&mut self, conn: &ConnectionInner) {
        let senders = conn.live_channel_senders();
        if senders.is_empty() {
            self.overflow.clear();
            return;
        }
        let waits: Vec<Pin<Box<dyn Future<Output = ()> + Send>>> = senders
            .into_iter()
            .map(|tx| {
                Box::pin(async move {
                    let _ = tx.reserve().await;
                }) as Pin<Box<dyn Future<Output = ()> + Send>>
            })
            .collect();
        select_all(waits).await;
    }
}
