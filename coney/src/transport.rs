//! Low level framed transport
//!
//! Binds an IO object to the frame codec through `FramedRead`/`FramedWrite`
//! halves. The read half owns the idle deadline: when nothing arrives for
//! the configured window the stream yields a heartbeat-timeout error, which
//! the recovery engine treats as an involuntary disconnect.
//!
//! The transport is generic over the IO type; TLS streams established by an
//! external connector bind exactly like plain TCP.

use std::future::Future;
use std::task::Poll;
use std::time::Duration;

use coney_codec::constants::{FRAME_MIN_SIZE, PROTOCOL_HEADER};
use coney_codec::{Frame, FrameCodec};
use futures_util::{Sink, Stream};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::error::TransportError;
use crate::util::IdleTimeout;

pin_project! {
    /// Frame transport over any `AsyncRead + AsyncWrite` IO
    #[derive(Debug)]
    pub struct Transport<Io> {
        #[pin]
        writer: TransportWriter<Io>,
        #[pin]
        reader: TransportReader<Io>,
    }
}

pin_project! {
    /// Write half: a framed sink of outbound frames
    #[derive(Debug)]
    pub struct TransportWriter<Io> {
        #[pin]
        framed_write: FramedWrite<WriteHalf<Io>, FrameCodec>,
    }
}

pin_project! {
    /// Read half: a framed stream of inbound frames with an idle deadline
    #[derive(Debug)]
    pub struct TransportReader<Io> {
        #[pin]
        framed_read: FramedRead<ReadHalf<Io>, FrameCodec>,
        idle_timeout: Option<IdleTimeout>,
        heartbeat_enabled: bool,
    }
}

impl<Io> Transport<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    /// Writes the protocol header and binds the codec with the
    /// pre-tuning frame-max
    pub async fn negotiate(mut io: Io) -> Result<Self, TransportError> {
        io.write_all(&PROTOCOL_HEADER).await?;
        Ok(Self::bind(io, FRAME_MIN_SIZE as usize))
    }

    /// Binds an IO to the frame codec without touching the wire
    pub fn bind(io: Io, max_frame_size: usize) -> Self {
        let (reader, writer) = tokio::io::split(io);
        let framed_write = FramedWrite::new(writer, FrameCodec::new(max_frame_size));
        let framed_read = FramedRead::new(reader, FrameCodec::new(max_frame_size));
        Self {
            writer: TransportWriter { framed_write },
            reader: TransportReader {
                framed_read,
                idle_timeout: None,
                heartbeat_enabled: false,
            },
        }
    }

    /// Applies the negotiated frame-max to both codec halves
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.writer
            .framed_write
            .encoder_mut()
            .set_max_frame_size(max_frame_size);
        self.reader
            .framed_read
            .decoder_mut()
            .set_max_frame_size(max_frame_size);
    }

    /// Arms the read-side idle deadline
    ///
    /// `heartbeat_enabled` decides how an expiry is classified: a missed
    /// heartbeat when heartbeats were negotiated, a plain read timeout
    /// otherwise.
    pub fn set_idle_deadline(&mut self, window: Duration, heartbeat_enabled: bool) {
        self.reader.idle_timeout = if window.is_zero() {
            None
        } else {
            Some(IdleTimeout::new(window))
        };
        self.reader.heartbeat_enabled = heartbeat_enabled;
    }

    /// Splits into independently owned write and read halves
    pub fn into_split(self) -> (TransportWriter<Io>, TransportReader<Io>) {
        (self.writer, self.reader)
    }
}

impl<Io> Stream for Transport<Io>
where
    Io: AsyncRead + Unpin,
{
    type Item = Result<Frame, TransportError>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        self.project().reader.poll_next(cx)
    }
}

impl<Io> Sink<Frame> for Transport<Io>
where
    Io: AsyncWrite + Unpin,
{
    type Error = TransportError;

    fn poll_ready(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        self.project().writer.poll_ready(cx)
    }

    fn start_send(self: std::pin::Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        self.project().writer.start_send(item)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        self.project().writer.poll_flush(cx)
    }

    fn poll_close(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        self.project().writer.poll_close(cx)
    }
}

impl<Io> Stream for TransportReader<Io>
where
    Io: AsyncRead + Unpin,
{
    type Item = Result<Frame, TransportError>;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.framed_read.poll_next(cx) {
            Poll::Ready(next) => {
                // any inbound bytes, heartbeats included, reset the deadline
                if let Some(idle) = this.idle_timeout.as_mut() {
                    idle.reset();
                }
                Poll::Ready(next.map(|item| item.map_err(Into::into)))
            }
            Poll::Pending => {
                if let Some(idle) = this.idle_timeout.as_mut() {
                    if std::pin::Pin::new(idle).poll(cx).is_ready() {
                        let err = if *this.heartbeat_enabled {
                            TransportError::HeartbeatTimeout
                        } else {
                            TransportError::Io(std::io::Error::new(
                                std::io::ErrorKind::TimedOut,
                                "socket read timed out",
                            ))
                        };
                        return Poll::Ready(Some(Err(err)));
                    }
                }
                Poll::Pending
            }
        }
    }
}

impl<Io> Sink<Frame> for TransportWriter<Io>
where
    Io: AsyncWrite + Unpin,
{
    type Error = TransportError;

    fn poll_ready(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        self.project().framed_write.poll_ready(cx).map_err(Into::into)
    }

    fn start_send(self: std::pin::Pin<&mut Self>, item: Frame) -> Result<(), Self::Error> {
        self.project().framed_write.start_send(item).map_err(Into::into)
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        self.project().framed_write.poll_flush(cx).map_err(Into::into)
    }

    fn poll_close(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> Poll<Result<(), Self::Error>> {
        self.project().framed_write.poll_close(cx).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use coney_codec::method::connection;
    use coney_codec::Method;
    use futures_util::{SinkExt, StreamExt};

    use super::*;

    #[tokio::test]
    async fn negotiate_writes_protocol_header() {
        let mock = tokio_test::io::Builder::new()
            .write(b"AMQP\x00\x00\x09\x01")
            .build();
        let _transport = Transport::negotiate(mock).await.unwrap();
    }

    #[tokio::test]
    async fn frame_roundtrip_through_mock() {
        let frame = Frame::method(
            0,
            Method::ConnectionTuneOk(connection::TuneOk {
                channel_max: 128,
                frame_max: 4096,
                heartbeat: 10,
            }),
        );
        let mut wire = bytes::BytesMut::new();
        use tokio_util::codec::Encoder;
        FrameCodec::new(4096)
            .encode(frame.clone(), &mut wire)
            .unwrap();

        let mock = tokio_test::io::Builder::new()
            .write(&wire)
            .read(&wire)
            .build();
        let mut transport = Transport::bind(mock, 4096);
        transport.send(frame.clone()).await.unwrap();
        let received = transport.next().await.unwrap().unwrap();
        assert_eq!(received, frame);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_trips_the_heartbeat_deadline() {
        let (io, _other_end) = tokio::io::duplex(64);
        let mut transport = Transport::bind(io, 4096);
        transport.set_idle_deadline(Duration::from_secs(20), true);
        let (_writer, mut reader) = transport.into_split();

        let result = reader.next().await.unwrap();
        assert!(matches!(result, Err(TransportError::HeartbeatTimeout)));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_disabled_without_window() {
        let (io, mut other_end) = tokio::io::duplex(64);
        let transport = Transport::bind(io, 4096);
        let (_writer, mut reader) = transport.into_split();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            use tokio::io::AsyncWriteExt;
            // a heartbeat frame after an hour of silence
            let _ = other_end.write_all(&[8, 0, 0, 0, 0, 0, 0, 0xCE]).await;
        });

        let frame = reader.next().await.unwrap().unwrap();
        assert_eq!(frame, Frame::heartbeat());
    }
}
