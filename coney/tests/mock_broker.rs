//! End-to-end tests against a scripted in-process broker
//!
//! The broker side speaks real wire bytes through the same codec, either
//! over an in-memory duplex stream or a real localhost TCP listener (for
//! the recovery test, which needs a re-dialable endpoint).

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use coney::{
    Channel, ConfirmOutcome, Connection, ConnectionConfig, ConnectionStatus, ConsumeOptions,
    DeliveryHandler, Endpoint, Error, QueueDeclareOptions,
};
use coney_codec::constants::{reply_code, PROTOCOL_HEADER};
use coney_codec::method::{basic, channel as channel_methods, connection, queue};
use coney_codec::{
    BasicProperties, ContentHeader, FieldTable, Frame, FrameCodec, FramePayload, LongString,
    Method,
};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio_util::codec::Framed;

struct Broker<Io> {
    framed: Framed<Io, FrameCodec>,
}

impl<Io> Broker<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    /// Accepts one client: header exchange, start/tune/open
    async fn accept(mut io: Io) -> Self {
        let mut header = [0u8; 8];
        io.read_exact(&mut header).await.unwrap();
        assert_eq!(header, PROTOCOL_HEADER);

        let mut broker = Self {
            framed: Framed::new(io, FrameCodec::new(0)),
        };

        broker
            .send(Frame::method(
                0,
                Method::ConnectionStart(connection::Start {
                    version_major: 0,
                    version_minor: 9,
                    server_properties: FieldTable::new(),
                    mechanisms: LongString::from("PLAIN"),
                    locales: LongString::from("en_US"),
                }),
            ))
            .await;
        let (_, start_ok) = broker.recv_method().await;
        let Method::ConnectionStartOk(start_ok) = start_ok else {
            panic!("expected start-ok, got {start_ok:?}");
        };
        assert_eq!(start_ok.mechanism.as_str(), "PLAIN");
        assert_eq!(start_ok.response.as_bytes(), b"\x00guest\x00guest");

        broker
            .send(Frame::method(
                0,
                Method::ConnectionTune(connection::Tune {
                    channel_max: 2047,
                    frame_max: 131072,
                    heartbeat: 0,
                }),
            ))
            .await;
        let (_, tune_ok) = broker.recv_method().await;
        assert!(matches!(tune_ok, Method::ConnectionTuneOk(_)));

        let (_, open) = broker.recv_method().await;
        let Method::ConnectionOpen(open) = open else {
            panic!("expected connection.open, got {open:?}");
        };
        assert_eq!(open.virtual_host.as_str(), "/");
        broker
            .send(Frame::method(
                0,
                Method::ConnectionOpenOk(connection::OpenOk::default()),
            ))
            .await;
        broker
    }

    async fn send(&mut self, frame: Frame) {
        self.framed.send(frame).await.unwrap();
    }

    async fn recv(&mut self) -> Frame {
        loop {
            let frame = self
                .framed
                .next()
                .await
                .expect("client hung up")
                .expect("bad frame from client");
            if frame.payload == FramePayload::Heartbeat {
                continue;
            }
            return frame;
        }
    }

    async fn recv_method(&mut self) -> (u16, Method) {
        let frame = self.recv().await;
        match frame.payload {
            FramePayload::Method(method) => (frame.channel, method),
            other => panic!("expected method frame, got {other:?}"),
        }
    }

    /// Reads the header and body frames that follow a publish
    async fn recv_content(&mut self) -> (u16, Bytes) {
        let frame = self.recv().await;
        let (channel, header) = match frame.payload {
            FramePayload::Header(header) => (frame.channel, header),
            other => panic!("expected content header, got {other:?}"),
        };
        let mut body = Vec::with_capacity(header.body_size as usize);
        while (body.len() as u64) < header.body_size {
            let frame = self.recv().await;
            match frame.payload {
                FramePayload::Body(chunk) => body.extend_from_slice(&chunk),
                other => panic!("expected body frame, got {other:?}"),
            }
        }
        (channel, Bytes::from(body))
    }

    /// Answers the channel.open expected on `channel`
    async fn accept_channel(&mut self, channel: u16) {
        let (ch, method) = self.recv_method().await;
        assert_eq!(ch, channel);
        assert!(matches!(method, Method::ChannelOpen(_)), "{method:?}");
        self.send(Frame::method(
            channel,
            Method::ChannelOpenOk(channel_methods::OpenOk),
        ))
        .await;
    }

    /// Answers the channel.close then connection.close of an orderly
    /// client shutdown
    async fn accept_shutdown(&mut self, channels: &[u16]) {
        for &channel in channels {
            let (ch, method) = self.recv_method().await;
            assert_eq!(ch, channel);
            assert!(matches!(method, Method::ChannelClose(_)), "{method:?}");
            self.send(Frame::method(channel, Method::ChannelCloseOk)).await;
        }
        let (ch, method) = self.recv_method().await;
        assert_eq!(ch, 0);
        assert!(matches!(method, Method::ConnectionClose(_)), "{method:?}");
        self.send(Frame::method(0, Method::ConnectionCloseOk)).await;
    }

    /// Sends a full deliver: method, header, body split into two frames
    async fn deliver(&mut self, channel: u16, tag: &str, delivery_tag: u64, body: &[u8]) {
        self.send(Frame::method(
            channel,
            Method::BasicDeliver(basic::Deliver {
                consumer_tag: tag.try_into().unwrap(),
                delivery_tag,
                redelivered: false,
                exchange: "".try_into().unwrap(),
                routing_key: "q".try_into().unwrap(),
            }),
        ))
        .await;
        self.send(Frame::header(
            channel,
            ContentHeader {
                class_id: 60,
                body_size: body.len() as u64,
                properties: BasicProperties::default(),
            },
        ))
        .await;
        let mid = body.len() / 2;
        self.send(Frame::body(channel, Bytes::copy_from_slice(&body[..mid])))
            .await;
        self.send(Frame::body(channel, Bytes::copy_from_slice(&body[mid..])))
            .await;
    }
}

fn config() -> ConnectionConfig {
    ConnectionConfig::builder()
        .requested_heartbeat(Duration::ZERO)
        .build()
}

#[tokio::test]
async fn publisher_confirms_resolve_on_cumulative_ack() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let broker = tokio::spawn(async move {
        let mut broker = Broker::accept(server_io).await;
        broker.accept_channel(1).await;

        let (ch, method) = broker.recv_method().await;
        assert_eq!(ch, 1);
        assert!(matches!(method, Method::QueueDeclare(_)));
        broker
            .send(Frame::method(
                1,
                Method::QueueDeclareOk(queue::DeclareOk {
                    queue: "q".try_into().unwrap(),
                    message_count: 0,
                    consumer_count: 0,
                }),
            ))
            .await;

        let (_, method) = broker.recv_method().await;
        assert!(matches!(method, Method::ConfirmSelect(_)));
        broker
            .send(Frame::method(1, Method::ConfirmSelectOk))
            .await;

        for i in 0..3 {
            let (_, method) = broker.recv_method().await;
            assert!(matches!(method, Method::BasicPublish(_)));
            let (_, body) = broker.recv_content().await;
            assert_eq!(&body[..], format!("msg-{i}").as_bytes());
        }
        // one cumulative ack settles all three
        broker
            .send(Frame::method(
                1,
                Method::BasicAck(basic::Ack {
                    delivery_tag: 3,
                    multiple: true,
                }),
            ))
            .await;

        broker.accept_shutdown(&[1]).await;
    });

    let connection = Connection::open_with_stream(client_io, config())
        .await
        .unwrap();
    let channel = connection.open_channel().await.unwrap();
    let info = channel
        .queue_declare(
            "q",
            QueueDeclareOptions {
                exclusive: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(info.name, "q");

    channel.confirm_select().await.unwrap();
    assert_eq!(channel.next_publish_seq(), 1);

    let mut confirmations = Vec::new();
    for i in 0..3 {
        let confirmation = channel
            .basic_publish(
                "",
                "q",
                Default::default(),
                Default::default(),
                Bytes::from(format!("msg-{i}")),
            )
            .await
            .unwrap();
        confirmations.push(confirmation);
    }
    for confirmation in confirmations {
        assert_eq!(confirmation.await.unwrap(), ConfirmOutcome::Ack);
    }
    assert_eq!(channel.next_publish_seq(), 4);

    connection.close().await.unwrap();
    broker.await.unwrap();
}

#[tokio::test]
async fn precondition_failure_closes_only_the_channel() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let broker = tokio::spawn(async move {
        let mut broker = Broker::accept(server_io).await;
        broker.accept_channel(1).await;

        let (_, method) = broker.recv_method().await;
        assert!(matches!(method, Method::QueueDeclare(_)));
        broker
            .send(Frame::method(
                1,
                Method::ChannelClose(channel_methods::Close {
                    reply_code: reply_code::PRECONDITION_FAILED,
                    reply_text: "PRECONDITION_FAILED - durable mismatch".try_into().unwrap(),
                    class_id: 50,
                    method_id: 10,
                }),
            ))
            .await;
        let (ch, method) = broker.recv_method().await;
        assert_eq!(ch, 1);
        assert!(matches!(method, Method::ChannelCloseOk));

        // the connection survives: a fresh channel reuses the freed id
        broker.accept_channel(1).await;
        broker.accept_shutdown(&[1]).await;
    });

    let connection = Connection::open_with_stream(client_io, config())
        .await
        .unwrap();
    let channel = connection.open_channel().await.unwrap();

    let err = channel
        .queue_declare("q", QueueDeclareOptions::default())
        .await
        .unwrap_err();
    match err {
        Error::ChannelClosed {
            reply_code: 406,
            class_id: 50,
            method_id: 10,
            ..
        } => {}
        other => panic!("expected 406 channel close, got {other:?}"),
    }
    assert!(!channel.is_open());

    // the channel instance is terminal
    let err = channel
        .queue_declare("q", QueueDeclareOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::ChannelClosed { reply_code: 406, .. }));

    // but the connection is not; the freed id is reusable because no
    // live channel holds it
    assert!(connection.is_open());
    let second = connection.open_channel().await.unwrap();
    assert_eq!(second.id(), 1);

    connection.close().await.unwrap();
    broker.await.unwrap();
}

#[tokio::test]
async fn deliveries_reach_the_consumer_callback() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let broker = tokio::spawn(async move {
        let mut broker = Broker::accept(server_io).await;
        broker.accept_channel(1).await;

        let (_, method) = broker.recv_method().await;
        let Method::BasicConsume(consume) = method else {
            panic!("expected basic.consume, got {method:?}");
        };
        assert_eq!(consume.queue.as_str(), "q");
        broker
            .send(Frame::method(
                1,
                Method::BasicConsumeOk(basic::ConsumeOk {
                    consumer_tag: "ctag-1".try_into().unwrap(),
                }),
            ))
            .await;

        broker.deliver(1, "ctag-1", 7, b"hello coney").await;

        // the callback acks
        let (_, method) = broker.recv_method().await;
        let Method::BasicAck(ack) = method else {
            panic!("expected basic.ack, got {method:?}");
        };
        assert_eq!(ack.delivery_tag, 7);

        broker.accept_shutdown(&[1]).await;
    });

    let connection = Connection::open_with_stream(client_io, config())
        .await
        .unwrap();
    let channel = connection.open_channel().await.unwrap();

    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::channel::<Bytes>(4);
    let ack_channel = channel.clone();
    let handler: DeliveryHandler = Arc::new(move |delivery| {
        let seen_tx = seen_tx.clone();
        let channel: Channel = ack_channel.clone();
        Box::pin(async move {
            let _ = channel.basic_ack(delivery.delivery_tag, false).await;
            let _ = seen_tx.send(delivery.body).await;
        })
    });
    let tag = channel
        .basic_consume("q", "", ConsumeOptions::default(), handler)
        .await
        .unwrap();
    assert_eq!(tag, "ctag-1");

    let body = seen_rx.recv().await.unwrap();
    assert_eq!(&body[..], b"hello coney");

    connection.close().await.unwrap();
    broker.await.unwrap();
}

#[tokio::test]
async fn close_with_unconfirmed_publish_leaves_no_handle_pending() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let broker = tokio::spawn(async move {
        let mut broker = Broker::accept(server_io).await;
        broker.accept_channel(1).await;

        let (_, method) = broker.recv_method().await;
        assert!(matches!(method, Method::ConfirmSelect(_)));
        broker
            .send(Frame::method(1, Method::ConfirmSelectOk))
            .await;

        let (_, method) = broker.recv_method().await;
        assert!(matches!(method, Method::BasicPublish(_)));
        let _ = broker.recv_content().await;

        // never ack; the client closes with the confirm outstanding
        broker.accept_shutdown(&[1]).await;
    });

    let connection = Connection::open_with_stream(client_io, config())
        .await
        .unwrap();
    let channel = connection.open_channel().await.unwrap();
    channel.confirm_select().await.unwrap();

    let confirmation = channel
        .basic_publish("", "q", Default::default(), Default::default(), "m".into())
        .await
        .unwrap();

    connection.close().await.unwrap();
    assert!(matches!(
        confirmation.await,
        Err(Error::OperationInterrupted)
    ));
    broker.await.unwrap();
}

#[tokio::test]
async fn a_stalled_consumer_does_not_block_other_channels() {
    let (client_io, server_io) = tokio::io::duplex(4 * 1024 * 1024);

    let broker = tokio::spawn(async move {
        let mut broker = Broker::accept(server_io).await;

        // channel 1: tight prefetch window, consumer that will stall
        broker.accept_channel(1).await;
        let (ch, method) = broker.recv_method().await;
        assert_eq!(ch, 1);
        assert!(matches!(method, Method::BasicQos(_)));
        broker.send(Frame::method(1, Method::BasicQosOk)).await;
        let (_, method) = broker.recv_method().await;
        let Method::BasicConsume(consume) = method else {
            panic!("expected basic.consume, got {method:?}");
        };
        assert_eq!(consume.consumer_tag.as_str(), "slow");
        broker
            .send(Frame::method(
                1,
                Method::BasicConsumeOk(basic::ConsumeOk {
                    consumer_tag: "slow".try_into().unwrap(),
                }),
            ))
            .await;

        // channel 2: a healthy consumer
        broker.accept_channel(2).await;
        let (ch, method) = broker.recv_method().await;
        assert_eq!(ch, 2);
        let Method::BasicConsume(consume) = method else {
            panic!("expected basic.consume, got {method:?}");
        };
        assert_eq!(consume.consumer_tag.as_str(), "fast");
        broker
            .send(Frame::method(
                2,
                Method::BasicConsumeOk(basic::ConsumeOk {
                    consumer_tag: "fast".try_into().unwrap(),
                }),
            ))
            .await;

        // flood the stalled channel far past its prefetch window, its
        // delivery queue, and its dispatcher queue
        for tag in 1..=300u64 {
            broker.deliver(1, "slow", tag, b"backlog").await;
        }
        // the reader must still be pulling from the socket and serving
        // the other channel
        broker.deliver(2, "fast", 1, b"for-the-live-channel").await;

        // the healthy consumer acks; waiting for it keeps the transport
        // alive until the delivery has demonstrably gone through
        let (ch, method) = broker.recv_method().await;
        assert_eq!(ch, 2);
        assert!(matches!(method, Method::BasicAck(_)), "{method:?}");
    });

    let connection = Connection::open_with_stream(
        client_io,
        ConnectionConfig::builder()
            .requested_heartbeat(Duration::ZERO)
            .automatic_recovery(false)
            .build(),
    )
    .await
    .unwrap();

    let slow = connection.open_channel().await.unwrap();
    slow.basic_qos(4, false).await.unwrap();
    let stalled: DeliveryHandler = Arc::new(|_delivery| {
        Box::pin(async {
            std::future::pending::<()>().await;
        })
    });
    slow.basic_consume("s", "slow", ConsumeOptions::default(), stalled)
        .await
        .unwrap();

    let fast = connection.open_channel().await.unwrap();
    let (fast_tx, mut fast_rx) = tokio::sync::mpsc::channel::<Bytes>(4);
    let ack_channel = fast.clone();
    let handler: DeliveryHandler = Arc::new(move |delivery| {
        let fast_tx = fast_tx.clone();
        let channel = ack_channel.clone();
        Box::pin(async move {
            let _ = fast_tx.send(delivery.body).await;
            let _ = channel.basic_ack(delivery.delivery_tag, false).await;
        })
    });
    fast.basic_consume("f", "fast", ConsumeOptions::default(), handler)
        .await
        .unwrap();

    let body = tokio::time::timeout(Duration::from_secs(10), fast_rx.recv())
        .await
        .expect("the reader stalled behind the blocked channel")
        .unwrap();
    assert_eq!(&body[..], b"for-the-live-channel");

    // no orderly shutdown: channel 1 is wedged by design, so the test
    // tears everything down with the runtime
    broker.await.unwrap();
}

#[tokio::test]
async fn second_rpc_while_one_is_outstanding_fails_fast() {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);

    let broker = tokio::spawn(async move {
        let mut broker = Broker::accept(server_io).await;
        broker.accept_channel(1).await;

        let (_, method) = broker.recv_method().await;
        assert!(matches!(method, Method::QueueDeclare(_)));
        // hold the reply back long enough for the client to trip over
        // the occupied RPC slot
        tokio::time::sleep(Duration::from_millis(200)).await;
        broker
            .send(Frame::method(
                1,
                Method::QueueDeclareOk(queue::DeclareOk {
                    queue: "q".try_into().unwrap(),
                    message_count: 0,
                    consumer_count: 0,
                }),
            ))
            .await;

        broker.accept_shutdown(&[1]).await;
    });

    let connection = Connection::open_with_stream(client_io, config())
        .await
        .unwrap();
    let channel = connection.open_channel().await.unwrap();

    let first = {
        let channel = channel.clone();
        tokio::spawn(async move {
            channel
                .queue_declare("q", QueueDeclareOptions::default())
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = channel
        .queue_declare("other", QueueDeclareOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::RpcAlreadyPending));

    let info = first.await.unwrap().unwrap();
    assert_eq!(info.name, "q");

    connection.close().await.unwrap();
    broker.await.unwrap();
}

#[tokio::test]
async fn large_bodies_are_fragmented_at_the_negotiated_frame_max() {
    let (client_io, server_io) = tokio::io::duplex(1024 * 1024);

    let payload = vec![0x5Au8; 300_000];
    let expected = payload.clone();

    let broker = tokio::spawn(async move {
        let mut broker = Broker::accept(server_io).await;
        broker.accept_channel(1).await;

        let (_, method) = broker.recv_method().await;
        assert!(matches!(method, Method::BasicPublish(_)));
        // recv_content reassembles the body frames; the codec on this
        // side enforces no limit, the client must have split at the
        // negotiated 131072
        let (_, body) = broker.recv_content().await;
        assert_eq!(body.len(), expected.len());
        assert_eq!(&body[..], &expected[..]);

        broker.accept_shutdown(&[1]).await;
    });

    let connection = Connection::open_with_stream(client_io, config())
        .await
        .unwrap();
    let channel = connection.open_channel().await.unwrap();
    channel
        .basic_publish(
            "",
            "q",
            Default::default(),
            Default::default(),
            Bytes::from(payload),
        )
        .await
        .unwrap();

    connection.close().await.unwrap();
    broker.await.unwrap();
}

#[tokio::test]
async fn recovery_redeclares_topology_and_consumers() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::channel::<Bytes>(4);

    let broker = tokio::spawn(async move {
        // first connection: declare + consume, then drop the transport
        let (stream, _) = listener.accept().await.unwrap();
        let mut broker = Broker::accept(stream).await;
        broker.accept_channel(1).await;

        let (_, method) = broker.recv_method().await;
        assert!(matches!(method, Method::QueueDeclare(_)));
        broker
            .send(Frame::method(
                1,
                Method::QueueDeclareOk(queue::DeclareOk {
                    queue: "r".try_into().unwrap(),
                    message_count: 0,
                    consumer_count: 0,
                }),
            ))
            .await;

        let (_, method) = broker.recv_method().await;
        assert!(matches!(method, Method::BasicConsume(_)));
        broker
            .send(Frame::method(
                1,
                Method::BasicConsumeOk(basic::ConsumeOk {
                    consumer_tag: "my-consumer".try_into().unwrap(),
                }),
            ))
            .await;

        drop(broker); // involuntary disconnect

        // second connection: the client recovers and replays
        let (stream, _) = listener.accept().await.unwrap();
        let mut broker = Broker::accept(stream).await;

        // surviving user channel rebinds first
        broker.accept_channel(1).await;

        // the topology replay channel redeclares the queue
        broker.accept_channel(2).await;
        let (ch, method) = broker.recv_method().await;
        assert_eq!(ch, 2);
        let Method::QueueDeclare(declare) = method else {
            panic!("expected queue.declare during replay, got {method:?}");
        };
        assert_eq!(declare.queue.as_str(), "r");
        broker
            .send(Frame::method(
                2,
                Method::QueueDeclareOk(queue::DeclareOk {
                    queue: "r".try_into().unwrap(),
                    message_count: 0,
                    consumer_count: 0,
                }),
            ))
            .await;
        let (ch, method) = broker.recv_method().await;
        assert_eq!(ch, 2);
        assert!(matches!(method, Method::ChannelClose(_)));
        broker.send(Frame::method(2, Method::ChannelCloseOk)).await;

        // the consumer is re-registered with its original tag
        let (ch, method) = broker.recv_method().await;
        assert_eq!(ch, 1);
        let Method::BasicConsume(consume) = method else {
            panic!("expected basic.consume during replay, got {method:?}");
        };
        assert_eq!(consume.consumer_tag.as_str(), "my-consumer");
        assert_eq!(consume.queue.as_str(), "r");
        broker
            .send(Frame::method(
                1,
                Method::BasicConsumeOk(basic::ConsumeOk {
                    consumer_tag: "my-consumer".try_into().unwrap(),
                }),
            ))
            .await;

        // and deliveries flow again
        broker.deliver(1, "my-consumer", 1, b"post-recovery").await;
        broker.accept_shutdown(&[1]).await;
    });

    let config = ConnectionConfig::builder()
        .endpoint(Endpoint::new("127.0.0.1", port))
        .requested_heartbeat(Duration::ZERO)
        .network_recovery_interval(Duration::from_millis(50))
        .build();
    let connection = Connection::open(config).await.unwrap();
    let channel = connection.open_channel().await.unwrap();
    channel
        .queue_declare("r", QueueDeclareOptions::default())
        .await
        .unwrap();

    let handler: DeliveryHandler = Arc::new(move |delivery| {
        let seen_tx = seen_tx.clone();
        Box::pin(async move {
            let _ = seen_tx.send(delivery.body).await;
        })
    });
    channel
        .basic_consume("r", "my-consumer", ConsumeOptions::default(), handler)
        .await
        .unwrap();

    // the broker drops the transport now; wait for the post-recovery
    // delivery to prove the consumer was re-registered
    let body = tokio::time::timeout(Duration::from_secs(10), seen_rx.recv())
        .await
        .expect("recovery did not complete in time")
        .unwrap();
    assert_eq!(&body[..], b"post-recovery");

    let mut status = connection.watch_status();
    while *status.borrow_and_update() != ConnectionStatus::Open {
        status.changed().await.unwrap();
    }

    connection.close().await.unwrap();
    broker.await.unwrap();
}
