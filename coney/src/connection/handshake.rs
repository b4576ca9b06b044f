//! The connection handshake state machine
//!
//! Drives protocol-header exchange, SASL negotiation, tuning, and
//! `connection.open` over a freshly bound transport. Every step is bounded
//! by the handshake continuation timeout; a server that answers the
//! protocol header with raw bytes (its own supported version) surfaces as
//! a header mismatch rather than a codec error.

use std::time::Duration;

use coney_codec::constants::{reply_code, FRAME_MIN_SIZE};
use coney_codec::method::connection;
use coney_codec::{FieldTable, Frame, FramePayload, Method};
use futures_util::{Future, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};

use crate::config::ConnectionConfig;
use crate::error::{HandshakeError, TransportError};
use crate::sasl;
use crate::transport::Transport;

/// Limits agreed during tuning, plus what the server told us about itself
#[derive(Debug, Clone)]
pub(crate) struct Negotiated {
    /// Agreed channel-max; 0 means unlimited
    pub channel_max: u16,
    /// Agreed frame-max; never below the 4096 protocol floor
    pub frame_max: u32,
    /// Agreed heartbeat interval; zero disables heartbeats
    pub heartbeat: Duration,
    /// Server properties from `connection.start`
    pub server_properties: FieldTable,
}

/// Runs the handshake on a transport that has already sent the protocol
/// header (see [`Transport::negotiate`])
pub(crate) async fn handshake<Io>(
    mut transport: Transport<Io>,
    config: &ConnectionConfig,
) -> Result<(Transport<Io>, Negotiated), HandshakeError>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    let step_timeout = config.handshake_continuation_timeout;

    // connection.start
    let start = match step(step_timeout, recv_method(&mut transport)).await?? {
        Method::ConnectionStart(start) => start,
        other => return Err(unexpected(other)),
    };
    trace!(?start.server_properties, "RECV connection.start");

    let advertised = start.mechanisms.to_string_lossy();
    let mechanism = sasl::select(&config.auth_mechanisms, &advertised).ok_or_else(|| {
        HandshakeError::MechanismMismatch {
            server: advertised.clone(),
        }
    })?;
    debug!(mechanism = mechanism.name(), "selected SASL mechanism");

    let start_ok = connection::StartOk {
        client_properties: config.client_properties.clone(),
        mechanism: mechanism
            .name()
            .try_into()
            .map_err(|_| HandshakeError::UnexpectedMethod("mechanism name too long".into()))?,
        response: mechanism.initial_response(&config.username, &config.password),
        locale: "en_US".try_into().expect("static locale fits"),
    };
    step(
        step_timeout,
        transport.send(Frame::method(0, Method::ConnectionStartOk(start_ok))),
    )
    .await??;

    // zero or more secure/secure-ok rounds, then tune
    let tune = loop {
        match step(step_timeout, recv_method(&mut transport)).await?? {
            Method::ConnectionSecure(_challenge) => {
                let secure_ok = connection::SecureOk {
                    response: mechanism.challenge_response(&config.username, &config.password),
                };
                step(
                    step_timeout,
                    transport.send(Frame::method(0, Method::ConnectionSecureOk(secure_ok))),
                )
                .await??;
            }
            Method::ConnectionTune(tune) => break tune,
            other => return Err(unexpected(other)),
        }
    };

    let channel_max = negotiate(u32::from(config.requested_channel_max), u32::from(tune.channel_max)) as u16;
    let frame_max = match negotiate(config.requested_frame_max, tune.frame_max) {
        0 => 0,
        limited => limited.max(FRAME_MIN_SIZE),
    };
    let heartbeat = negotiate(
        config.requested_heartbeat.as_secs() as u32,
        u32::from(tune.heartbeat),
    ) as u16;
    debug!(channel_max, frame_max, heartbeat, "tuned");

    let tune_ok = connection::TuneOk {
        channel_max,
        frame_max,
        heartbeat,
    };
    step(
        step_timeout,
        transport.send(Frame::method(0, Method::ConnectionTuneOk(tune_ok))),
    )
    .await??;

    if frame_max > 0 {
        transport.set_max_frame_size(frame_max as usize);
    }

    // connection.open
    let open = connection::Open {
        virtual_host: config
            .virtual_host
            .as_str()
            .try_into()
            .map_err(|_| HandshakeError::UnexpectedMethod("virtual host too long".into()))?,
    };
    step(
        step_timeout,
        transport.send(Frame::method(0, Method::ConnectionOpen(open))),
    )
    .await??;

    match step(step_timeout, recv_method(&mut transport)).await?? {
        Method::ConnectionOpenOk(_) => {}
        other => return Err(unexpected(other)),
    }

    let heartbeat = Duration::from_secs(u64::from(heartbeat));
    arm_idle_deadline(&mut transport, heartbeat, config.socket_read_timeout);

    Ok((
        transport,
        Negotiated {
            channel_max,
            frame_max,
            heartbeat,
            server_properties: start.server_properties,
        },
    ))
}

/// Pairwise-minimum negotiation where 0 means "no limit, peer wins"
fn negotiate(client: u32, server: u32) -> u32 {
    match (client, server) {
        (0, server) => server,
        (client, 0) => client,
        (client, server) => client.min(server),
    }
}

/// Arms the read deadline: the larger of twice the heartbeat interval and
/// the socket read timeout. With heartbeats disabled the connection may
/// legitimately stay silent, so no deadline is armed.
fn arm_idle_deadline<Io>(
    transport: &mut Transport<Io>,
    heartbeat: Duration,
    socket_read_timeout: Duration,
) where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    if heartbeat.is_zero() {
        return;
    }
    let window = (heartbeat * 2).max(socket_read_timeout);
    transport.set_idle_deadline(window, true);
}

async fn step<T>(
    timeout: Duration,
    fut: impl Future<Output = T>,
) -> Result<T, HandshakeError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| HandshakeError::Timeout)
}

async fn recv_method<Io>(transport: &mut Transport<Io>) -> Result<Method, HandshakeError>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = transport
            .next()
            .await
            .ok_or_else(|| {
                HandshakeError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "server closed during handshake",
                ))
            })?
            .map_err(header_mismatch_or)?;

        match frame.payload {
            FramePayload::Method(Method::ConnectionClose(close)) => {
                return Err(close_during_handshake(close));
            }
            FramePayload::Method(method) => return Ok(method),
            FramePayload::Heartbeat => continue,
            other => {
                return Err(HandshakeError::UnexpectedMethod(format!(
                    "non-method frame during handshake: {other:?}"
                )))
            }
        }
    }
}

/// An old server rejects the protocol header by writing back the version
/// it supports as raw bytes, which the codec reports as garbage
fn header_mismatch_or(err: TransportError) -> HandshakeError {
    match err {
        TransportError::Codec(_) => HandshakeError::ProtocolHeaderMismatch(Vec::new()),
        other => HandshakeError::Transport(other),
    }
}

fn close_during_handshake(close: connection::Close) -> HandshakeError {
    if close.reply_code == reply_code::ACCESS_REFUSED {
        HandshakeError::AuthFailure(close.reply_text.to_string())
    } else {
        HandshakeError::ServerClosed {
            reply_code: close.reply_code,
            reply_text: close.reply_text.to_string(),
        }
    }
}

fn unexpected(method: Method) -> HandshakeError {
    HandshakeError::UnexpectedMethod(format!(
        "{}.{} out of place in handshake",
        method.class_id(),
        method.method_id()
    ))
}
