//! Error types, layered the way the runtime is: transport faults feed
//! handshake/connect errors during dialing and the operation-level [`Error`]
//! afterwards.

use std::io;

use coney_codec::constants::is_hard_error;

/// Error on the framed transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// IO error from the socket
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    /// Malformed wire data
    #[error(transparent)]
    Codec(#[from] coney_codec::Error),

    /// Nothing was read for two heartbeat intervals
    #[error("Missed heartbeats from peer")]
    HeartbeatTimeout,
}

/// Error during the connection handshake
#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    /// IO error from the socket
    #[error("IO Error {0:?}")]
    Io(#[from] io::Error),

    /// Transport error while exchanging handshake frames
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The server answered the protocol header with something else,
    /// usually its own supported protocol version
    #[error("Protocol header mismatch. Found {0:?}")]
    ProtocolHeaderMismatch(Vec<u8>),

    /// No SASL mechanism in common with the server
    #[error("No SASL mechanism in common. Server offers {server:?}")]
    MechanismMismatch {
        /// The mechanisms the server advertised
        server: String,
    },

    /// The server refused the credentials
    #[error("Authentication failure: {0}")]
    AuthFailure(String),

    /// The server closed the connection during the handshake
    #[error("Server closed connection during handshake: {reply_code} {reply_text}")]
    ServerClosed {
        /// Reply code from `connection.close`
        reply_code: u16,
        /// Reply text from `connection.close`
        reply_text: String,
    },

    /// A method arrived that is illegal in the current handshake step
    #[error("Unexpected method during handshake: {0}")]
    UnexpectedMethod(String),

    /// A handshake step exceeded the handshake continuation timeout
    #[error("Handshake step timed out")]
    Timeout,
}

/// Error establishing a connection
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// Every candidate endpoint failed; carries the last underlying error
    #[error("No broker endpoint reachable after {attempts} attempts")]
    BrokerUnreachable {
        /// Number of endpoints tried
        attempts: usize,
        /// The last underlying IO error
        #[source]
        last: io::Error,
    },

    /// The handshake failed in a way retrying another endpoint cannot fix
    #[error(transparent)]
    Handshake(#[from] HandshakeError),

    /// The URI or endpoint list could not be parsed
    #[error("Invalid AMQP URI: {0}")]
    InvalidUri(String),

    /// No endpoints were configured
    #[error("No endpoints configured")]
    NoEndpoints,
}

/// Error raised by channel and connection operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The channel was closed by a soft server error; the channel is
    /// terminal, the connection survives
    #[error("Channel closed: {reply_code} {reply_text} (caused by {class_id}.{method_id})")]
    ChannelClosed {
        /// AMQP reply code, e.g. 404 or 406
        reply_code: u16,
        /// Server-provided reason
        reply_text: String,
        /// Class id of the method that triggered the close
        class_id: u16,
        /// Method id of the method that triggered the close
        method_id: u16,
    },

    /// The connection was closed, by a hard error or an orderly shutdown
    #[error("Connection closed: {reply_code} {reply_text}")]
    ConnectionClosed {
        /// AMQP reply code, 200 for an orderly close
        reply_code: u16,
        /// Server-provided reason
        reply_text: String,
    },

    /// The peer violated the framing or method protocol
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A second RPC was issued while one was already outstanding
    #[error("An RPC continuation is already outstanding on this channel")]
    RpcAlreadyPending,

    /// An in-flight operation was aborted by a channel or connection close
    #[error("Operation interrupted by channel or connection close")]
    OperationInterrupted,

    /// A continuation timed out
    #[error("Operation timed out")]
    Timeout,

    /// The caller cancelled the operation
    #[error("Operation cancelled")]
    Cancelled,

    /// All channel ids up to the negotiated channel-max are in use
    #[error("Reached connection channel max")]
    ChannelMaxReached,

    /// Transport fault that reached an operation directly
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// The reply-code context attached to a close, kept cloneable so it can be
/// fanned out to every pending operation
#[derive(Debug, Clone)]
pub struct CloseReason {
    /// AMQP reply code
    pub reply_code: u16,
    /// Server- or client-provided reason text
    pub reply_text: String,
    /// Class id of the offending method, 0 if none
    pub class_id: u16,
    /// Method id of the offending method, 0 if none
    pub method_id: u16,
}

impl CloseReason {
    pub(crate) fn channel_error(&self) -> Error {
        Error::ChannelClosed {
            reply_code: self.reply_code,
            reply_text: self.reply_text.clone(),
            class_id: self.class_id,
            method_id: self.method_id,
        }
    }

    pub(crate) fn connection_error(&self) -> Error {
        Error::ConnectionClosed {
            reply_code: self.reply_code,
            reply_text: self.reply_text.clone(),
        }
    }

    /// Whether the reply code is connection-fatal
    pub fn is_hard(&self) -> bool {
        is_hard_error(self.reply_code)
    }
}

impl From<coney_codec::Error> for Error {
    fn from(err: coney_codec::Error) -> Self {
        Self::Transport(TransportError::Codec(err))
    }
}
