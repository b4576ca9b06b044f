//! Protocol constants shared by the codec and the connection runtime

/// The literal protocol header that opens every AMQP 0-9-1 connection
pub const PROTOCOL_HEADER: [u8; 8] = *b"AMQP\x00\x00\x09\x01";

/// Type octet of a method frame
pub const FRAME_METHOD: u8 = 1;

/// Type octet of a content header frame
pub const FRAME_HEADER: u8 = 2;

/// Type octet of a content body frame
pub const FRAME_BODY: u8 = 3;

/// Type octet of a heartbeat frame
pub const FRAME_HEARTBEAT: u8 = 8;

/// The octet terminating every frame
pub const FRAME_END: u8 = 0xCE;

/// Generic overhead of a frame: 7 byte header plus the end octet
pub const FRAME_OVERHEAD: usize = 8;

/// The smallest frame-max a peer may negotiate
pub const FRAME_MIN_SIZE: u32 = 4096;

/// Reply codes carried by `connection.close` and `channel.close`
pub mod reply_code {
    /// Indicates that the method completed successfully
    pub const REPLY_SUCCESS: u16 = 200;
    /// The message could not be delivered (immediate flag)
    pub const NOT_DELIVERED: u16 = 310;
    /// The message body exceeds a server limit
    pub const CONTENT_TOO_LARGE: u16 = 311;
    /// A mandatory message could not be routed to any queue
    pub const NO_ROUTE: u16 = 312;
    /// An immediate message had no consumer ready to receive it
    pub const NO_CONSUMERS: u16 = 313;
    /// An operator forced the connection closed
    pub const CONNECTION_FORCED: u16 = 320;
    /// The virtual host path was malformed or does not exist
    pub const INVALID_PATH: u16 = 402;
    /// The client lacks permission for the resource
    pub const ACCESS_REFUSED: u16 = 403;
    /// The named entity does not exist
    pub const NOT_FOUND: u16 = 404;
    /// Another client holds an exclusive lock on the resource
    pub const RESOURCE_LOCKED: u16 = 405;
    /// The request conflicted with the current state of the resource
    pub const PRECONDITION_FAILED: u16 = 406;
    /// A malformed frame was received
    pub const FRAME_ERROR: u16 = 501;
    /// A frame contained illegal field values
    pub const SYNTAX_ERROR: u16 = 502;
    /// A method was invalid in the current state
    pub const COMMAND_INVALID: u16 = 503;
    /// A frame arrived on an invalid channel
    pub const CHANNEL_ERROR: u16 = 504;
    /// A frame of an unexpected type was received
    pub const UNEXPECTED_FRAME: u16 = 505;
    /// The server ran out of a resource
    pub const RESOURCE_ERROR: u16 = 506;
    /// The request violates a server policy
    pub const NOT_ALLOWED: u16 = 530;
    /// The method is not implemented by the peer
    pub const NOT_IMPLEMENTED: u16 = 540;
    /// The peer hit an internal error
    pub const INTERNAL_ERROR: u16 = 541;
}

/// Whether a reply code is connection-fatal (hard) as opposed to
/// channel-fatal (soft)
pub fn is_hard_error(code: u16) -> bool {
    use reply_code::*;
    matches!(
        code,
        CONNECTION_FORCED
            | INVALID_PATH
            | FRAME_ERROR
            | SYNTAX_ERROR
            | COMMAND_INVALID
            | CHANNEL_ERROR
            | UNEXPECTED_FRAME
            | RESOURCE_ERROR
            | NOT_ALLOWED
            | NOT_IMPLEMENTED
            | INTERNAL_ERROR
    )
}
